//! Circuit breaker guarding any external call (spec §4.1).
//!
//! One [`CircuitBreaker`] per named dependency, held behind `Arc` in a
//! [`BreakerRegistry`] the way `TenantPolicyRuntime` holds its `RateLimiter`
//! behind a `Mutex` and `Dispatcher` shards services in a `DashMap`.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use pulsegate_core::error::{PulseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Feeds breaker state transitions to `obs::metrics`.
pub trait Observer: Send + Sync {
    fn on_state_change(&self, name: &'static str, from: BreakerState, to: BreakerState);
}

pub struct NoopObserver;
impl Observer for NoopObserver {
    fn on_state_change(&self, _name: &'static str, _from: BreakerState, _to: BreakerState) {}
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// Tunables for one breaker instance (spec §4.1 defaults).
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
    pub probe_successes_required: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(30),
            probe_successes_required: 3,
        }
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
    half_open_permit: AtomicU32,
    observer: std::sync::Arc<dyn Observer>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, cfg: BreakerConfig) -> Self {
        Self::with_observer(name, cfg, std::sync::Arc::new(NoopObserver))
    }

    pub fn with_observer(name: &'static str, cfg: BreakerConfig, observer: std::sync::Arc<dyn Observer>) -> Self {
        Self {
            name,
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
            half_open_permit: AtomicU32::new(0),
            observer,
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Run `op` guarded by this breaker. Short-circuits with
    /// [`PulseError::Unavailable`] while open.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.admit().await? {
            return Err(PulseError::Unavailable(self.name));
        }

        match op().await {
            Ok(v) => {
                self.on_success().await;
                Ok(v)
            }
            Err(e) => {
                self.on_failure().await;
                Err(e)
            }
        }
    }

    /// Returns `true` if a call may proceed right now, transitioning
    /// open -> half-open when the cooldown has elapsed. At most one caller
    /// is admitted while half-open.
    async fn admit(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(true),
            BreakerState::HalfOpen => {
                // Only the first caller after transition gets the probe slot.
                Ok(self.half_open_permit.fetch_add(1, Ordering::SeqCst) == 0)
            }
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cfg.cooldown {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.success_count = 0;
                    self.half_open_permit.store(0, Ordering::SeqCst);
                    Ok(self.half_open_permit.fetch_add(1, Ordering::SeqCst) == 0)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.cfg.probe_successes_required {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    self.transition(&mut inner, BreakerState::Closed);
                } else {
                    // Probe succeeded but the threshold isn't met yet; admit
                    // exactly one more probe call.
                    self.half_open_permit.store(0, Ordering::SeqCst);
                }
            }
            BreakerState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.cfg.threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        if inner.state != to {
            let from = inner.state;
            inner.state = to;
            self.observer.on_state_change(self.name, from, to);
            tracing::info!(breaker = self.name, ?from, ?to, "breaker state change");
        }
    }
}

/// Registry of one breaker per named dependency (spec: "used uniformly for
/// bus/database/auth calls").
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<&'static str, std::sync::Arc<CircuitBreaker>>,
    cfg: BreakerConfig,
    observer: Option<std::sync::Arc<dyn Observer>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            cfg,
            observer: None,
        }
    }

    pub fn with_observer(cfg: BreakerConfig, observer: std::sync::Arc<dyn Observer>) -> Self {
        Self {
            breakers: DashMap::new(),
            cfg,
            observer: Some(observer),
        }
    }

    pub fn get(&self, name: &'static str) -> std::sync::Arc<CircuitBreaker> {
        self.breakers
            .entry(name)
            .or_insert_with(|| match &self.observer {
                Some(observer) => std::sync::Arc::new(CircuitBreaker::with_observer(name, self.cfg, observer.clone())),
                None => std::sync::Arc::new(CircuitBreaker::new(name, self.cfg)),
            })
            .clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cfg = BreakerConfig {
            threshold: 2,
            cooldown: Duration::from_millis(20),
            probe_successes_required: 1,
        };
        let breaker = CircuitBreaker::new("dep", cfg);

        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>(PulseError::Internal("x".into())) }).await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);

        let res = breaker.call(|| async { Ok::<_, PulseError>(()) }).await;
        assert!(matches!(res, Err(PulseError::Unavailable("dep"))));
    }

    #[tokio::test]
    async fn half_open_closes_after_probe_successes() {
        let cfg = BreakerConfig {
            threshold: 1,
            cooldown: Duration::from_millis(10),
            probe_successes_required: 2,
        };
        let breaker = CircuitBreaker::new("dep", cfg);
        let _ = breaker.call(|| async { Err::<(), _>(PulseError::Internal("x".into())) }).await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(15)).await;
        let _ = breaker.call(|| async { Ok::<_, PulseError>(()) }).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        let _ = breaker.call(|| async { Ok::<_, PulseError>(()) }).await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn no_calls_reach_dependency_while_open() {
        let cfg = BreakerConfig {
            threshold: 1,
            cooldown: Duration::from_secs(30),
            probe_successes_required: 1,
        };
        let breaker = CircuitBreaker::new("dep", cfg);
        let _ = breaker.call(|| async { Err::<(), _>(PulseError::Internal("x".into())) }).await;

        let calls = std::sync::atomic::AtomicU32::new(0);
        for _ in 0..5 {
            let _ = breaker
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PulseError>(())
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
