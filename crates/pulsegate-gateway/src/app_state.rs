//! Shared application state handed to every axum handler.
//!
//! A thin, `Clone`-cheap wrapper around `Arc<Supervisor>` plus a draining
//! flag the `Gateway` flips during shutdown (spec §4.11/§4.12).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::obs::metrics::GatewayMetrics;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    supervisor: Arc<Supervisor>,
    draining: AtomicBool,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { supervisor, draining: AtomicBool::new(false) }),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.inner.supervisor
    }

    pub fn cfg(&self) -> &GatewayConfig {
        &self.inner.supervisor.cfg
    }

    pub fn set_draining(&self, draining: bool) {
        self.inner.draining.store(draining, Ordering::Relaxed);
        if draining {
            self.metrics().set_draining();
        }
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.inner.supervisor.metrics
    }

    /// Extra ad-hoc gauge lines rendered alongside the registered metric
    /// vectors (active sessions and cluster node count, which live on
    /// components the registry does not own directly).
    pub fn metrics_extra(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("pulsegate_sessions_active_total", self.inner.supervisor.sessions.active_count() as u64),
            ("pulsegate_cluster_node_count", self.inner.supervisor.cluster.node_count() as u64),
        ]
    }
}
