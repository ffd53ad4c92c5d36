//! Ties every component together in dependency order and owns the
//! background janitors + graceful shutdown (spec §4.12).
//!
//! Construction order mirrors the leaves-first table in spec §2: breaker
//! registry -> rate limiter -> bus -> sessions -> security -> auth ->
//! cluster -> presence/typing -> router -> gateway. `sessions` moves ahead
//! of `security` because `Security` needs a `SessionCloser` handle on it
//! (spec §4.4 hard-block closes every session from the blocked IP).
//! Nothing here is a singleton;
//! `main` constructs exactly one `Supervisor` and passes it down explicitly,
//! the way the Design Notes ask components to replace "singletons for
//! fastify/app/redis".

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use pulsegate_core::contracts::{BusTransport, ContentStore, MediaTokenIssuer, SharedStore, TokenVerifier, UserDirectory};

use crate::auth::AuthGate;
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::bus::Bus;
use crate::cluster::Coordinator;
use crate::config::GatewayConfig;
use crate::obs::metrics::GatewayMetrics;
use crate::presence::PresenceTracker;
use crate::ratelimit::{Action, ActionLimits, SlidingWindowLimiter};
use crate::router::Router;
use crate::security::Security;
use crate::session::registry::SessionRegistry;
use crate::typing::TypingTracker;

/// External collaborators this deployment is wired to (spec §1's named
/// contracts). A dev binary wires `infra::DevCollaborators` + a
/// `NoopBusTransport`; a production deployment swaps in real clients behind
/// the same traits.
pub struct Collaborators {
    pub directory: Arc<dyn UserDirectory>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub content: Arc<dyn ContentStore>,
    pub media: Arc<dyn MediaTokenIssuer>,
    pub store: Arc<dyn SharedStore>,
    pub transport: Option<Arc<dyn BusTransport>>,
}

/// Resolves config `rate_limits` overrides (keyed by [`Action::as_str`]) onto
/// the action table; unrecognized keys are ignored rather than rejected,
/// since config parsing already denies unknown top-level fields.
fn action_limits_from_config(cfg: &GatewayConfig) -> ActionLimits {
    const ACTIONS: &[Action] = &[
        Action::Connect,
        Action::AuthAttempt,
        Action::MessageSend,
        Action::MessageEdit,
        Action::MessageDelete,
        Action::TypingStartStop,
        Action::PresenceUpdate,
        Action::VoiceJoin,
        Action::ChannelJoinLeave,
        Action::DmSend,
        Action::ModerationKick,
        Action::ModerationBan,
        Action::Default,
    ];
    let mut limits = ActionLimits::default();
    for action in ACTIONS {
        if let Some(over) = cfg.rate_limits.get(action.as_str()) {
            limits = limits.with_override(*action, over.limit, std::time::Duration::from_secs(over.window_seconds));
        }
    }
    limits
}

/// Spec §7: "The Supervisor exits only on combined bus+store unreachable
/// for STARTUP_GRACE=120s during boot." Either dependency alone recovering
/// is enough to proceed.
pub const STARTUP_GRACE: Duration = Duration::from_secs(120);
const STARTUP_RETRY_INTERVAL: Duration = Duration::from_secs(2);

pub struct Supervisor {
    pub node_id: String,
    pub cfg: GatewayConfig,
    pub breakers: Arc<BreakerRegistry>,
    pub rate_limiter: Arc<SlidingWindowLimiter>,
    pub bus: Arc<Bus>,
    pub security: Arc<Security>,
    pub auth_gate: Arc<AuthGate>,
    pub sessions: Arc<SessionRegistry>,
    pub cluster: Arc<Coordinator>,
    pub presence: Arc<PresenceTracker>,
    pub typing: Arc<TypingTracker>,
    pub router: Arc<Router>,
    pub metrics: Arc<GatewayMetrics>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(cfg: GatewayConfig, collaborators: Collaborators) -> Arc<Self> {
        let node_id = cfg.gateway.node_id.clone().unwrap_or_else(crate::config::derive_node_id);

        let metrics = Arc::new(GatewayMetrics::default());
        let breakers = Arc::new(BreakerRegistry::with_observer(
            BreakerConfig {
                threshold: cfg.breaker.threshold,
                cooldown: std::time::Duration::from_millis(cfg.breaker.cooldown_ms),
                probe_successes_required: cfg.breaker.probe_successes_required,
            },
            Arc::new(crate::obs::metrics::MetricsObserver(metrics.clone())),
        ));

        let rate_limiter = Arc::new(SlidingWindowLimiter::new(action_limits_from_config(&cfg)));
        let bus = Arc::new(Bus::new(node_id.clone(), collaborators.transport.clone()));

        let sessions = Arc::new(SessionRegistry::default());

        let security = Arc::new(Security::new(
            cfg.security.ddos_threshold,
            cfg.security.max_payload_bytes,
            cfg.security.allowed_countries.clone(),
            cfg.security.blocked_countries.clone(),
            rate_limiter.clone(),
            sessions.clone(),
        ));

        let auth_gate = Arc::new(AuthGate::new(
            collaborators.verifier.clone(),
            collaborators.directory.clone(),
            breakers.clone(),
            rate_limiter.clone(),
            sessions.clone(),
            cfg.auth.allow_anonymous,
            cfg.auth.max_concurrent_sessions,
        ));

        let cluster = Arc::new(Coordinator::new(
            collaborators.store.clone(),
            bus.clone(),
            breakers.clone(),
            node_id.clone(),
            cfg.gateway.host.clone(),
            cfg.gateway.port,
            env!("CARGO_PKG_VERSION").to_string(),
        ));

        let presence = Arc::new(PresenceTracker::new(collaborators.store.clone(), bus.clone(), collaborators.directory.clone(), breakers.clone(), node_id.clone()));

        let typing = Arc::new(TypingTracker::new(bus.clone(), rate_limiter.clone(), collaborators.store.clone()));

        let router = Arc::new(Router {
            rate_limiter: rate_limiter.clone(),
            security: security.clone(),
            content_store: collaborators.content.clone(),
            media_issuer: collaborators.media.clone(),
            typing: typing.clone(),
            presence: presence.clone(),
            bus: bus.clone(),
            breakers: breakers.clone(),
        });

        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            node_id,
            cfg,
            breakers,
            rate_limiter,
            bus,
            security,
            auth_gate,
            sessions,
            cluster,
            presence,
            typing,
            router,
            metrics,
            shutdown_tx,
        })
    }

    /// Registers with the cluster and spawns every background janitor
    /// (spec §4.12): rate-limit GC every 10 min, typing GC every 30 s,
    /// presence GC every 5 min, security GC every 5 min, cluster health
    /// every 30 s, metrics publish every 60 s.
    pub async fn start(self: &Arc<Self>) -> pulsegate_core::error::Result<()> {
        self.await_startup_dependencies().await?;

        self.spawn_bus_reconnect_loop();
        self.spawn_node_left_handler();
        self.typing.spawn_mirror(self.node_id.clone());

        self.spawn_janitor("typing_reconcile", crate::typing::RECONCILE_INTERVAL, {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move { this.typing.reconcile().await }
            }
        });

        self.spawn_janitor("cluster_heartbeat", crate::cluster::HEARTBEAT_INTERVAL, {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move {
                    let _ = this.cluster.heartbeat(this.sessions.active_count() as u64, 0.0).await;
                }
            }
        });

        self.spawn_janitor("cluster_health", crate::cluster::HEALTH_INTERVAL, {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move {
                    if let Err(e) = this.cluster.scan().await {
                        tracing::warn!(error = %e, "cluster health scan failed");
                    }
                }
            }
        });

        self.spawn_janitor("rate_limit_gc", std::time::Duration::from_secs(10 * 60), {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move { this.rate_limiter.gc(std::time::Duration::from_secs(10 * 60)).await }
            }
        });

        self.spawn_janitor("typing_gc", crate::typing::GC_INTERVAL, {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move { this.typing.gc() }
            }
        });

        self.spawn_janitor("presence_gc", std::time::Duration::from_secs(5 * 60), {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move { this.presence.gc() }
            }
        });

        self.spawn_janitor("security_gc", std::time::Duration::from_secs(5 * 60), {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move { this.security.gc().await }
            }
        });

        self.spawn_janitor("metrics_publish", std::time::Duration::from_secs(60), {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move {
                    let _ = this
                        .bus
                        .publish(
                            &format!("health.{}", this.node_id),
                            "health.snapshot",
                            serde_json::json!({
                                "node_id": this.node_id,
                                "sessions_active": this.sessions.active_count(),
                                "bus_messages_dropped": this.bus.messages_dropped(),
                            }),
                            crate::bus::PublishOpts { priority: pulsegate_core::protocol::Priority::Low, ..Default::default() },
                        )
                        .await;
                }
            }
        });

        Ok(())
    }

    /// Blocks boot until the cluster store or the bus transport is
    /// reachable, retrying both every `STARTUP_RETRY_INTERVAL` for up to
    /// `STARTUP_GRACE`. Only a combined, sustained failure of both is fatal
    /// (spec §7); a node can come up serving local traffic on a degraded
    /// store or bus and let its janitors keep retrying afterward.
    async fn await_startup_dependencies(self: &Arc<Self>) -> pulsegate_core::error::Result<()> {
        let deadline = Instant::now() + STARTUP_GRACE;
        loop {
            let store_result = self.cluster.register(self.sessions.active_count() as u64, 0.0).await;
            let bus_result = self.bus.probe().await;

            match (store_result, bus_result) {
                (Ok(()), bus_result) => {
                    if let Err(e) = bus_result {
                        tracing::warn!(error = %e, "bus unreachable at boot, continuing on store registration alone");
                    }
                    return Ok(());
                }
                (Err(store_err), Ok(())) => {
                    tracing::warn!(error = %store_err, "cluster store unreachable at boot, continuing on bus alone");
                    return Ok(());
                }
                (Err(store_err), Err(bus_err)) => {
                    if Instant::now() >= deadline {
                        tracing::error!(store_error = %store_err, bus_error = %bus_err, "bus and store both unreachable past startup grace period");
                        return Err(store_err);
                    }
                    tracing::warn!(store_error = %store_err, bus_error = %bus_err, "bus and store both unreachable, retrying within startup grace period");
                    tokio::time::sleep(STARTUP_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Spawns a periodic janitor loop that stops as soon as shutdown is
    /// signalled; a single janitor panicking or erroring never kills its
    /// peers (spec §7 "a single janitor failure never kills peers").
    fn spawn_janitor<F, Fut>(&self, name: &'static str, interval: std::time::Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tick().await;
                    }
                    _ = shutdown.recv() => {
                        tracing::info!(janitor = name, "janitor stopping on shutdown");
                        break;
                    }
                }
            }
        });
    }

    /// Drives `Bus::reconnect_once` while the bus isn't connected (spec
    /// §4.3). Polls `transport_state` cheaply while connected; once it
    /// drops, every iteration backs off and retries until reconnected.
    fn spawn_bus_reconnect_loop(self: &Arc<Self>) {
        let bus = self.bus.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if matches!(bus.transport_state().await, crate::bus::TransportState::Connected) {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                        _ = shutdown.recv() => break,
                    }
                }
                tokio::select! {
                    _ = bus.reconnect_once() => {}
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Subscribes to `cluster.node.left` and repairs presence for the
    /// departed node's users (spec §4.10 failover).
    fn spawn_node_left_handler(self: &Arc<Self>) {
        let (_, mailbox) = self.bus.subscribe("cluster.node.left");
        let presence = self.presence.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = mailbox.recv() => {
                        if let Some(node_id) = envelope.payload.get("node_id").and_then(|v| v.as_str()) {
                            if let Err(e) = presence.on_node_left(node_id).await {
                                tracing::warn!(error = %e, node_id, "presence cleanup on node departure failed");
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Subscribe to the shutdown broadcast; every session task holds one so
    /// it can close itself without the registry having to reach in.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcasts the shutdown signal to every janitor and live session.
    /// Idempotent: a `broadcast::Sender` with no receivers left is not an
    /// error, it just means every consumer has already observed a prior send.
    pub fn broadcast_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Deregisters from the cluster. Callers must have already called
    /// [`Supervisor::broadcast_shutdown`] (directly, or via
    /// `gateway::Gateway::drain`) so sessions and janitors have had a chance
    /// to stop before this node disappears from the cluster view.
    pub async fn shutdown(&self) {
        self.broadcast_shutdown();
        if let Err(e) = self.cluster.deregister().await {
            tracing::warn!(error = %e, "cluster deregister failed during shutdown");
        }
    }
}
