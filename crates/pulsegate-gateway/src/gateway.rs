//! HTTP/WebSocket surface and connection-draining shutdown (spec §4.11).
//!
//! Route wiring for the HTTP/WebSocket surface; the session lifecycle
//! itself lives in `transport::ws`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;

use crate::app_state::AppState;
use crate::ops;
use crate::supervisor::Supervisor;
use crate::transport::ws;

pub struct Gateway {
    pub state: AppState,
}

impl Gateway {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { state: AppState::new(supervisor) }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/ws", get(ws::ws_upgrade))
            .route("/healthz", get(ops::healthz))
            .route("/readyz", get(ops::readyz))
            .route("/metrics", get(ops::metrics))
            .with_state(self.state.clone())
    }

    /// Graceful shutdown (spec §4.11 "Drain"): stop accepting new
    /// connections, publish `cluster.node.leaving`, send every live session
    /// its shutdown notice, then wait up to `drain_deadline_ms` for them to
    /// close on their own before giving up on stragglers and deregistering.
    ///
    /// Must run and return *before* the caller awaits on the surrounding
    /// `axum::serve(...).with_graceful_shutdown(...)` future: hyper only
    /// stops accepting once that future resolves, then waits for every
    /// in-flight connection to finish on its own — nothing closes a live
    /// WebSocket unless the shutdown broadcast has already gone out, so this
    /// must fire the broadcast itself rather than wait for `serve()` to
    /// return first.
    pub async fn drain(&self) {
        let supervisor = self.state.supervisor();
        self.state.set_draining(true);

        let _ = supervisor
            .bus
            .publish(
                &format!("cluster.node.{}", supervisor.node_id),
                "cluster.node.leaving",
                serde_json::json!({"node_id": supervisor.node_id}),
                crate::bus::PublishOpts::default(),
            )
            .await;

        supervisor.broadcast_shutdown();

        let deadline = Duration::from_millis(supervisor.cfg.gateway.drain_deadline_ms);
        let start = std::time::Instant::now();
        while supervisor.sessions.active_count() > 0 && start.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if supervisor.sessions.active_count() > 0 {
            tracing::warn!(remaining = supervisor.sessions.active_count(), "stragglers remain after drain deadline, deregistering anyway");
        }

        supervisor.shutdown().await;
    }
}

/// Binds `addr` and serves `gateway.router()` until ctrl-c, then drains.
pub async fn serve(gateway: Gateway, addr: SocketAddr) -> std::io::Result<()> {
    let app = gateway.router().into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "pulsegate-gateway listening");

    let state = gateway.state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining");
            Gateway { state }.drain().await;
        })
        .await?;

    Ok(())
}
