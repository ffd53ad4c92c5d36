//! PulseGate gateway binary.
//!
//! Boot sequence (spec §6): load config -> construct collaborators ->
//! build the `Supervisor` -> build the `Gateway` -> bind and serve until
//! shutdown, draining in-flight sessions before exit.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use pulsegate_gateway::config;
use pulsegate_gateway::gateway::{self, Gateway};
use pulsegate_gateway::infra::{DevCollaborators, NoopBusTransport};
use pulsegate_gateway::supervisor::{Collaborators, Supervisor};

const CONFIG_PATH_ENV: &str = "PULSEGATE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "pulsegate.yaml";

#[tokio::main]
async fn main() -> ExitCode {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = match config::load_from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, path = %config_path, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let listen_addr = match cfg.listen_addr().parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "gateway.host/gateway.port do not form a valid socket address");
            return ExitCode::from(2);
        }
    };

    let dev = DevCollaborators::default();
    let collaborators = Collaborators {
        directory: dev.directory.clone(),
        verifier: dev.verifier.clone(),
        content: dev.content.clone(),
        media: dev.media.clone(),
        store: dev.store.clone(),
        transport: Some(Arc::new(NoopBusTransport) as Arc<dyn pulsegate_core::contracts::BusTransport>),
    };

    let supervisor = Supervisor::new(cfg, collaborators);
    if let Err(e) = supervisor.start().await {
        tracing::error!(error = %e, "supervisor failed to start");
        return ExitCode::from(1);
    }

    let gateway = Gateway::new(supervisor);

    match gateway::serve(gateway, listen_addr).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::from(1)
        }
    }
}
