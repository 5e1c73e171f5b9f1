//! nvme-stress -- concurrent NVMe stress testing with live telemetry.
//!
//! This crate discovers eligible devices, gates them through a mount safety
//! check, drives one fio workload per device alongside a temperature
//! sampler, and aggregates the resulting run logs into summary reports.

pub mod api;
pub mod config;
pub mod devices;
pub mod health;
pub mod orchestrator;
pub mod report;
pub mod runlog;
pub mod safety;
pub mod system;
pub mod telemetry;
pub mod workload;

use anyhow::{Context, Result};

use crate::config::StressConfig;
use crate::orchestrator::Orchestrator;

/// Start the daemon: HTTP API, host telemetry sampler, and run orchestrator.
/// Returns after Ctrl-C once every active run has been stopped.
pub async fn serve(config: StressConfig) -> Result<()> {
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.api.bind))?;

    let orchestrator = Orchestrator::new(config);
    let devices = orchestrator.list_devices().await;
    tracing::info!(count = devices.len(), "devices available");

    let system_sampler = match orchestrator.start_system_sampler() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "system telemetry disabled");
            None
        }
    };

    let app = api::router(api::state::AppState::new(orchestrator.clone()));

    tracing::info!(%addr, "nvme-stress listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    orchestrator.shutdown().await;
    if let Some(handle) = system_sampler {
        handle.stop().await;
    }
    tracing::info!("nvme-stress stopped");
    Ok(())
}
