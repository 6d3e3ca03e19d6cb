//! speedwarden -- scheduled and on-demand bandwidth measurements.
//!
//! One measurement at a time, across the daemon's timer, manual requests and
//! one-shot CLI runs, with history and schedule kept in SQLite so a restart
//! picks up where the last process left off.

pub mod api;
pub mod config;
pub mod directory;
pub mod probes;
pub mod remote;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod storage;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::api::state::AppState;
use crate::api::AddressAllowList;
use crate::config::{AppConfig, LogFormat, LoggingConfig};
use crate::service::SpeedService;

/// Resolve the configuration under a temporary stderr subscriber, so lookup
/// messages are not lost before [`init_tracing`] runs.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    load_config_with(explicit, filter, std::io::stderr)
}

fn load_config_with<W>(explicit: Option<&Path>, filter: EnvFilter, writer: W) -> Result<AppConfig>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    tracing::subscriber::with_default(subscriber, || AppConfig::resolve(explicit))
}

/// Install the global tracing subscriber on stderr. `RUST_LOG` wins over
/// the config.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Start the daemon: recover state, arm the schedule, serve the API until
/// Ctrl-C.
pub async fn serve(config: AppConfig) -> Result<()> {
    let db_path = &config.storage.database_path;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(db_path)?;

    let policy = AddressAllowList::from_config(&config.server.admin_addresses)?;
    let service = Arc::new(SpeedService::from_config(&config, pool, Arc::new(policy))?);
    service
        .bootstrap()
        .await
        .context("failed to restore measurement schedule")?;

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let app = api::router(AppState {
        service: service.clone(),
    });

    tracing::info!(%addr, "speedwarden listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    service.shutdown().await;
    tracing::info!("speedwarden stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
