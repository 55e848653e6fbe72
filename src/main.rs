//! # Station Core
//!
//! Base station service for wildlife-tracking radio receivers.
//!
//! Listens to the configured radios, logs their telemetry to rotating CSV
//! files, uploads completed files and checks in with the backend.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use station_core::config::{Config, StationIdentity};
use station_core::data::{HttpObjectStore, ObjectStore};
use station_core::serial::TokioSerialConnector;
use station_core::station::{BaseStation, Collaborators, HealthCheckin, HttpServerApi, SharedGpsState};

/// Station log file name inside the base log directory
fn log_file_name(station_id: &str) -> String {
    format!("sensor-station-{}.log", station_id)
}

/// Install stdout and station log file output
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(base_dir: &Path, station_id: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(base_dir)
        .with_context(|| format!("creating log directory {}", base_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(base_dir, log_file_name(station_id));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}

/// Main entry point
///
/// Usage: `station-core [CONFIG]`. Without a path the built-in defaults are
/// used. A missing station identity file or an invalid configuration aborts
/// startup; everything after that is logged and retried.
///
/// Ctrl+C stops the radios and flushes every category log before exit.
///
/// No GPS daemon client is attached to the [`SharedGpsState`] built here,
/// so until one calls `SharedGpsState::update` each GPS poll writes a row
/// with only the recorded-at time.
#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    let identity = StationIdentity::load(&config.station.id_file)
        .with_context(|| format!("reading station id from {}", config.station.id_file))?;

    let _log_guard = init_logging(&config.record.base_dir(), &identity.id)?;
    info!("Station Core v{} starting for station {}", env!("CARGO_PKG_VERSION"), identity.id);

    let checkin: Option<Arc<dyn HealthCheckin>> = if config.checkin.enabled {
        Some(Arc::new(HttpServerApi::new(&config.checkin)?))
    } else {
        None
    };
    let store: Option<Arc<dyn ObjectStore>> = if config.upload.enabled {
        Some(Arc::new(HttpObjectStore::new(&config.upload)?))
    } else {
        None
    };

    let collaborators = Collaborators {
        connector: Arc::new(TokioSerialConnector),
        gps: Arc::new(SharedGpsState::new()),
        checkin,
        store,
    };

    let station = BaseStation::new(config, identity, collaborators);
    station
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(e) => {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await
                }
            }
        })
        .await?;

    info!("Station stopped");
    Ok(())
}
