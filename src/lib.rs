//! Backrun - a backup orchestration daemon.
//!
//! Backrun wraps a snapshot-based backup tool (restic) and turns declarative repository and
//! plan configuration into scheduled, observable, cancellable jobs.
//!
//! # Features
//!
//! - **Scheduling**: cron expressions per plan, plus ad-hoc runs.
//! - **Per-repository serialization**: one FIFO queue per repository, repositories run in
//!   parallel.
//! - **Workflows**: backup, snapshot indexing, retention forget, prune, stats and restore,
//!   with user hooks at lifecycle points.
//! - **Operation log**: every state transition is durably recorded in RocksDB and queryable
//!   by plan, repository or snapshot.
//! - **Cancellation**: any running operation can be cancelled by id; its subprocess is
//!   killed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  api::Handler: SetConfig | Backup | Cancel | Operations      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Orchestrator: cron loop | repo queues | workflow steps      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HookExecutor | TaskExecutor (subprocess) | BackupTool       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  OpLog (RocksDB) | LogStore (rotating files) | ConfigStore   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use backrun::config::BackrunSettings;
//!
//! #[tokio::main]
//! async fn main() -> backrun::Result<()> {
//!     let settings = BackrunSettings::development();
//!     backrun::run(settings).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod api;
pub mod binary;
pub mod hook;
pub mod logstore;
pub mod oplog;
pub mod orchestrator;
pub mod restic;
pub mod retention;
pub mod scheduling;
pub mod shutdown;
pub mod task;

pub mod cli;
pub mod observability;

// Re-exports
pub use error::{BackrunError, Result};
pub use types::*;

use api::Handler;
use binary::{BinaryProvider, ResticBinary};
use config::{validate_config, BackrunSettings, ConfigStore, JsonFileStore};
use logstore::{LogStore, RotatingLog};
use oplog::OpLog;
use orchestrator::Orchestrator;
use restic::{BackupTool, Restic};
use shutdown::{ShutdownCoordinator, SignalHandler};
use std::sync::Arc;
use task::TaskExecutor;
use tracing::{error, info, warn};

/// Open the stores and build a request handler over a fresh orchestrator.
pub fn open(settings: &BackrunSettings) -> Result<Handler> {
    settings.validate()?;
    std::fs::create_dir_all(&settings.data_dir)?;

    let store: Arc<dyn ConfigStore> = Arc::new(JsonFileStore::open(&settings.config_path)?);
    let config = store.get()?;
    validate_config(&config)?;

    let oplog = Arc::new(OpLog::open(settings.oplog_path())?);
    let logs: Arc<dyn LogStore> =
        Arc::new(RotatingLog::new(settings.log_dir(), settings.logs.max_files)?);

    let binary = Arc::new(ResticBinary::new(settings.restic_binary.clone()));
    match binary.locate() {
        Ok(path) => info!(path = %path.display(), "Using restic"),
        Err(e) => warn!(error = %e, "restic not found, operations will fail until it is installed"),
    }
    let tool: Arc<dyn BackupTool> = Arc::new(Restic::new(binary, TaskExecutor::new()));

    let orchestrator = Orchestrator::new(config, oplog, logs, tool)?;
    Ok(Handler::new(store, orchestrator))
}

/// Run the backrun daemon until a shutdown signal arrives.
pub async fn run(settings: BackrunSettings) -> Result<()> {
    observability::init(&settings.observability)?;
    info!(data_dir = %settings.data_dir.display(), "Starting backrun");

    let handler = open(&settings)?;
    let coordinator = ShutdownCoordinator::with_timeout(settings.shutdown_timeout);

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = SignalHandler::new(signal_coordinator).run().await {
            error!("Failed to install signal handlers: {}", e);
        }
    });

    let metrics = if settings.observability.metrics_enabled {
        info!("Starting metrics server on {}", settings.observability.metrics_addr);
        let obs_config = settings.observability.clone();
        let token = coordinator.token();
        Some(tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config, token).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let orchestrator = handler.orchestrator().clone();
    let token = coordinator.token();
    let scheduler = tokio::spawn(async move { orchestrator.run(token).await });

    coordinator.wait_for_shutdown().await;
    info!("Shutting down backrun gracefully...");

    let drained = coordinator
        .drain(async {
            match scheduler.await {
                Ok(Err(e)) => error!("Scheduler error: {}", e),
                Err(e) => error!("Scheduler task failed: {}", e),
                Ok(Ok(())) => {}
            }
        })
        .await;
    if !drained {
        warn!(
            timeout = ?coordinator.timeout(),
            "In-flight operations did not finish in time"
        );
    }

    if let Some(handle) = metrics {
        if !handle.is_finished() {
            warn!(service = "metrics", "Force aborting service");
            handle.abort();
        }
    }

    info!("Backrun shutdown complete");
    Ok(())
}
