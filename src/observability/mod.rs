//! Observability module for backrun.
//!
//! Provides logging setup, operation metrics and the optional Prometheus endpoint.

use crate::config::ObservabilityConfig;
use crate::error::{BackrunError, Result};
use crate::types::OperationStatus;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| BackrunError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| BackrunError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server until `shutdown` is cancelled.
pub async fn run_metrics_server(
    config: ObservabilityConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        BackrunError::Internal(format!("Failed to install metrics recorder: {}", e))
    })?;

    register_metrics();

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

fn register_metrics() {
    gauge!("backrun_operations_running").set(0.0);
    gauge!("backrun_plans_scheduled").set(0.0);
    counter!("backrun_hook_failures_total").absolute(0);
}

/// Record an operation entering RUNNING.
pub fn record_operation_started(kind: &'static str) {
    gauge!("backrun_operations_running").increment(1.0);
    counter!("backrun_operations_started_total", "kind" => kind).increment(1);
}

/// Record an operation reaching a terminal status. `was_running` is false for operations
/// finalized straight from PENDING.
pub fn record_operation_finished(kind: &'static str, status: OperationStatus, was_running: bool) {
    if was_running {
        gauge!("backrun_operations_running").decrement(1.0);
    }
    counter!(
        "backrun_operations_total",
        "kind" => kind,
        "status" => status.as_str()
    )
    .increment(1);
}

/// Record a failed hook.
pub fn record_hook_failure() {
    counter!("backrun_hook_failures_total").increment(1);
}

/// Update the number of plans with an active schedule.
pub fn update_scheduled_plans(count: usize) {
    gauge!("backrun_plans_scheduled").set(count as f64);
}
