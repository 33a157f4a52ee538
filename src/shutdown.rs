//! Graceful shutdown handling for the backrun daemon.
//!
//! A single [`ShutdownCoordinator`] is created at startup. OS signals trip it, and the
//! orchestrator, metrics server and signal task all watch its token.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Maximum time to wait for graceful shutdown before giving up on in-flight work.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown coordinator for the daemon's long-running tasks.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    is_shutting_down: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Create a new shutdown coordinator with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Check if shutdown is in progress.
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            self.token.cancel();
        }
    }

    /// Wait for shutdown signal (for use in select! macros).
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await
    }

    /// Get shutdown timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Await `drain` for at most the shutdown timeout. Returns false on timeout.
    pub async fn drain<F: Future<Output = ()>>(&self, drain: F) -> bool {
        match tokio::time::timeout(self.timeout, drain).await {
            Ok(()) => {
                info!("All tasks drained");
                true
            }
            Err(_) => {
                error!("Shutdown timed out after {:?}", self.timeout);
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal handler for graceful shutdown.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    /// Create a new signal handler.
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Wait for SIGTERM, SIGINT or SIGQUIT and trip the coordinator. Also returns if the
    /// coordinator is tripped by someone else.
    #[cfg(unix)]
    pub async fn run(self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigquit.recv() => info!("Received SIGQUIT"),
            _ = self.coordinator.wait_for_shutdown() => return Ok(()),
        }

        self.coordinator.shutdown();
        Ok(())
    }

    /// Wait for Ctrl+C (Windows version).
    #[cfg(windows)]
    pub async fn run(self) -> std::io::Result<()> {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Received Ctrl+C");
            }
            _ = self.coordinator.wait_for_shutdown() => return Ok(()),
        }
        self.coordinator.shutdown();
        Ok(())
    }
}
