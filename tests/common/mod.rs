//! Common test utilities for integration tests.

pub mod fake_tool;
pub mod fixtures;

use backrun::api::Handler;
use backrun::config::{Config, MemoryStore};
use backrun::logstore::RotatingLog;
use backrun::oplog::OpLog;
use backrun::orchestrator::Orchestrator;
use backrun::types::{Operation, OperationId, OperationStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// Re-export common types
pub use fake_tool::*;
pub use fixtures::*;

/// Default time to wait for an asynchronous outcome.
pub const WAIT: Duration = Duration::from_secs(10);

/// Test environment: scratch directories, stores and an orchestrator over a [`FakeTool`].
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub tool: Arc<FakeTool>,
    pub handler: Handler,
    shutdown: CancellationToken,
    scheduler: Option<JoinHandle<backrun::Result<()>>>,
}

impl TestEnv {
    pub fn new(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let oplog = Arc::new(
            OpLog::open(temp_dir.path().join("oplog")).expect("Failed to open operation log"),
        );
        let logs = Arc::new(
            RotatingLog::new(temp_dir.path().join("logs"), 100).expect("Failed to create log store"),
        );
        let tool = Arc::new(FakeTool::new());

        let orchestrator = Orchestrator::new(config.clone(), oplog, logs, tool.clone())
            .expect("Failed to create orchestrator");
        let store = Arc::new(MemoryStore::new(config));

        Self {
            temp_dir,
            tool,
            handler: Handler::new(store, orchestrator),
            shutdown: CancellationToken::new(),
            scheduler: None,
        }
    }

    /// Path of a file inside the scratch directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        self.handler.orchestrator()
    }

    /// Start the scheduling loop.
    pub fn start(&mut self) {
        let orchestrator = self.orchestrator().clone();
        let token = self.shutdown.clone();
        self.scheduler = Some(tokio::spawn(async move { orchestrator.run(token).await }));
    }

    /// Stop the scheduling loop (if started) and all workers.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        match self.scheduler.take() {
            Some(handle) => handle
                .await
                .expect("scheduler task panicked")
                .expect("scheduler failed"),
            None => self.orchestrator().shutdown().await,
        }
    }

    pub fn op(&self, op_id: OperationId) -> Operation {
        self.handler.operation(op_id).expect("operation exists")
    }

    pub fn all_ops(&self) -> Vec<Operation> {
        self.orchestrator().oplog().all().expect("scan operation log")
    }

    /// Wait until the operation has the given status.
    pub async fn wait_for_status(&self, op_id: OperationId, status: OperationStatus) -> Operation {
        eventually(WAIT, || {
            let op = self.op(op_id);
            (op.status == status).then_some(op)
        })
        .await
        .unwrap_or_else(|| panic!("operation {} never reached {}: {:?}", op_id, status, self.op(op_id)))
    }

    /// Wait until the operation is terminal.
    pub async fn wait_for_terminal(&self, op_id: OperationId) -> Operation {
        eventually(WAIT, || {
            let op = self.op(op_id);
            op.is_terminal().then_some(op)
        })
        .await
        .unwrap_or_else(|| panic!("operation {} never finished: {:?}", op_id, self.op(op_id)))
    }

    /// Wait until every recorded operation is terminal and `check` accepts the log.
    pub async fn wait_for_ops<F>(&self, mut check: F) -> Vec<Operation>
    where
        F: FnMut(&[Operation]) -> bool,
    {
        eventually(WAIT, || {
            let ops = self.all_ops();
            (ops.iter().all(Operation::is_terminal) && check(&ops)).then_some(ops)
        })
        .await
        .unwrap_or_else(|| panic!("operation log never settled: {:#?}", self.all_ops()))
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Operations of one kind, in id order.
pub fn of_kind<'a>(ops: &'a [Operation], kind: &str) -> Vec<&'a Operation> {
    ops.iter().filter(|op| op.kind() == kind).collect()
}

/// Poll `check` until it yields a value or `timeout` elapses.
pub async fn eventually<T, F>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if start.elapsed() >= timeout {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
