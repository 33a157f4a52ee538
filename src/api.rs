//! Request handler translating API calls into orchestrator and operation log calls.
//!
//! Request-time problems (bad config, stale modno, unknown ids) come back as errors from
//! these methods. Workflow failures never do; they are recorded on the operations.

use crate::config::{validate_config, Config, ConfigStore};
use crate::error::{BackrunError, Result};
use crate::oplog::{OpLog, OperationEvent};
use crate::orchestrator::Orchestrator;
use crate::types::{Operation, OperationId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Which operations to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationSelector {
    All,
    Plan(String),
    Repo(String),
    Snapshot(String),
    Ids(Vec<OperationId>),
}

/// The API façade.
#[derive(Clone)]
pub struct Handler {
    store: Arc<dyn ConfigStore>,
    orchestrator: Orchestrator,
    /// Held across persist and apply so the orchestrator sees configs in modno order.
    config_write: Arc<Mutex<()>>,
}

impl Handler {
    pub fn new(store: Arc<dyn ConfigStore>, orchestrator: Orchestrator) -> Self {
        Self {
            store,
            orchestrator,
            config_write: Arc::new(Mutex::new(())),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    fn oplog(&self) -> &OpLog {
        self.orchestrator.oplog()
    }

    pub fn get_config(&self) -> Result<Config> {
        self.store.get()
    }

    /// Validate and persist `config`, then hand it to the orchestrator.
    ///
    /// `config.modno` must match the stored modno; the returned config carries the
    /// incremented modno.
    pub fn set_config(&self, config: Config) -> Result<Config> {
        validate_config(&config)?;
        let _guard = self.config_write.lock();
        let saved = self.store.update(config)?;
        self.orchestrator.apply_config(saved.clone());
        info!(
            modno = saved.modno,
            repos = saved.repos.len(),
            plans = saved.plans.len(),
            "Config updated"
        );
        Ok(saved)
    }

    pub fn backup(&self, plan_id: &str) -> Result<OperationId> {
        self.orchestrator.backup(plan_id)
    }

    pub fn prune(&self, plan_id: &str) -> Result<OperationId> {
        self.orchestrator.prune(plan_id)
    }

    pub fn stats(&self, repo_id: &str) -> Result<OperationId> {
        self.orchestrator.stats(repo_id)
    }

    pub fn restore(
        &self,
        plan_id: &str,
        snapshot_id: &str,
        path: &str,
        target: &str,
    ) -> Result<OperationId> {
        self.orchestrator.restore(plan_id, snapshot_id, path, target)
    }

    pub fn index_snapshots(&self, repo_id: &str) -> Result<()> {
        self.orchestrator.index_snapshots(repo_id)
    }

    pub async fn cancel(&self, op_id: OperationId) -> Result<()> {
        self.orchestrator.cancel(op_id).await
    }

    pub fn operation(&self, op_id: OperationId) -> Result<Operation> {
        self.oplog().get(op_id)
    }

    pub fn operations(&self, selector: &OperationSelector) -> Result<Vec<Operation>> {
        match selector {
            OperationSelector::All => self.oplog().all(),
            OperationSelector::Plan(plan_id) => self.oplog().for_plan(plan_id),
            OperationSelector::Repo(repo_id) => self.oplog().for_repo(repo_id),
            OperationSelector::Snapshot(snapshot_id) => self.oplog().for_snapshot(snapshot_id),
            OperationSelector::Ids(ids) => ids.iter().map(|id| self.oplog().get(*id)).collect(),
        }
    }

    /// Raw command output of an operation.
    pub fn logs(&self, op_id: OperationId) -> Result<String> {
        let op = self.oplog().get(op_id)?;
        let log_ref = op
            .log_ref
            .ok_or_else(|| BackrunError::NotFound(format!("logs for operation {}", op_id)))?;
        self.orchestrator.logs().read(&log_ref)
    }

    /// Live stream of operation changes.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.oplog().subscribe()
    }
}
