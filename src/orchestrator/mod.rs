//! The orchestrator: scheduling loop, per-repository queues and the operation state machine.
//!
//! Every request becomes a PENDING operation in the [`OpLog`] and a task on its
//! repository's FIFO queue. One worker per repository drains the queue, so operations on
//! the same repository never overlap while different repositories run concurrently.
//!
//! Cancellation flows through a token chain: the orchestrator's shutdown token is the
//! parent of one token per workflow, which is handed to every step and subprocess the
//! workflow starts.

mod workflow;

use crate::config::Config;
use crate::error::{BackrunError, Result};
use crate::hook::HookExecutor;
use crate::logstore::LogStore;
use crate::observability;
use crate::oplog::OpLog;
use crate::restic::BackupTool;
use crate::scheduling::Schedule;
use crate::types::{Operation, OperationId, OperationPayload, OperationStatus};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long the scheduler sleeps when no plan has a schedule.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

pub(crate) const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";
pub(crate) const INTERRUPTED_BY_SHUTDOWN: &str = "interrupted by shutdown";

/// Cancellation state shared by every operation of one workflow run.
#[derive(Clone)]
pub(crate) struct WorkflowHandle {
    cancel: CancellationToken,
    user_cancelled: Arc<AtomicBool>,
}

impl WorkflowHandle {
    fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            user_cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn cancel_by_user(&self) {
        self.user_cancelled.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn cancelled_by_user(&self) -> bool {
        self.user_cancelled.load(Ordering::SeqCst)
    }
}

/// An operation known to the orchestrator that has not reached a terminal status yet.
struct Inflight {
    handle: WorkflowHandle,
    /// False while the operation still sits in its repository queue.
    running: bool,
    done: watch::Sender<bool>,
}

#[derive(Debug)]
enum Task {
    Operation(OperationId),
    IndexSnapshots,
}

struct Inner {
    config: RwLock<Arc<Config>>,
    oplog: Arc<OpLog>,
    logs: Arc<dyn LogStore>,
    tool: Arc<dyn BackupTool>,
    hooks: HookExecutor,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Task>>>,
    inflight: Mutex<HashMap<OperationId, Inflight>>,
    initialized_repos: Mutex<HashSet<String>>,
    config_changed: Notify,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Schedules and executes backup workflows.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator, reconciling operations left unfinished by a previous process.
    pub fn new(
        config: Config,
        oplog: Arc<OpLog>,
        logs: Arc<dyn LogStore>,
        tool: Arc<dyn BackupTool>,
    ) -> Result<Self> {
        Self::with_hooks(config, oplog, logs, tool, HookExecutor::default())
    }

    pub fn with_hooks(
        config: Config,
        oplog: Arc<OpLog>,
        logs: Arc<dyn LogStore>,
        tool: Arc<dyn BackupTool>,
        hooks: HookExecutor,
    ) -> Result<Self> {
        let orchestrator = Self {
            inner: Arc::new(Inner {
                config: RwLock::new(Arc::new(config)),
                oplog,
                logs,
                tool,
                hooks,
                queues: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                initialized_repos: Mutex::new(HashSet::new()),
                config_changed: Notify::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        };

        let reconciled = orchestrator.reconcile()?;
        if reconciled > 0 {
            warn!(count = reconciled, "Marked unfinished operations as interrupted");
        }
        Ok(orchestrator)
    }

    /// Mark every non-terminal operation as ERROR.
    fn reconcile(&self) -> Result<usize> {
        let mut stale = Vec::new();
        self.inner.oplog.for_all(|op| {
            if !op.is_terminal() {
                stale.push(op);
            }
            Ok(())
        })?;

        let count = stale.len();
        for mut op in stale {
            op.transition(OperationStatus::Error)?;
            op.display_message = Some(INTERRUPTED_BY_RESTART.to_string());
            self.inner.oplog.update(&op)?;
            debug!(op_id = op.id, kind = op.kind(), "Reconciled interrupted operation");
        }
        Ok(count)
    }

    /// The current config snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.inner.config.read().clone()
    }

    pub fn oplog(&self) -> &Arc<OpLog> {
        &self.inner.oplog
    }

    pub fn logs(&self) -> &Arc<dyn LogStore> {
        &self.inner.logs
    }

    /// Swap in a new config snapshot. The scheduler recomputes fire times on its next turn.
    ///
    /// A config whose modno is not newer than the current one is ignored. Returns whether
    /// the config was applied.
    pub fn apply_config(&self, config: Config) -> bool {
        let modno = config.modno;
        {
            let mut current = self.inner.config.write();
            if modno <= current.modno {
                debug!(modno, current = current.modno, "Ignoring outdated config");
                return false;
            }
            *current = Arc::new(config);
        }
        self.inner.config_changed.notify_one();
        info!(modno, "Applied config");
        true
    }

    /// Enqueue an ad-hoc backup of `plan_id`. Returns once the PENDING operation is durable.
    pub fn backup(&self, plan_id: &str) -> Result<OperationId> {
        let config = self.config();
        let plan = config
            .plan(plan_id)
            .ok_or_else(|| BackrunError::NotFound(format!("plan {}", plan_id)))?;
        self.submit(Operation::new(
            &plan.id,
            &plan.repo,
            OperationPayload::Backup { summary: None },
        ))
    }

    /// Enqueue a prune of the plan's repository.
    pub fn prune(&self, plan_id: &str) -> Result<OperationId> {
        let config = self.config();
        let plan = config
            .plan(plan_id)
            .ok_or_else(|| BackrunError::NotFound(format!("plan {}", plan_id)))?;
        self.submit(Operation::new(
            &plan.id,
            &plan.repo,
            OperationPayload::Prune {
                output: String::new(),
            },
        ))
    }

    /// Enqueue a stats collection for a repository.
    pub fn stats(&self, repo_id: &str) -> Result<OperationId> {
        let config = self.config();
        let repo = config
            .repo(repo_id)
            .ok_or_else(|| BackrunError::NotFound(format!("repo {}", repo_id)))?;
        self.submit(Operation::new(
            "",
            &repo.id,
            OperationPayload::Stats { stats: None },
        ))
    }

    /// Enqueue a restore of `path` from a snapshot of `plan_id` into `target`.
    pub fn restore(
        &self,
        plan_id: &str,
        snapshot_id: &str,
        path: &str,
        target: &str,
    ) -> Result<OperationId> {
        if snapshot_id.is_empty() {
            return Err(BackrunError::Validation(
                "restore requires a snapshot id".to_string(),
            ));
        }
        if target.is_empty() {
            return Err(BackrunError::Validation(
                "restore requires a target".to_string(),
            ));
        }
        let config = self.config();
        let plan = config
            .plan(plan_id)
            .ok_or_else(|| BackrunError::NotFound(format!("plan {}", plan_id)))?;
        let op = Operation::new(
            &plan.id,
            &plan.repo,
            OperationPayload::Restore {
                snapshot_id: snapshot_id.to_string(),
                path: path.to_string(),
                target: target.to_string(),
                summary: None,
            },
        )
        .with_snapshot(snapshot_id);
        self.submit(op)
    }

    /// Enqueue a scan recording snapshots present in the repository but missing from the log.
    pub fn index_snapshots(&self, repo_id: &str) -> Result<()> {
        if self.config().repo(repo_id).is_none() {
            return Err(BackrunError::NotFound(format!("repo {}", repo_id)));
        }
        self.ensure_accepting()?;
        self.enqueue(repo_id, Task::IndexSnapshots)
    }

    /// Cancel an operation.
    ///
    /// A queued operation is finalized as USER_CANCELLED immediately. For a running one the
    /// workflow's token is cancelled and the call waits for the workflow to record the
    /// outcome. Cancelling a terminal operation is a no-op.
    pub async fn cancel(&self, op_id: OperationId) -> Result<()> {
        let op = self.inner.oplog.get(op_id)?;
        if op.is_terminal() {
            debug!(op_id, status = %op.status, "Cancel of finished operation ignored");
            return Ok(());
        }

        let mut done = {
            let mut inflight = self.inner.inflight.lock();
            let running = match inflight.get(&op_id) {
                Some(entry) => {
                    entry.handle.cancel_by_user();
                    entry.running
                }
                None => return Ok(()),
            };

            if !running {
                let mut op = self.inner.oplog.get(op_id)?;
                if !op.is_terminal() {
                    op.transition(OperationStatus::UserCancelled)?;
                    op.display_message = Some("cancelled before start".to_string());
                    self.inner.oplog.update(&op)?;
                    observability::record_operation_finished(op.kind(), op.status, false);
                }
                if let Some(entry) = inflight.remove(&op_id) {
                    entry.done.send_replace(true);
                }
                info!(op_id, "Cancelled queued operation");
                return Ok(());
            }
            match inflight.get(&op_id) {
                Some(entry) => entry.done.subscribe(),
                None => return Ok(()),
            }
        };

        info!(op_id, "Cancelling running operation");
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Run the scheduling loop until `ctx` is cancelled, then stop all workers.
    ///
    /// Running subprocesses are killed and their operations recorded as interrupted; queued
    /// operations are marked ERROR.
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        info!("Scheduler started");
        let mut schedule = self.compute_schedule(Utc::now());

        loop {
            let now = Utc::now();
            let sleep = schedule
                .next_wakeup()
                .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAKEUP);

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = self.inner.config_changed.notified() => {
                    schedule = self.compute_schedule(Utc::now());
                    continue;
                }
                _ = tokio::time::sleep(sleep) => {}
            }

            for plan_id in schedule.take_due(Utc::now()) {
                match self.backup(&plan_id) {
                    Ok(op_id) => info!(plan_id = %plan_id, op_id, "Scheduled backup fired"),
                    Err(e) => warn!(plan_id = %plan_id, error = %e, "Scheduled backup rejected"),
                }
            }
        }

        self.shutdown().await;
        info!("Scheduler stopped");
        Ok(())
    }

    /// Stop accepting work, cancel in-flight workflows and wait for workers to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.queues.lock().clear();
    }

    fn compute_schedule(&self, now: DateTime<Utc>) -> Schedule {
        let schedule = Schedule::from_config(&self.config(), now);
        observability::update_scheduled_plans(schedule.len());
        schedule
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BackrunError::Unavailable(
                "orchestrator is shutting down".to_string(),
            ));
        }
        Ok(())
    }

    fn submit(&self, mut op: Operation) -> Result<OperationId> {
        self.ensure_accepting()?;
        self.inner.oplog.add(&mut op)?;
        self.register(op.id, WorkflowHandle::new(&self.inner.shutdown), false);

        if let Err(e) = self.enqueue(&op.repo_id, Task::Operation(op.id)) {
            self.abandon(op.id, INTERRUPTED_BY_SHUTDOWN);
            return Err(e);
        }
        info!(
            op_id = op.id,
            kind = op.kind(),
            plan_id = %op.plan_id,
            repo_id = %op.repo_id,
            "Enqueued operation"
        );
        Ok(op.id)
    }

    fn enqueue(&self, repo_id: &str, task: Task) -> Result<()> {
        let mut queues = self.inner.queues.lock();
        let tx = queues.entry(repo_id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = self.clone();
            let repo_id = repo_id.to_string();
            self.inner
                .tracker
                .spawn(async move { worker.repo_worker(repo_id, rx).await });
            tx
        });
        tx.send(task)
            .map_err(|_| BackrunError::Unavailable("orchestrator is shutting down".to_string()))
    }

    async fn repo_worker(self, repo_id: String, mut rx: mpsc::UnboundedReceiver<Task>) {
        debug!(repo_id = %repo_id, "Repo worker started");
        loop {
            let task = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            self.run_task(&repo_id, task).await;
        }

        rx.close();
        while let Ok(task) = rx.try_recv() {
            if let Task::Operation(op_id) = task {
                self.abandon(op_id, INTERRUPTED_BY_SHUTDOWN);
            }
        }
        debug!(repo_id = %repo_id, "Repo worker stopped");
    }

    async fn run_task(&self, repo_id: &str, task: Task) {
        match task {
            Task::Operation(op_id) => {
                let Some(handle) = self.claim(op_id) else {
                    debug!(op_id, "Skipping operation finalized while queued");
                    return;
                };
                if let Err(e) = self.dispatch(op_id, &handle).await {
                    error!(op_id, repo_id = %repo_id, error = %e, "Workflow failed");
                    self.fail_if_open(op_id, &e);
                }
                self.release(op_id);
            }
            Task::IndexSnapshots => {
                let handle = WorkflowHandle::new(&self.inner.shutdown);
                match self.index_repo(repo_id, &handle).await {
                    Ok(added) => info!(repo_id = %repo_id, added, "Indexed repository snapshots"),
                    Err(e) => warn!(repo_id = %repo_id, error = %e, "Snapshot indexing failed"),
                }
            }
        }
    }

    async fn dispatch(&self, op_id: OperationId, handle: &WorkflowHandle) -> Result<()> {
        let op = self.inner.oplog.get(op_id)?;
        if op.is_terminal() {
            return Ok(());
        }
        match &op.payload {
            OperationPayload::Backup { .. } => self.run_backup(op, handle).await,
            OperationPayload::Prune { .. } => self.run_prune(op, handle).await,
            OperationPayload::Stats { .. } => self.run_stats(op, handle).await,
            OperationPayload::Restore { .. } => self.run_restore(op, handle).await,
            other => {
                let err = BackrunError::InvalidState(format!(
                    "{} operations cannot be queued",
                    other.kind()
                ));
                let mut op = op;
                self.finish_op(&mut op, Err(&err), handle)
            }
        }
    }

    fn register(&self, op_id: OperationId, handle: WorkflowHandle, running: bool) {
        let (done, _) = watch::channel(false);
        self.inner.inflight.lock().insert(
            op_id,
            Inflight {
                handle,
                running,
                done,
            },
        );
    }

    /// Mark a queued operation as running. Returns `None` if it was finalized meanwhile.
    fn claim(&self, op_id: OperationId) -> Option<WorkflowHandle> {
        let mut inflight = self.inner.inflight.lock();
        let entry = inflight.get_mut(&op_id)?;
        entry.running = true;
        Some(entry.handle.clone())
    }

    fn release(&self, op_id: OperationId) {
        if let Some(entry) = self.inner.inflight.lock().remove(&op_id) {
            entry.done.send_replace(true);
        }
    }

    /// Finalize an operation that will never run.
    fn abandon(&self, op_id: OperationId, reason: &str) {
        self.release(op_id);
        let result = self.inner.oplog.get(op_id).and_then(|mut op| {
            if op.is_terminal() {
                return Ok(());
            }
            op.transition(OperationStatus::Error)?;
            op.display_message = Some(reason.to_string());
            self.inner.oplog.update(&op)?;
            observability::record_operation_finished(op.kind(), op.status, false);
            Ok(())
        });
        if let Err(e) = result {
            error!(op_id, error = %e, "Failed to record abandoned operation");
        }
    }

    /// Record `err` on an operation a failed workflow left non-terminal.
    fn fail_if_open(&self, op_id: OperationId, err: &BackrunError) {
        let result = self.inner.oplog.get(op_id).and_then(|mut op| {
            if op.is_terminal() {
                return Ok(());
            }
            let was_running = op.status == OperationStatus::Running;
            op.transition(OperationStatus::Error)?;
            op.display_message = Some(err.to_string());
            self.inner.oplog.update(&op)?;
            observability::record_operation_finished(op.kind(), op.status, was_running);
            Ok(())
        });
        if let Err(e) = result {
            error!(op_id, error = %e, "Failed to record workflow failure");
        }
    }
}
