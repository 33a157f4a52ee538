//! Workflow steps.
//!
//! Each step creates its operation, writes it PENDING, moves it to RUNNING when the work
//! starts and writes exactly one terminal status at the end. Step outcomes are recorded on
//! the operation; only operation log faults propagate as `Err`.

use super::{Orchestrator, WorkflowHandle, INTERRUPTED_BY_SHUTDOWN};
use crate::config::{Config, HookCondition, Plan, Repo, RetentionPolicy};
use crate::error::{BackrunError, Result};
use crate::hook::HookContext;
use crate::logstore;
use crate::observability;
use crate::retention;
use crate::types::{Operation, OperationId, OperationPayload, OperationStatus, SnapshotInfo};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Releases a child operation's in-flight entry once its terminal status is written.
struct ChildGuard<'a> {
    orchestrator: &'a Orchestrator,
    op_id: OperationId,
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.release(self.op_id);
    }
}

fn resolve<'a>(config: &'a Config, op: &Operation) -> Result<(&'a Plan, &'a Repo)> {
    let plan = config
        .plan(&op.plan_id)
        .ok_or_else(|| BackrunError::NotFound(format!("plan {}", op.plan_id)))?;
    let repo = config
        .repo(&plan.repo)
        .ok_or_else(|| BackrunError::NotFound(format!("repo {}", plan.repo)))?;
    Ok((plan, repo))
}

fn log_ref(op_id: OperationId) -> String {
    format!("op-{:020}", op_id)
}

impl Orchestrator {
    /// Write a child operation PENDING and register it under the workflow's handle.
    fn add_child(&self, op: &mut Operation, handle: &WorkflowHandle) -> Result<ChildGuard<'_>> {
        self.inner.oplog.add(op)?;
        self.register(op.id, handle.clone(), true);
        Ok(ChildGuard {
            orchestrator: self,
            op_id: op.id,
        })
    }

    /// Move an operation to RUNNING and return its log ref.
    fn start_op(&self, op: &mut Operation) -> Result<String> {
        let log_ref = log_ref(op.id);
        op.log_ref = Some(log_ref.clone());
        op.transition(OperationStatus::Running)?;
        self.inner.oplog.update(op)?;
        observability::record_operation_started(op.kind());
        debug!(op_id = op.id, kind = op.kind(), "Operation running");
        Ok(log_ref)
    }

    /// Write the terminal status for `outcome`.
    pub(super) fn finish_op(
        &self,
        op: &mut Operation,
        outcome: std::result::Result<(), &BackrunError>,
        handle: &WorkflowHandle,
    ) -> Result<()> {
        let was_running = op.status == OperationStatus::Running;
        let (status, message) = match outcome {
            Ok(()) => (OperationStatus::Success, None),
            Err(e) if e.is_cancelled() => {
                if handle.cancelled_by_user() {
                    (
                        OperationStatus::UserCancelled,
                        Some("cancelled by user".to_string()),
                    )
                } else {
                    (
                        OperationStatus::Error,
                        Some(INTERRUPTED_BY_SHUTDOWN.to_string()),
                    )
                }
            }
            Err(e) => (OperationStatus::Error, Some(e.to_string())),
        };

        op.transition(status)?;
        if message.is_some() {
            op.display_message = message;
        }
        self.inner.oplog.update(op)?;
        observability::record_operation_finished(op.kind(), status, was_running);

        match status {
            OperationStatus::Error => warn!(
                op_id = op.id,
                kind = op.kind(),
                plan_id = %op.plan_id,
                error = op.display_message.as_deref().unwrap_or_default(),
                "Operation failed"
            ),
            _ => info!(
                op_id = op.id,
                kind = op.kind(),
                plan_id = %op.plan_id,
                status = %status,
                "Operation finished"
            ),
        }
        Ok(())
    }

    async fn ensure_repo(
        &self,
        repo: &Repo,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        if self.inner.initialized_repos.lock().contains(&repo.id) {
            return Ok(());
        }
        self.inner.tool.ensure_initialized(repo, cancel, sink).await?;
        self.inner.initialized_repos.lock().insert(repo.id.clone());
        Ok(())
    }

    /// Run the plan's hooks for `condition` in declaration order, one RunHook operation each.
    ///
    /// At start conditions the first failure stops the remaining hooks and is returned.
    /// Elsewhere failures are logged and the next hook still runs. Cancellation always stops.
    async fn run_hooks(
        &self,
        plan: &Plan,
        condition: HookCondition,
        ctx: &HookContext,
        parent: OperationId,
        handle: &WorkflowHandle,
    ) -> Result<()> {
        let mut ctx = ctx.clone();
        ctx.event = Some(condition);

        for (index, hook) in plan.hooks_for(condition) {
            let mut op = Operation::new(
                &plan.id,
                &plan.repo,
                OperationPayload::RunHook {
                    parent_op_id: Some(parent),
                    condition,
                    hook_index: index,
                },
            );
            let _guard = self.add_child(&mut op, handle)?;
            let log_ref = self.start_op(&mut op)?;

            let outcome = async {
                let mut sink = self.inner.logs.new_writer(&log_ref)?;
                self.inner
                    .hooks
                    .run(hook, &ctx, handle.token(), &mut *sink)
                    .await
            }
            .await;
            self.finish_op(&mut op, outcome.as_ref().map(|_| ()), handle)?;

            if let Err(e) = outcome {
                observability::record_hook_failure();
                if condition.is_start() || e.is_cancelled() {
                    return Err(e);
                }
                warn!(
                    op_id = op.id,
                    plan_id = %plan.id,
                    condition = condition.as_str(),
                    error = %e,
                    "Hook failed"
                );
            }
        }
        Ok(())
    }

    /// Run hooks whose failure cannot change the workflow's outcome.
    async fn notify_hooks(
        &self,
        plan: &Plan,
        conditions: &[HookCondition],
        ctx: &HookContext,
        parent: OperationId,
        handle: &WorkflowHandle,
    ) {
        for condition in conditions {
            if let Err(e) = self.run_hooks(plan, *condition, ctx, parent, handle).await {
                warn!(plan_id = %plan.id, condition = condition.as_str(), error = %e, "Hooks aborted");
            }
        }
    }

    /// Run error hooks for `err`. Nothing runs for cancellations.
    async fn error_hooks(
        &self,
        plan: &Plan,
        conditions: &[HookCondition],
        ctx: &HookContext,
        parent: OperationId,
        err: &BackrunError,
        handle: &WorkflowHandle,
    ) {
        if err.is_cancelled() {
            return;
        }
        let mut ctx = ctx.clone();
        ctx.error = Some(err.to_string());
        self.notify_hooks(plan, conditions, &ctx, parent, handle).await;
    }

    /// Backup, then index the new snapshot, then SNAPSHOT_END hooks, then retention.
    pub(super) async fn run_backup(&self, mut op: Operation, handle: &WorkflowHandle) -> Result<()> {
        let config = self.config();
        let (plan, repo) = match resolve(&config, &op) {
            Ok(found) => found,
            Err(e) => return self.finish_op(&mut op, Err(&e), handle),
        };
        let mut ctx = HookContext::new(&plan.id, &repo.id);

        if let Err(e) = self
            .run_hooks(plan, HookCondition::SnapshotStart, &ctx, op.id, handle)
            .await
        {
            self.finish_op(&mut op, Err(&e), handle)?;
            self.error_hooks(plan, &[HookCondition::AnyError], &ctx, op.id, &e, handle)
                .await;
            return Ok(());
        }
        if handle.token().is_cancelled() {
            return self.finish_op(&mut op, Err(&BackrunError::Cancelled), handle);
        }

        let log_ref = self.start_op(&mut op)?;
        let result = async {
            let mut sink = self.inner.logs.new_writer(&log_ref)?;
            self.ensure_repo(repo, handle.token(), &mut *sink).await?;
            self.inner
                .tool
                .backup(repo, plan, handle.token(), &mut *sink)
                .await
        }
        .await;

        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                self.finish_op(&mut op, Err(&e), handle)?;
                self.error_hooks(
                    plan,
                    &[HookCondition::SnapshotError, HookCondition::AnyError],
                    &ctx,
                    op.id,
                    &e,
                    handle,
                )
                .await;
                return Ok(());
            }
        };

        let snapshot_id = summary.snapshot_id.clone();
        op.snapshot_id = Some(snapshot_id.clone());
        op.payload = OperationPayload::Backup {
            summary: Some(summary),
        };
        self.finish_op(&mut op, Ok(()), handle)?;
        ctx.snapshot_id = Some(snapshot_id.clone());

        self.run_index(plan, repo, &snapshot_id, handle).await?;
        if handle.token().is_cancelled() {
            return Ok(());
        }

        self.notify_hooks(plan, &[HookCondition::SnapshotEnd], &ctx, op.id, handle)
            .await;
        if handle.token().is_cancelled() {
            return Ok(());
        }

        if let Some(policy) = plan.retention.filter(|p| p.has_rules()) {
            self.run_forget(plan, repo, policy, &snapshot_id, handle)
                .await?;
        }
        Ok(())
    }

    /// Record the snapshot a backup produced. Returns whether the step succeeded.
    async fn run_index(
        &self,
        plan: &Plan,
        repo: &Repo,
        snapshot_id: &str,
        handle: &WorkflowHandle,
    ) -> Result<bool> {
        let mut op = Operation::new(
            &plan.id,
            &repo.id,
            OperationPayload::IndexSnapshot {
                snapshot: None,
                forgotten: false,
            },
        )
        .with_snapshot(snapshot_id);
        let _guard = self.add_child(&mut op, handle)?;
        let log_ref = self.start_op(&mut op)?;

        let result = async {
            let mut sink = self.inner.logs.new_writer(&log_ref)?;
            let snapshots = self
                .inner
                .tool
                .snapshots(repo, Some(&plan.id), handle.token(), &mut *sink)
                .await?;
            snapshots
                .into_iter()
                .find(|s| s.id == snapshot_id || s.short_id == snapshot_id)
                .ok_or_else(|| {
                    BackrunError::Tool(format!(
                        "snapshot {} not listed by repository",
                        snapshot_id
                    ))
                })
        }
        .await;

        let outcome = result.map(|snapshot| {
            op.payload = OperationPayload::IndexSnapshot {
                snapshot: Some(snapshot),
                forgotten: false,
            };
        });
        self.finish_op(&mut op, outcome.as_ref().map(|_| ()), handle)?;
        Ok(outcome.is_ok())
    }

    /// Apply the retention policy to the plan's snapshots.
    async fn run_forget(
        &self,
        plan: &Plan,
        repo: &Repo,
        policy: RetentionPolicy,
        snapshot_id: &str,
        handle: &WorkflowHandle,
    ) -> Result<bool> {
        let mut op = Operation::new(
            &plan.id,
            &repo.id,
            OperationPayload::Forget {
                policy,
                removed: Vec::new(),
            },
        )
        .with_snapshot(snapshot_id);
        let _guard = self.add_child(&mut op, handle)?;
        let log_ref = self.start_op(&mut op)?;

        let result = async {
            let mut sink = self.inner.logs.new_writer(&log_ref)?;
            let snapshots = self
                .inner
                .tool
                .snapshots(repo, Some(&plan.id), handle.token(), &mut *sink)
                .await?;
            let decision = retention::evaluate(&policy, &snapshots);
            writeln!(
                sink,
                "[backrun] retention keeps {} snapshots, removes {}",
                decision.keep.len(),
                decision.remove.len()
            )?;
            let ids: Vec<String> = decision.remove.iter().map(|s| s.id.clone()).collect();
            self.inner
                .tool
                .forget(repo, &ids, handle.token(), &mut *sink)
                .await?;
            Ok(decision.remove)
        }
        .await;

        let outcome = result.map(|removed| {
            self.mark_forgotten(&removed);
            op.payload = OperationPayload::Forget { policy, removed };
        });
        self.finish_op(&mut op, outcome.as_ref().map(|_| ()), handle)?;
        Ok(outcome.is_ok())
    }

    /// Flag the IndexSnapshot operations of removed snapshots.
    fn mark_forgotten(&self, removed: &[SnapshotInfo]) {
        for snapshot in removed {
            let ops = match self.inner.oplog.for_snapshot(&snapshot.id) {
                Ok(ops) => ops,
                Err(e) => {
                    warn!(snapshot_id = %snapshot.id, error = %e, "Failed to look up snapshot");
                    continue;
                }
            };
            for mut op in ops {
                if let OperationPayload::IndexSnapshot { forgotten, .. } = &mut op.payload {
                    if *forgotten {
                        continue;
                    }
                    *forgotten = true;
                    if let Err(e) = self.inner.oplog.update(&op) {
                        warn!(op_id = op.id, error = %e, "Failed to mark snapshot forgotten");
                    }
                }
            }
        }
    }

    pub(super) async fn run_prune(&self, mut op: Operation, handle: &WorkflowHandle) -> Result<()> {
        let config = self.config();
        let (plan, repo) = match resolve(&config, &op) {
            Ok(found) => found,
            Err(e) => return self.finish_op(&mut op, Err(&e), handle),
        };
        let ctx = HookContext::new(&plan.id, &repo.id);

        if let Err(e) = self
            .run_hooks(plan, HookCondition::PruneStart, &ctx, op.id, handle)
            .await
        {
            self.finish_op(&mut op, Err(&e), handle)?;
            self.error_hooks(plan, &[HookCondition::AnyError], &ctx, op.id, &e, handle)
                .await;
            return Ok(());
        }
        if handle.token().is_cancelled() {
            return self.finish_op(&mut op, Err(&BackrunError::Cancelled), handle);
        }

        let log_ref = self.start_op(&mut op)?;
        let result = async {
            let mut sink = self.inner.logs.new_writer(&log_ref)?;
            self.ensure_repo(repo, handle.token(), &mut *sink).await?;
            self.inner.tool.prune(repo, handle.token(), &mut *sink).await
        }
        .await;

        match result {
            Ok(output) => {
                op.payload = OperationPayload::Prune { output };
                self.finish_op(&mut op, Ok(()), handle)?;
                self.notify_hooks(plan, &[HookCondition::PruneEnd], &ctx, op.id, handle)
                    .await;
            }
            Err(e) => {
                self.finish_op(&mut op, Err(&e), handle)?;
                self.error_hooks(plan, &[HookCondition::AnyError], &ctx, op.id, &e, handle)
                    .await;
            }
        }
        Ok(())
    }

    pub(super) async fn run_stats(&self, mut op: Operation, handle: &WorkflowHandle) -> Result<()> {
        let config = self.config();
        let Some(repo) = config.repo(&op.repo_id) else {
            let err = BackrunError::NotFound(format!("repo {}", op.repo_id));
            return self.finish_op(&mut op, Err(&err), handle);
        };

        let log_ref = self.start_op(&mut op)?;
        let result = async {
            let mut sink = self.inner.logs.new_writer(&log_ref)?;
            self.ensure_repo(repo, handle.token(), &mut *sink).await?;
            self.inner.tool.stats(repo, handle.token(), &mut *sink).await
        }
        .await;

        let outcome = result.map(|stats| {
            op.payload = OperationPayload::Stats { stats: Some(stats) };
        });
        self.finish_op(&mut op, outcome.as_ref().map(|_| ()), handle)
    }

    pub(super) async fn run_restore(&self, mut op: Operation, handle: &WorkflowHandle) -> Result<()> {
        let config = self.config();
        let (_, repo) = match resolve(&config, &op) {
            Ok(found) => found,
            Err(e) => return self.finish_op(&mut op, Err(&e), handle),
        };
        let OperationPayload::Restore {
            snapshot_id,
            path,
            target,
            ..
        } = op.payload.clone()
        else {
            let err = BackrunError::InvalidState(format!("operation {} is not a restore", op.id));
            return self.finish_op(&mut op, Err(&err), handle);
        };

        let log_ref = self.start_op(&mut op)?;
        let result = async {
            let mut sink = self.inner.logs.new_writer(&log_ref)?;
            self.inner
                .tool
                .restore(repo, &snapshot_id, &path, &target, handle.token(), &mut *sink)
                .await
        }
        .await;

        let outcome = result.map(|summary| {
            op.payload = OperationPayload::Restore {
                snapshot_id: snapshot_id.clone(),
                path: path.clone(),
                target: target.clone(),
                summary: Some(summary),
            };
        });
        self.finish_op(&mut op, outcome.as_ref().map(|_| ()), handle)
    }

    /// Create IndexSnapshot operations for snapshots the log does not know about yet.
    pub(super) async fn index_repo(&self, repo_id: &str, handle: &WorkflowHandle) -> Result<usize> {
        let config = self.config();
        let repo = config
            .repo(repo_id)
            .ok_or_else(|| BackrunError::NotFound(format!("repo {}", repo_id)))?;

        let mut sink = logstore::discard();
        let snapshots = self
            .inner
            .tool
            .snapshots(repo, None, handle.token(), &mut *sink)
            .await?;

        let mut added = 0;
        for snapshot in snapshots {
            let known = self
                .inner
                .oplog
                .for_snapshot(&snapshot.id)?
                .iter()
                .any(|op| matches!(op.payload, OperationPayload::IndexSnapshot { .. }));
            if known {
                continue;
            }

            let mut op = Operation::new(
                snapshot.plan_id().unwrap_or_default(),
                &repo.id,
                OperationPayload::IndexSnapshot {
                    snapshot: Some(snapshot.clone()),
                    forgotten: false,
                },
            )
            .with_snapshot(&snapshot.id);
            op.start_time = snapshot.time;
            self.inner.oplog.add(&mut op)?;
            op.transition(OperationStatus::Success)?;
            self.inner.oplog.update(&op)?;
            added += 1;
        }
        Ok(added)
    }
}
