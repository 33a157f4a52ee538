// In-memory backup tool for orchestrator tests

use async_trait::async_trait;
use backrun::config::{Plan, Repo};
use backrun::error::{BackrunError, Result};
use backrun::restic::BackupTool;
use backrun::types::{BackupSummary, RepoStats, RestoreSummary, SnapshotInfo, PLAN_TAG_PREFIX};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Keeps snapshots per repository in memory and records what it was asked to do.
#[derive(Default)]
pub struct FakeTool {
    snapshots: Mutex<HashMap<String, Vec<SnapshotInfo>>>,
    counter: AtomicU64,
    backup_delay: Mutex<Duration>,
    fail_backups: AtomicBool,
    calls: Mutex<Vec<String>>,
    active: Mutex<HashMap<String, usize>>,
    max_active: Mutex<HashMap<String, usize>>,
}

impl FakeTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every backup take `delay` (cancellable).
    pub fn set_backup_delay(&self, delay: Duration) {
        *self.backup_delay.lock() = delay;
    }

    pub fn set_fail_backups(&self, fail: bool) {
        self.fail_backups.store(fail, Ordering::SeqCst);
    }

    /// Calls in the order they started, as `<command>:<detail>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Highest number of overlapping calls seen on one repository.
    pub fn max_concurrency(&self, repo_id: &str) -> usize {
        self.max_active.lock().get(repo_id).copied().unwrap_or(0)
    }

    pub fn snapshot_count(&self, repo_id: &str) -> usize {
        self.snapshots.lock().get(repo_id).map(Vec::len).unwrap_or(0)
    }

    /// Seed a snapshot as if created outside the daemon.
    pub fn seed_snapshot(&self, repo_id: &str, plan_id: &str) -> String {
        let snapshot = self.make_snapshot(plan_id);
        let id = snapshot.id.clone();
        self.snapshots
            .lock()
            .entry(repo_id.to_string())
            .or_default()
            .push(snapshot);
        id
    }

    fn make_snapshot(&self, plan_id: &str) -> SnapshotInfo {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{:016x}{:048x}", n, n);
        SnapshotInfo {
            short_id: id[..8].to_string(),
            id,
            time: Utc::now() + ChronoDuration::seconds(n as i64),
            paths: vec!["/data".to_string()],
            hostname: "test-host".to_string(),
            username: "root".to_string(),
            tags: vec![format!("{}{}", PLAN_TAG_PREFIX, plan_id)],
            parent: None,
        }
    }

    fn enter(&self, repo_id: &str, call: String) {
        self.calls.lock().push(call);
        let mut active = self.active.lock();
        let count = active.entry(repo_id.to_string()).or_default();
        *count += 1;
        let mut max = self.max_active.lock();
        let seen = max.entry(repo_id.to_string()).or_default();
        *seen = (*seen).max(*count);
    }

    fn exit(&self, repo_id: &str) {
        if let Some(count) = self.active.lock().get_mut(repo_id) {
            *count = count.saturating_sub(1);
        }
    }

    async fn backup_inner(
        &self,
        repo: &Repo,
        plan: &Plan,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<BackupSummary> {
        writeln!(sink, "backing up {}", plan.paths.join(" "))?;
        let delay = *self.backup_delay.lock();
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackrunError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(BackrunError::Cancelled);
        }
        if self.fail_backups.load(Ordering::SeqCst) {
            return Err(BackrunError::Process {
                command: "restic backup".to_string(),
                code: Some(1),
                tail: "Fatal: unable to open config file".to_string(),
            });
        }

        let snapshot = self.make_snapshot(&plan.id);
        let summary = BackupSummary {
            files_new: 1,
            data_added: 128,
            total_files_processed: 1,
            total_bytes_processed: 128,
            snapshot_id: snapshot.id.clone(),
            ..Default::default()
        };
        self.snapshots
            .lock()
            .entry(repo.id.clone())
            .or_default()
            .push(snapshot);
        Ok(summary)
    }
}

#[async_trait]
impl BackupTool for FakeTool {
    async fn ensure_initialized(
        &self,
        repo: &Repo,
        _cancel: &CancellationToken,
        _sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        self.calls.lock().push(format!("init:{}", repo.id));
        Ok(())
    }

    async fn backup(
        &self,
        repo: &Repo,
        plan: &Plan,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<BackupSummary> {
        self.enter(&repo.id, format!("backup:{}", plan.id));
        let result = self.backup_inner(repo, plan, cancel, sink).await;
        self.exit(&repo.id);
        result
    }

    async fn snapshots(
        &self,
        repo: &Repo,
        plan_id: Option<&str>,
        _cancel: &CancellationToken,
        _sink: &mut (dyn Write + Send),
    ) -> Result<Vec<SnapshotInfo>> {
        let snapshots = self.snapshots.lock();
        Ok(snapshots
            .get(&repo.id)
            .map(|list| {
                list.iter()
                    .filter(|s| plan_id.map_or(true, |p| s.plan_id() == Some(p)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn forget(
        &self,
        repo: &Repo,
        snapshot_ids: &[String],
        _cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        self.calls
            .lock()
            .push(format!("forget:{}", snapshot_ids.len()));
        writeln!(sink, "removed {} snapshots", snapshot_ids.len())?;
        if let Some(list) = self.snapshots.lock().get_mut(&repo.id) {
            list.retain(|s| !snapshot_ids.contains(&s.id));
        }
        Ok(())
    }

    async fn prune(
        &self,
        repo: &Repo,
        _cancel: &CancellationToken,
        _sink: &mut (dyn Write + Send),
    ) -> Result<String> {
        self.calls.lock().push(format!("prune:{}", repo.id));
        Ok("this removes 0 B of unreferenced data".to_string())
    }

    async fn stats(
        &self,
        repo: &Repo,
        _cancel: &CancellationToken,
        _sink: &mut (dyn Write + Send),
    ) -> Result<RepoStats> {
        Ok(RepoStats {
            total_size: 128 * self.snapshot_count(&repo.id) as u64,
            snapshots_count: self.snapshot_count(&repo.id) as u64,
            ..Default::default()
        })
    }

    async fn restore(
        &self,
        _repo: &Repo,
        snapshot_id: &str,
        _path: &str,
        target: &str,
        _cancel: &CancellationToken,
        _sink: &mut (dyn Write + Send),
    ) -> Result<RestoreSummary> {
        self.calls
            .lock()
            .push(format!("restore:{}:{}", snapshot_id, target));
        Ok(RestoreSummary {
            total_files: 1,
            files_restored: 1,
            total_bytes: 128,
            bytes_restored: 128,
        })
    }
}
