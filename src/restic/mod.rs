//! The backup tool seam and its restic implementation.
//!
//! The orchestrator only talks to [`BackupTool`]. [`Restic`] shells out through the
//! [`TaskExecutor`], passing the repository password and env overrides through the
//! environment and parsing the tool's `--json` output.

use crate::binary::BinaryProvider;
use crate::config::{Plan, Repo};
use crate::error::{BackrunError, Result};
use crate::task::{CommandSpec, TaskExecutor};
use crate::types::{BackupSummary, RepoStats, RestoreSummary, SnapshotInfo, PLAN_TAG_PREFIX};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Operations the orchestrator needs from a snapshot-based backup tool.
#[async_trait]
pub trait BackupTool: Send + Sync {
    /// Make sure the repository exists, creating it if needed.
    async fn ensure_initialized(
        &self,
        repo: &Repo,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<()>;

    /// Snapshot the plan's paths, tagging the snapshot with the plan id.
    async fn backup(
        &self,
        repo: &Repo,
        plan: &Plan,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<BackupSummary>;

    /// List snapshots, restricted to one plan's tag if `plan_id` is given.
    async fn snapshots(
        &self,
        repo: &Repo,
        plan_id: Option<&str>,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<Vec<SnapshotInfo>>;

    /// Remove the given snapshots.
    async fn forget(
        &self,
        repo: &Repo,
        snapshot_ids: &[String],
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<()>;

    /// Reclaim space from forgotten snapshots. Returns the tool's report.
    async fn prune(
        &self,
        repo: &Repo,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<String>;

    async fn stats(
        &self,
        repo: &Repo,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<RepoStats>;

    /// Restore `path` (everything if empty) from a snapshot into `target`.
    async fn restore(
        &self,
        repo: &Repo,
        snapshot_id: &str,
        path: &str,
        target: &str,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<RestoreSummary>;
}

/// [`BackupTool`] backed by the restic binary.
pub struct Restic {
    binary: Arc<dyn BinaryProvider>,
    executor: TaskExecutor,
}

impl Restic {
    pub fn new(binary: Arc<dyn BinaryProvider>, executor: TaskExecutor) -> Self {
        Self { binary, executor }
    }

    fn command(&self, repo: &Repo, subcommand: &str) -> Result<CommandSpec> {
        let mut spec = CommandSpec::new(self.binary.locate()?)
            .arg(subcommand)
            .arg("--repo")
            .arg(&repo.uri)
            .args(repo.flags.iter().cloned());
        if !repo.password.is_empty() {
            spec = spec.env("RESTIC_PASSWORD", &repo.password);
        }
        for (key, value) in repo.env_pairs() {
            spec = spec.env(key, value);
        }
        Ok(spec)
    }
}

pub(crate) fn plan_tag(plan_id: &str) -> String {
    format!("{}{}", PLAN_TAG_PREFIX, plan_id)
}

/// Find the `"message_type": "summary"` line in restic's JSON-lines output.
pub(crate) fn parse_summary<T: DeserializeOwned>(stdout: &str) -> Result<T> {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if value.get("message_type").and_then(|m| m.as_str()) == Some("summary") {
            return serde_json::from_value(value)
                .map_err(|e| BackrunError::Tool(format!("bad summary: {}", e)));
        }
    }
    Err(BackrunError::Tool("no summary in output".to_string()))
}

/// Parse a single JSON document, skipping any leading non-JSON noise.
pub(crate) fn parse_document<T: DeserializeOwned>(stdout: &str) -> Result<T> {
    let start = stdout
        .find(|c| c == '[' || c == '{')
        .ok_or_else(|| BackrunError::Tool("no JSON in output".to_string()))?;
    serde_json::from_str(stdout[start..].trim())
        .map_err(|e| BackrunError::Tool(format!("bad JSON output: {}", e)))
}

#[async_trait]
impl BackupTool for Restic {
    async fn ensure_initialized(
        &self,
        repo: &Repo,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        let check_config = self.command(repo, "cat")?.arg("config");
        match self.executor.execute(cancel, &check_config, sink).await {
            Ok(_) => return Ok(()),
            Err(BackrunError::Process { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(repo_id = %repo.id, "Initializing repository");
        let init = self.command(repo, "init")?;
        self.executor.execute(cancel, &init, sink).await?;
        Ok(())
    }

    async fn backup(
        &self,
        repo: &Repo,
        plan: &Plan,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<BackupSummary> {
        let mut spec = self
            .command(repo, "backup")?
            .arg("--json")
            .arg("--tag")
            .arg(plan_tag(&plan.id));
        for exclude in &plan.excludes {
            spec = spec.arg("--exclude").arg(exclude);
        }
        spec = spec.args(plan.paths.iter().cloned());

        let output = self.executor.execute(cancel, &spec, sink).await?;
        let summary: BackupSummary = parse_summary(&output.stdout)?;
        if summary.snapshot_id.is_empty() {
            return Err(BackrunError::Tool(
                "backup summary has no snapshot id".to_string(),
            ));
        }
        debug!(plan_id = %plan.id, snapshot_id = %summary.snapshot_id, "Backup finished");
        Ok(summary)
    }

    async fn snapshots(
        &self,
        repo: &Repo,
        plan_id: Option<&str>,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<Vec<SnapshotInfo>> {
        let mut spec = self.command(repo, "snapshots")?.arg("--json");
        if let Some(plan_id) = plan_id {
            spec = spec.arg("--tag").arg(plan_tag(plan_id));
        }
        let output = self.executor.execute(cancel, &spec, sink).await?;
        parse_document(&output.stdout)
    }

    async fn forget(
        &self,
        repo: &Repo,
        snapshot_ids: &[String],
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        if snapshot_ids.is_empty() {
            return Ok(());
        }
        let spec = self
            .command(repo, "forget")?
            .args(snapshot_ids.iter().cloned());
        self.executor.execute(cancel, &spec, sink).await?;
        Ok(())
    }

    async fn prune(
        &self,
        repo: &Repo,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<String> {
        let spec = self.command(repo, "prune")?;
        let output = self.executor.execute(cancel, &spec, sink).await?;
        Ok(output.stdout)
    }

    async fn stats(
        &self,
        repo: &Repo,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<RepoStats> {
        let spec = self
            .command(repo, "stats")?
            .arg("--json")
            .arg("--mode")
            .arg("raw-data");
        let output = self.executor.execute(cancel, &spec, sink).await?;
        parse_document(&output.stdout)
    }

    async fn restore(
        &self,
        repo: &Repo,
        snapshot_id: &str,
        path: &str,
        target: &str,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<RestoreSummary> {
        let mut spec = self
            .command(repo, "restore")?
            .arg("--json")
            .arg(snapshot_id)
            .arg("--target")
            .arg(target);
        if !path.is_empty() {
            spec = spec.arg("--include").arg(path);
        }
        let output = self.executor.execute(cancel, &spec, sink).await?;
        // Older restic versions print no JSON summary for restore.
        Ok(parse_summary(&output.stdout).unwrap_or_default())
    }
}
