//! Core types for backrun operations.

use crate::config::{HookCondition, RetentionPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation identifier. Assigned by the operation log on first write, `0` means unassigned.
pub type OperationId = u64;

/// Status of an operation.
///
/// Transitions are `Pending -> Running -> {Success | Error | UserCancelled}`.
/// A pending operation may also be finalized directly (cancelled, or interrupted by restart).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Error,
    UserCancelled,
}

impl OperationStatus {
    /// Terminal states are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Error | OperationStatus::UserCancelled
        )
    }

    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        match (self, next) {
            (OperationStatus::Pending, OperationStatus::Pending) => false,
            (OperationStatus::Pending, _) => true,
            (OperationStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Success => "success",
            OperationStatus::Error => "error",
            OperationStatus::UserCancelled => "user_cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot as reported by the backup tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

impl SnapshotInfo {
    /// The plan id this snapshot was tagged with, if any.
    pub fn plan_id(&self) -> Option<&str> {
        self.tags.iter().find_map(|t| t.strip_prefix(PLAN_TAG_PREFIX))
    }
}

/// Tag prefix identifying which plan produced a snapshot.
pub const PLAN_TAG_PREFIX: &str = "plan:";

/// Summary of a completed backup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    #[serde(default)]
    pub files_new: u64,
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub files_unmodified: u64,
    #[serde(default)]
    pub data_added: u64,
    #[serde(default)]
    pub total_files_processed: u64,
    #[serde(default)]
    pub total_bytes_processed: u64,
    #[serde(default)]
    pub snapshot_id: String,
}

/// Summary of a completed restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub files_restored: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub bytes_restored: u64,
}

/// Repository statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_uncompressed_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
    #[serde(default)]
    pub total_blob_count: u64,
    #[serde(default)]
    pub snapshots_count: u64,
}

/// Step-specific payload of an operation.
///
/// Records are stored as tagged JSON; a kind written by a newer version decodes to
/// [`OperationPayload::Unknown`] instead of failing the whole scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    Backup {
        #[serde(default)]
        summary: Option<BackupSummary>,
    },
    IndexSnapshot {
        #[serde(default)]
        snapshot: Option<SnapshotInfo>,
        #[serde(default)]
        forgotten: bool,
    },
    Forget {
        #[serde(default)]
        policy: RetentionPolicy,
        /// Snapshots removed by this forget.
        #[serde(default)]
        removed: Vec<SnapshotInfo>,
    },
    RunHook {
        #[serde(default)]
        parent_op_id: Option<OperationId>,
        condition: HookCondition,
        #[serde(default)]
        hook_index: usize,
    },
    Restore {
        snapshot_id: String,
        #[serde(default)]
        path: String,
        target: String,
        #[serde(default)]
        summary: Option<RestoreSummary>,
    },
    Prune {
        #[serde(default)]
        output: String,
    },
    Stats {
        #[serde(default)]
        stats: Option<RepoStats>,
    },
    #[serde(other)]
    Unknown,
}

impl OperationPayload {
    /// Short kind name, used for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            OperationPayload::Backup { .. } => "backup",
            OperationPayload::IndexSnapshot { .. } => "index_snapshot",
            OperationPayload::Forget { .. } => "forget",
            OperationPayload::RunHook { .. } => "run_hook",
            OperationPayload::Restore { .. } => "restore",
            OperationPayload::Prune { .. } => "prune",
            OperationPayload::Stats { .. } => "stats",
            OperationPayload::Unknown => "unknown",
        }
    }
}

/// The unit of durable record in the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Assigned by the operation log; `0` until the first write.
    #[serde(default)]
    pub id: OperationId,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub repo_id: String,
    pub status: OperationStatus,
    /// Set once the backup tool reports a snapshot; immutable afterwards.
    #[serde(default)]
    pub snapshot_id: Option<String>,
    /// Reference into the log store holding raw command output.
    #[serde(default)]
    pub log_ref: Option<String>,
    /// Human readable status or error text.
    #[serde(default)]
    pub display_message: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub payload: OperationPayload,
}

impl Operation {
    /// Create a new pending operation.
    pub fn new(
        plan_id: impl Into<String>,
        repo_id: impl Into<String>,
        payload: OperationPayload,
    ) -> Self {
        Self {
            id: 0,
            plan_id: plan_id.into(),
            repo_id: repo_id.into(),
            status: OperationStatus::Pending,
            snapshot_id: None,
            log_ref: None,
            display_message: None,
            start_time: Utc::now(),
            end_time: None,
            payload,
        }
    }

    /// Set the snapshot id.
    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, stamping the end time for terminal states.
    pub fn transition(&mut self, next: OperationStatus) -> crate::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::BackrunError::InvalidState(format!(
                "operation {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        match next {
            OperationStatus::Running => {
                self.start_time = Utc::now();
                self.end_time = None;
            }
            s if s.is_terminal() => self.end_time = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use OperationStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(UserCancelled));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Error));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Success.can_transition_to(Running));
        assert!(!UserCancelled.can_transition_to(Error));
    }

    #[test]
    fn test_transition_stamps_end_time() {
        let mut op = Operation::new("plan", "repo", OperationPayload::Backup { summary: None });
        op.transition(OperationStatus::Running).unwrap();
        assert!(op.end_time.is_none());
        op.transition(OperationStatus::Success).unwrap();
        assert!(op.end_time.is_some());
        assert!(op.transition(OperationStatus::Error).is_err());
    }

    #[test]
    fn test_unknown_payload_kind_decodes() {
        let json = r#"{"id":7,"status":"SUCCESS","start_time":"2024-01-15T10:00:00Z",
            "payload":{"kind":"check","read_data":true}}"#;
        let op: Operation = serde_json::from_str(json).unwrap();
        assert_eq!(op.id, 7);
        assert_eq!(op.payload, OperationPayload::Unknown);
    }

    #[test]
    fn test_snapshot_plan_tag() {
        let snap = SnapshotInfo {
            id: "abc".into(),
            short_id: "abc".into(),
            time: Utc::now(),
            paths: vec![],
            hostname: String::new(),
            username: String::new(),
            tags: vec!["other".into(), "plan:nightly".into()],
            parent: None,
        };
        assert_eq!(snap.plan_id(), Some("nightly"));
    }
}
