//! Declarative repository and plan configuration.

use serde::{Deserialize, Serialize};

/// Aggregate root of repos and plans.
///
/// `modno` is the optimistic-concurrency version: a write must present the modno it last read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modno: u64,
    #[serde(default)]
    pub repos: Vec<Repo>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

impl Config {
    pub fn plan(&self, id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == id)
    }

    pub fn repo(&self, id: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.id == id)
    }
}

/// A backup repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    /// Repository location understood by the backup tool.
    pub uri: String,
    #[serde(default)]
    pub password: String,
    /// Extra environment for tool invocations, as `KEY=VALUE`.
    #[serde(default)]
    pub env: Vec<String>,
    /// Extra global flags passed to every tool invocation.
    #[serde(default)]
    pub flags: Vec<String>,
}

impl Repo {
    /// Parsed environment overrides.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|e| e.split_once('='))
    }
}

/// A backup plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    /// Target repo id.
    pub repo: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Cron expression; empty disables scheduled runs.
    #[serde(default)]
    pub cron: String,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

impl Plan {
    /// Hooks for a condition, in declaration order, with their declaration index.
    pub fn hooks_for(&self, condition: HookCondition) -> impl Iterator<Item = (usize, &Hook)> {
        self.hooks
            .iter()
            .enumerate()
            .filter(move |(_, h)| h.conditions.contains(&condition))
    }
}

/// Declarative retention rules evaluated by the forget step.
///
/// A count of zero disables the rule. When several rules are set the snapshots kept are
/// the union of what each rule keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub keep_last_n: u32,
    #[serde(default)]
    pub keep_hourly: u32,
    #[serde(default)]
    pub keep_daily: u32,
    #[serde(default)]
    pub keep_weekly: u32,
    #[serde(default)]
    pub keep_monthly: u32,
    #[serde(default)]
    pub keep_yearly: u32,
}

impl RetentionPolicy {
    /// Keep only the newest `n` snapshots.
    pub fn keep_last(n: u32) -> Self {
        Self {
            keep_last_n: n,
            ..Default::default()
        }
    }

    /// Whether any rule is set.
    pub fn has_rules(&self) -> bool {
        self.keep_last_n > 0
            || self.keep_hourly > 0
            || self.keep_daily > 0
            || self.keep_weekly > 0
            || self.keep_monthly > 0
            || self.keep_yearly > 0
    }
}

/// Lifecycle point at which a hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookCondition {
    SnapshotStart,
    SnapshotEnd,
    SnapshotError,
    AnyError,
    PruneStart,
    PruneEnd,
}

impl HookCondition {
    /// Failures at start conditions abort the step that follows.
    pub fn is_start(&self) -> bool {
        matches!(self, HookCondition::SnapshotStart | HookCondition::PruneStart)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookCondition::SnapshotStart => "SNAPSHOT_START",
            HookCondition::SnapshotEnd => "SNAPSHOT_END",
            HookCondition::SnapshotError => "SNAPSHOT_ERROR",
            HookCondition::AnyError => "ANY_ERROR",
            HookCondition::PruneStart => "PRUNE_START",
            HookCondition::PruneEnd => "PRUNE_END",
        }
    }
}

/// A user-defined hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub conditions: Vec<HookCondition>,
    pub action: HookAction,
}

impl Hook {
    /// Shell command hook firing on a single condition.
    pub fn command(condition: HookCondition, command: impl Into<String>) -> Self {
        Self {
            conditions: vec![condition],
            action: HookAction::Command {
                command: command.into(),
            },
        }
    }
}

/// What a hook does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookAction {
    /// Run a shell command.
    Command { command: String },
}
