//! Hook execution.
//!
//! Hooks are shell commands declared on a plan and run at lifecycle conditions. Before the
//! command runs, `{{ name }}` placeholders are replaced with values from the
//! [`HookContext`], and the same values are exported as `BACKRUN_*` variables.

use crate::config::{Hook, HookAction, HookCondition};
use crate::error::Result;
use crate::task::{CommandSpec, TaskExecutor};
use regex::Regex;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Values available to a hook command.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub plan_id: String,
    pub repo_id: String,
    pub snapshot_id: Option<String>,
    pub event: Option<HookCondition>,
    pub error: Option<String>,
    pub cwd: Option<PathBuf>,
}

impl HookContext {
    pub fn new(plan_id: impl Into<String>, repo_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            repo_id: repo_id.into(),
            ..Default::default()
        }
    }

    fn value(&self, name: &str) -> Option<String> {
        match name {
            "plan_id" => Some(self.plan_id.clone()),
            "repo_id" => Some(self.repo_id.clone()),
            "snapshot_id" => Some(self.snapshot_id.clone().unwrap_or_default()),
            "event" => Some(self.event.map(|e| e.as_str().to_string()).unwrap_or_default()),
            "error" => Some(self.error.clone().unwrap_or_default()),
            _ => None,
        }
    }

    fn env(&self) -> Vec<(String, String)> {
        ["plan_id", "repo_id", "snapshot_id", "event", "error"]
            .iter()
            .filter_map(|name| {
                self.value(name)
                    .map(|v| (format!("BACKRUN_{}", name.to_ascii_uppercase()), v))
            })
            .collect()
    }

    /// Replace `{{ name }}` placeholders. Unknown names are left untouched.
    pub fn render(&self, template: &str) -> String {
        static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
        let re = PLACEHOLDER
            .get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("valid placeholder regex"));
        re.replace_all(template, |caps: &regex::Captures<'_>| {
            self.value(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
    }
}

/// Runs hook actions through the task executor.
#[derive(Debug, Clone)]
pub struct HookExecutor {
    shell: PathBuf,
    executor: TaskExecutor,
}

impl Default for HookExecutor {
    fn default() -> Self {
        Self::new(TaskExecutor::new())
    }
}

impl HookExecutor {
    pub fn new(executor: TaskExecutor) -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            executor,
        }
    }

    /// Run `hook` with `ctx`. A non-zero exit surfaces as [`crate::BackrunError::Process`].
    pub async fn run(
        &self,
        hook: &Hook,
        ctx: &HookContext,
        cancel: &CancellationToken,
        sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        match &hook.action {
            HookAction::Command { command } => {
                let script = ctx.render(command);
                debug!(plan_id = %ctx.plan_id, event = ?ctx.event, "Running hook command");

                let mut spec = CommandSpec::new(&self.shell).arg("-c").arg(script);
                spec.env = ctx.env();
                spec.cwd = ctx.cwd.clone();

                self.executor.execute(cancel, &spec, sink).await?;
                Ok(())
            }
        }
    }
}
