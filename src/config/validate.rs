//! Structural validation of the declarative config.

use super::model::{Config, HookAction};
use crate::error::{BackrunError, Result};
use crate::scheduling::CronExpr;
use std::collections::HashSet;

fn invalid(msg: impl Into<String>) -> BackrunError {
    BackrunError::Validation(msg.into())
}

fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(invalid(format!("{} id is required", kind)));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(format!(
            "{} id {:?} may only contain letters, digits, '-' and '_'",
            kind, id
        )));
    }
    Ok(())
}

/// Validate a config before it is persisted.
pub fn validate_config(config: &Config) -> Result<()> {
    let mut repo_ids = HashSet::new();
    for repo in &config.repos {
        validate_id("repo", &repo.id)?;
        if !repo_ids.insert(repo.id.as_str()) {
            return Err(invalid(format!("repo id {:?} is not unique", repo.id)));
        }
        if repo.uri.trim().is_empty() {
            return Err(invalid(format!("repo {:?}: uri is required", repo.id)));
        }
        if let Some(bad) = repo.env.iter().find(|e| !e.contains('=')) {
            return Err(invalid(format!(
                "repo {:?}: env entry {:?} must be KEY=VALUE",
                repo.id, bad
            )));
        }
    }

    let mut plan_ids = HashSet::new();
    for plan in &config.plans {
        validate_id("plan", &plan.id)?;
        if !plan_ids.insert(plan.id.as_str()) {
            return Err(invalid(format!("plan id {:?} is not unique", plan.id)));
        }
        if !repo_ids.contains(plan.repo.as_str()) {
            return Err(invalid(format!(
                "plan {:?}: repo {:?} does not exist",
                plan.id, plan.repo
            )));
        }
        if plan.paths.is_empty() {
            return Err(invalid(format!("plan {:?}: at least one path is required", plan.id)));
        }
        if !plan.cron.trim().is_empty() {
            CronExpr::parse(&plan.cron)
                .map_err(|e| invalid(format!("plan {:?}: bad cron: {}", plan.id, e)))?;
        }
        for (index, hook) in plan.hooks.iter().enumerate() {
            if hook.conditions.is_empty() {
                return Err(invalid(format!(
                    "plan {:?}: hook {} has no conditions",
                    plan.id, index
                )));
            }
            match &hook.action {
                HookAction::Command { command } if command.trim().is_empty() => {
                    return Err(invalid(format!(
                        "plan {:?}: hook {} has an empty command",
                        plan.id, index
                    )));
                }
                HookAction::Command { .. } => {}
            }
        }
    }

    Ok(())
}
