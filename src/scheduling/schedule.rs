//! Next fire times for every scheduled plan.

use super::CronExpr;
use crate::config::Config;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Entry {
    expr: CronExpr,
    next: DateTime<Utc>,
}

/// Plan id to next fire time, derived from a config snapshot.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    entries: HashMap<String, Entry>,
}

impl Schedule {
    /// Schedule every plan of `config` with a valid, non-empty cron for its first fire
    /// strictly after `now`. Plans with a bad cron are logged and skipped.
    pub fn from_config(config: &Config, now: DateTime<Utc>) -> Self {
        let mut entries = HashMap::new();
        for plan in &config.plans {
            if plan.cron.trim().is_empty() {
                continue;
            }
            match CronExpr::parse(&plan.cron) {
                Ok(expr) => {
                    if let Some(next) = expr.next_run(&now) {
                        debug!(plan_id = %plan.id, next = %next, "Computed next run");
                        entries.insert(plan.id.clone(), Entry { expr, next });
                    }
                }
                Err(e) => warn!(plan_id = %plan.id, error = %e, "Skipping plan with bad cron"),
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When `plan_id` fires next.
    pub fn next_fire(&self, plan_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(plan_id).map(|e| e.next)
    }

    /// The earliest fire time across all plans.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|e| e.next).min()
    }

    /// Plans due at `now`, in id order. Each is rescheduled to its first fire after `now`;
    /// a plan with no further fire time leaves the schedule.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.next <= now)
            .map(|(plan_id, _)| plan_id.clone())
            .collect();
        due.sort_unstable();

        for plan_id in &due {
            let next = self
                .entries
                .get(plan_id)
                .and_then(|e| e.expr.next_run(&now));
            match next {
                Some(next) => {
                    if let Some(entry) = self.entries.get_mut(plan_id) {
                        entry.next = next;
                    }
                }
                None => {
                    self.entries.remove(plan_id);
                }
            }
        }
        due
    }
}
