//! Retention policy evaluation.
//!
//! Snapshots are walked newest first. `keep_last_n` keeps the newest N; each time-bucketed
//! rule keeps the newest snapshot of each of its most recent N distinct buckets (hour, day,
//! ISO week, month, year). A snapshot is kept if any rule keeps it.

use crate::config::RetentionPolicy;
use crate::types::SnapshotInfo;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::HashSet;

/// Result of evaluating a policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionDecision {
    pub keep: Vec<SnapshotInfo>,
    pub remove: Vec<SnapshotInfo>,
}

type BucketFn = fn(&DateTime<Utc>) -> (i32, u32, u32, u32);

fn hourly(t: &DateTime<Utc>) -> (i32, u32, u32, u32) {
    (t.year(), t.month(), t.day(), t.hour())
}

fn daily(t: &DateTime<Utc>) -> (i32, u32, u32, u32) {
    (t.year(), t.month(), t.day(), 0)
}

fn weekly(t: &DateTime<Utc>) -> (i32, u32, u32, u32) {
    let week = t.iso_week();
    (week.year(), week.week(), 0, 0)
}

fn monthly(t: &DateTime<Utc>) -> (i32, u32, u32, u32) {
    (t.year(), t.month(), 0, 0)
}

fn yearly(t: &DateTime<Utc>) -> (i32, u32, u32, u32) {
    (t.year(), 0, 0, 0)
}

struct BucketRule {
    remaining: u32,
    bucket: BucketFn,
    last: Option<(i32, u32, u32, u32)>,
}

/// Split `snapshots` into those `policy` keeps and those it removes.
///
/// A policy without any rule keeps everything. Both lists are ordered newest first.
pub fn evaluate(policy: &RetentionPolicy, snapshots: &[SnapshotInfo]) -> RetentionDecision {
    let mut sorted: Vec<SnapshotInfo> = snapshots.to_vec();
    sorted.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| b.id.cmp(&a.id)));

    if !policy.has_rules() {
        return RetentionDecision {
            keep: sorted,
            remove: Vec::new(),
        };
    }

    let mut rules: Vec<BucketRule> = [
        (policy.keep_hourly, hourly as BucketFn),
        (policy.keep_daily, daily),
        (policy.keep_weekly, weekly),
        (policy.keep_monthly, monthly),
        (policy.keep_yearly, yearly),
    ]
    .into_iter()
    .filter(|(count, _)| *count > 0)
    .map(|(remaining, bucket)| BucketRule {
        remaining,
        bucket,
        last: None,
    })
    .collect();

    let mut kept: HashSet<usize> = HashSet::new();
    for (i, snapshot) in sorted.iter().enumerate() {
        if (i as u64) < u64::from(policy.keep_last_n) {
            kept.insert(i);
        }
        for rule in rules.iter_mut() {
            if rule.remaining == 0 {
                continue;
            }
            let key = (rule.bucket)(&snapshot.time);
            if rule.last != Some(key) {
                rule.last = Some(key);
                rule.remaining -= 1;
                kept.insert(i);
            }
        }
    }

    let mut decision = RetentionDecision::default();
    for (i, snapshot) in sorted.into_iter().enumerate() {
        if kept.contains(&i) {
            decision.keep.push(snapshot);
        } else {
            decision.remove.push(snapshot);
        }
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snap(id: &str, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> SnapshotInfo {
        SnapshotInfo {
            id: id.to_string(),
            short_id: id.to_string(),
            time: Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap(),
            paths: vec!["/data".into()],
            hostname: "host".into(),
            username: "root".into(),
            tags: vec![],
            parent: None,
        }
    }

    fn ids(list: &[SnapshotInfo]) -> Vec<&str> {
        list.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_keep_last_n() {
        let snaps = vec![
            snap("a", 2024, 1, 1, 10, 0),
            snap("c", 2024, 1, 3, 10, 0),
            snap("b", 2024, 1, 2, 10, 0),
        ];
        let decision = evaluate(&RetentionPolicy::keep_last(1), &snaps);
        assert_eq!(ids(&decision.keep), vec!["c"]);
        assert_eq!(ids(&decision.remove), vec!["b", "a"]);
    }

    #[test]
    fn test_keep_hourly_single_snapshot() {
        let snaps = vec![snap("only", 2024, 3, 1, 12, 0)];
        let policy = RetentionPolicy {
            keep_hourly: 1,
            ..Default::default()
        };
        let decision = evaluate(&policy, &snaps);
        assert_eq!(ids(&decision.keep), vec!["only"]);
        assert!(decision.remove.is_empty());
    }

    #[test]
    fn test_keep_hourly_keeps_newest_per_bucket() {
        let snaps = vec![
            snap("h10a", 2024, 3, 1, 10, 5),
            snap("h10b", 2024, 3, 1, 10, 45),
            snap("h11a", 2024, 3, 1, 11, 15),
            snap("h12a", 2024, 3, 1, 12, 0),
        ];
        let policy = RetentionPolicy {
            keep_hourly: 2,
            ..Default::default()
        };
        let decision = evaluate(&policy, &snaps);
        assert_eq!(ids(&decision.keep), vec!["h12a", "h11a"]);
        assert_eq!(ids(&decision.remove), vec!["h10b", "h10a"]);
    }

    #[test]
    fn test_weekly_uses_iso_weeks() {
        // 2024-12-30 belongs to ISO week 1 of 2025, same as 2025-01-02.
        let snaps = vec![
            snap("mon", 2024, 12, 30, 9, 0),
            snap("thu", 2025, 1, 2, 9, 0),
            snap("prev", 2024, 12, 27, 9, 0),
        ];
        let policy = RetentionPolicy {
            keep_weekly: 2,
            ..Default::default()
        };
        let decision = evaluate(&policy, &snaps);
        assert_eq!(ids(&decision.keep), vec!["thu", "prev"]);
        assert_eq!(ids(&decision.remove), vec!["mon"]);
    }

    #[test]
    fn test_multiple_rules_take_union() {
        let snaps = vec![
            snap("jan", 2024, 1, 15, 0, 0),
            snap("feb", 2024, 2, 15, 0, 0),
            snap("mar1", 2024, 3, 1, 0, 0),
            snap("mar2", 2024, 3, 2, 0, 0),
        ];
        let policy = RetentionPolicy {
            keep_last_n: 1,
            keep_monthly: 3,
            ..Default::default()
        };
        let decision = evaluate(&policy, &snaps);
        // keep_last_n keeps mar2; monthly keeps mar2, feb, jan
        assert_eq!(ids(&decision.keep), vec!["mar2", "feb", "jan"]);
        assert_eq!(ids(&decision.remove), vec!["mar1"]);
    }

    #[test]
    fn test_no_rules_keeps_everything() {
        let snaps = vec![snap("a", 2024, 1, 1, 0, 0), snap("b", 2024, 1, 2, 0, 0)];
        let decision = evaluate(&RetentionPolicy::default(), &snaps);
        assert_eq!(decision.keep.len(), 2);
        assert!(decision.remove.is_empty());
    }
}
