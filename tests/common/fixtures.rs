// Config fixtures for integration tests

use backrun::config::{Config, Hook, HookCondition, Plan, Repo, RetentionPolicy};

/// A repo with the given id pointing at a local path.
pub fn repo(id: &str) -> Repo {
    Repo {
        id: id.to_string(),
        uri: format!("/tmp/backrun-test/{}", id),
        password: "test".to_string(),
        ..Default::default()
    }
}

/// A plan backing up `/data` into `repo` with no schedule.
pub fn plan(id: &str, repo: &str) -> Plan {
    Plan {
        id: id.to_string(),
        repo: repo.to_string(),
        paths: vec!["/data".to_string()],
        ..Default::default()
    }
}

/// A plan with a retention policy.
pub fn plan_with_retention(id: &str, repo: &str, retention: RetentionPolicy) -> Plan {
    Plan {
        retention: Some(retention),
        ..plan(id, repo)
    }
}

/// A plan with shell hooks.
pub fn plan_with_hooks(id: &str, repo: &str, hooks: Vec<(HookCondition, String)>) -> Plan {
    Plan {
        hooks: hooks
            .into_iter()
            .map(|(condition, command)| Hook::command(condition, command))
            .collect(),
        ..plan(id, repo)
    }
}

/// A config holding the given repos and plans.
pub fn config(repos: Vec<Repo>, plans: Vec<Plan>) -> Config {
    Config {
        modno: 0,
        repos,
        plans,
    }
}

/// One repo `local` and one plan `nightly` with the given retention.
pub fn single_plan_config(retention: Option<RetentionPolicy>) -> Config {
    let mut plan = plan("nightly", "local");
    plan.retention = retention;
    config(vec![repo("local")], vec![plan])
}
