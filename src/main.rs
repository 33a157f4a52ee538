//! Backrun CLI - Main entry point.

use anyhow::Context;
use backrun::cli::{Cli, Commands};
use backrun::config::{validate_config, BackrunSettings, Config};
use backrun::oplog::OpLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut settings = match &cli.config {
        Some(path) => BackrunSettings::from_file(path)?,
        None => BackrunSettings::default(),
    };
    settings.observability.log_level = cli.log_level;

    match cli.command {
        Commands::Serve {
            data_dir,
            config_path,
            restic,
        } => {
            if let Some(data_dir) = data_dir {
                settings.data_dir = data_dir;
            }
            if let Some(config_path) = config_path {
                settings.config_path = config_path;
            }
            if restic.is_some() {
                settings.restic_binary = restic;
            }

            backrun::run(settings).await?;
        }

        Commands::Validate { file } => {
            let path = file.unwrap_or_else(|| settings.config_path.clone());
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            validate_config(&config)?;
            println!(
                "{}: OK (modno {}, {} repos, {} plans)",
                path.display(),
                config.modno,
                config.repos.len(),
                config.plans.len()
            );
        }

        Commands::Operations {
            plan,
            repo,
            snapshot,
            limit,
            json,
        } => {
            let oplog = OpLog::open_read_only(settings.oplog_path())
                .context("opening the operation log")?;
            let ops = match (plan, repo, snapshot) {
                (Some(plan), _, _) => oplog.for_plan(&plan)?,
                (_, Some(repo), _) => oplog.for_repo(&repo)?,
                (_, _, Some(snapshot)) => oplog.for_snapshot(&snapshot)?,
                _ => oplog.all()?,
            };
            let recent = &ops[ops.len().saturating_sub(limit)..];

            if json {
                println!("{}", serde_json::to_string_pretty(recent)?);
            } else {
                println!(
                    "{:>8}  {:<15} {:<16} {:<16} {:<15} MESSAGE",
                    "ID", "KIND", "PLAN", "REPO", "STATUS"
                );
                for op in recent {
                    println!(
                        "{:>8}  {:<15} {:<16} {:<16} {:<15} {}",
                        op.id,
                        op.kind(),
                        op.plan_id,
                        op.repo_id,
                        op.status.to_string(),
                        op.display_message.as_deref().unwrap_or("")
                    );
                }
            }
        }

        Commands::Version => {
            println!("backrun v{}", env!("CARGO_PKG_VERSION"));
            println!("Backup orchestration for restic repositories");
        }
    }

    Ok(())
}
