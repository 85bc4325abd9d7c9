use std::sync::Arc;

use anyhow::{Context, Result};
use shale_core::MigrateConfig;
use shale_migrate::{
    CancellationFlag, MigrateResult, MigrationManager, MigrationRecord, MigrationRunResult, MigrationRunner,
    Plan,
};

use crate::report;

/// Per-invocation options shared by the run commands
#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    pub dry_run: bool,
    pub cancellation: CancellationFlag,
}

pub async fn apply(config: &MigrateConfig, to: Option<&str>, flags: RunFlags) -> Result<()> {
    let records = load_records(config)?;
    let runner = connect(config, flags).await?;

    let outcome = match to {
        Some(revision) => runner.apply_to(revision, &records).await,
        None => runner.apply_pending(&records).await,
    };
    finish(outcome)
}

pub async fn rollback_all(config: &MigrateConfig, flags: RunFlags) -> Result<()> {
    let records = load_records(config)?;
    let runner = connect(config, flags).await?;
    finish(runner.rollback_all(&records).await)
}

pub async fn rollback_to(config: &MigrateConfig, revision: &str, flags: RunFlags) -> Result<()> {
    let records = load_records(config)?;
    let runner = connect(config, flags).await?;
    finish(runner.rollback_to(revision, &records).await)
}

pub async fn status(config: &MigrateConfig, json: bool) -> Result<()> {
    let records = load_records(config)?;
    let runner = connect(config, RunFlags::default()).await?;
    let entries = runner.status(&records).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report::status_json(&entries))?);
        return Ok(());
    }

    println!("Configuration:\n{}\n", report::configuration(config));
    println!("{}", report::status(&entries));

    let pending = entries.iter().filter(|(_, status)| !status.is_applied()).count();
    println!("\n{} applied, {} pending", entries.len() - pending, pending);
    Ok(())
}

pub fn create(config: &MigrateConfig, name: &str, depends_on_latest: bool) -> Result<()> {
    let path = MigrationManager::from_config(config).create_migration(name, depends_on_latest)?;
    println!("Created migration: {}", path.display());
    Ok(())
}

fn load_records(config: &MigrateConfig) -> Result<Vec<MigrationRecord>> {
    MigrationManager::from_config(config)
        .load_migrations()
        .with_context(|| format!("Failed to load migrations from {}", config.migrations_dir.display()))
}

async fn connect(config: &MigrateConfig, flags: RunFlags) -> Result<MigrationRunner> {
    let runner = MigrationRunner::from_config(config)
        .await
        .context("Failed to connect to the database")?;

    Ok(runner
        .with_dry_run(flags.dry_run)
        .with_cancellation(flags.cancellation)
        .with_plan_observer(Arc::new(|plan: &Plan| println!("{}", report::plan(plan)))))
}

fn finish(outcome: MigrateResult<MigrationRunResult>) -> Result<()> {
    match outcome {
        Ok(result) => {
            println!("{}", report::summary(&result));
            Ok(())
        }
        Err(e) => {
            if let Some(breakdown) = report::failure(&e) {
                eprintln!("{}", breakdown);
            }
            Err(e.into())
        }
    }
}
