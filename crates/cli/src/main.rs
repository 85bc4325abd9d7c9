mod commands;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shale_core::{init_logging, LoggingConfig, MigrateConfig, TargetMatch};
use shale_migrate::CancellationFlag;

use commands::migrate::{self, RunFlags};

#[derive(Parser)]
#[command(name = "shale")]
#[command(about = "Dependency-ordered schema migrations", version)]
struct Cli {
    /// Configuration file (defaults to shale.yaml, or SHALE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database connection URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Directory holding migration files
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Bookkeeping table name
    #[arg(long, global = true)]
    state_table: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Apply {
        /// Only apply this revision and what it depends on
        #[arg(long, value_name = "REVISION")]
        to: Option<String>,

        /// Print the plan without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back every applied migration
    RollbackAll {
        /// Print the plan without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back a revision and everything that depends on it
    RollbackTo {
        /// Revision to roll back
        revision: String,

        /// How the revision is matched against migration ids
        #[arg(long = "match", value_name = "MODE")]
        target_match: Option<TargetMatch>,

        /// Print the plan without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show applied and pending migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a new migration file
    Create {
        /// Migration name
        name: String,

        /// Make the new migration depend on the latest existing one
        #[arg(long)]
        depends_on_latest: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut logging = LoggingConfig::for_level(&config.log_level);
    if cli.json_logs {
        logging = logging.json();
    }
    if let Err(e) = init_logging(&logging) {
        eprintln!("Failed to initialize logging: {}", e);
    }
    for (field, value, source) in config.effective_values() {
        tracing::debug!(field, %value, %source, "Effective configuration");
    }

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Layer command-line overrides over file and environment configuration
fn load_config(cli: &Cli) -> Result<MigrateConfig> {
    let mut config = MigrateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(url) = &cli.database_url {
        config = config.with_database_url(url);
    }
    if let Some(dir) = &cli.migrations_dir {
        config = config.with_migrations_dir(dir);
    }
    if let Some(table) = &cli.state_table {
        config = config.with_state_table(table);
    }
    if let Some(level) = &cli.log_level {
        config = config.with_log_level(level);
    }
    if let Commands::RollbackTo {
        target_match: Some(mode),
        ..
    } = &cli.command
    {
        config = config.with_target_match(*mode);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(command: Commands, config: MigrateConfig) -> Result<()> {
    let flags = |dry_run| RunFlags {
        dry_run,
        cancellation: interrupt_flag(),
    };

    match command {
        Commands::Apply { to, dry_run } => migrate::apply(&config, to.as_deref(), flags(dry_run)).await,
        Commands::RollbackAll { dry_run } => migrate::rollback_all(&config, flags(dry_run)).await,
        Commands::RollbackTo { revision, dry_run, .. } => {
            migrate::rollback_to(&config, &revision, flags(dry_run)).await
        }
        Commands::Status { json } => migrate::status(&config, json).await,
        Commands::Create {
            name,
            depends_on_latest,
        } => migrate::create(&config, &name, depends_on_latest),
    }
}

/// Flag set by Ctrl-C; the runner stops before the next migration
fn interrupt_flag() -> CancellationFlag {
    let flag = CancellationFlag::new();
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current migration");
            handle.cancel();
        }
    });
    flag
}
