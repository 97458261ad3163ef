use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use frosty::logging::{self, LogConfig};
use frosty::{config, context, core::Orchestrator, core::group_by_schedule};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "frosty")]
#[command(version, about = "Scheduled backup job runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run backup jobs for one schedule key, or for all of them
    Backup(BackupArgs),
    /// Check that a config file is valid
    Validate { config: PathBuf },
    /// List schedule keys and their jobs
    Schedules { config: PathBuf },
}

#[derive(Args)]
struct BackupArgs {
    config: PathBuf,

    /// Only run jobs with this schedule key
    #[arg(long)]
    schedule: Option<String>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

/// Command-line values that take precedence over the config file.
#[derive(Args, Serialize)]
struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    work_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    keep_failed_runs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(LogConfig {
        json: cli.json_logs,
        verbose: cli.verbose,
    });

    match &cli.command {
        Commands::Backup(args) => run_backup(args).await,
        Commands::Validate { config } => run_validate(config),
        Commands::Schedules { config } => run_schedules(config),
    }
}

async fn run_backup(args: &BackupArgs) -> Result<()> {
    let config = config::AppConfig::load(&args.config, Some(&args.overrides))?;
    let ctx = context::AppContext::new(config).context("Cannot set up the working directory")?;

    let reports = Orchestrator::new(ctx)
        .run(args.schedule.as_deref())
        .await
        .context("Backup run failed")?;

    let failed: usize = reports.iter().map(|r| r.failed_count()).sum();
    if failed > 0 {
        bail!("{} job(s) failed", failed);
    }
    Ok(())
}

fn run_validate(path: &Path) -> Result<()> {
    config::AppConfig::load(path, None::<&ConfigOverrides>)
        .with_context(|| format!("config file: {} - FAILED", path.display()))?;
    println!("config file: {} - OK", path.display());
    Ok(())
}

fn run_schedules(path: &Path) -> Result<()> {
    let config = config::AppConfig::load(path, None::<&ConfigOverrides>)?;
    for (key, jobs) in group_by_schedule(&config.jobs) {
        let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        println!("{}: {}", key, names.join(", "));
    }
    Ok(())
}
