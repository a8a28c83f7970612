use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

use mender::config::CONFIG_DIR;
use mender::logging::{self, LogOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "mender")]
#[command(version, about = "Self-healing repair orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one healing attempt for a file or a failure trace
    #[command(group(ArgGroup::new("target").required(true).args(["file", "trace"])))]
    Heal {
        /// Source file to heal
        #[arg(long)]
        file: Option<PathBuf>,

        /// File containing a failure trace
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Approve the merge as soon as the countdown starts
        #[arg(long)]
        approve: bool,

        /// Override healing.max_attempts
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Override risk.grace_secs
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// List recent runs, newest first
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one run
    Show {
        /// Run id or unique prefix
        run_id: String,

        /// Include the run's event log
        #[arg(long)]
        log: bool,
    },
    /// Revert the patch of an auto-merged run
    Rollback {
        /// Run id or unique prefix
        run_id: String,
    },
    /// Show past outcomes for bugs similar to a run's
    Similar {
        /// Run id or unique prefix
        run_id: String,

        #[arg(short, default_value = "5")]
        k: usize,
    },
    /// View, create or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default mender.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only commands that change the workspace keep a log file.
    let file_dir = matches!(
        cli.command,
        Commands::Heal { .. } | Commands::Rollback { .. }
    )
    .then(|| project_dir.join(CONFIG_DIR).join("logs"));
    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        file_dir,
    })?;

    match &cli.command {
        Commands::Heal {
            file,
            trace,
            approve,
            max_attempts,
            grace_secs,
        } => {
            let target = match (file, trace) {
                (Some(file), _) => cmd::HealTarget::File(file.clone()),
                (None, Some(trace)) => cmd::HealTarget::Trace(trace.clone()),
                (None, None) => anyhow::bail!("Either --file or --trace is required"),
            };
            cmd::cmd_heal(
                &project_dir,
                &cli,
                target,
                *approve,
                *max_attempts,
                *grace_secs,
            )
            .await?;
        }
        Commands::History { limit } => cmd::cmd_history(&project_dir, *limit).await?,
        Commands::Show { run_id, log } => cmd::cmd_show(&project_dir, run_id, *log).await?,
        Commands::Rollback { run_id } => cmd::cmd_rollback(&project_dir, run_id).await?,
        Commands::Similar { run_id, k } => cmd::cmd_similar(&project_dir, run_id, *k).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
