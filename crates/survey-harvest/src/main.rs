//! # Survey Harvest CLI (`harvest`)
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest run` | Fetch every due cell, resuming a suspended run if one exists |
//! | `harvest run --dry-run` | List what would be fetched |
//! | `harvest status` | Show the suspended run and permanently failed items |
//! | `harvest missing` | List cells with no healthy file |
//! | `harvest continuity` | Compare expected against landed periods |
//! | `harvest verify` | Re-hash and re-check landed files |
//! | `harvest stats` | Summarize what has been landed |
//!
//! Exit codes: `0` success, `1` when a run ends with permanently failed
//! items, continuity finds gaps or verify finds problems, `2` on
//! configuration or runtime errors.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

use survey_harvest::config;
use survey_harvest::harvest::{self, RunOptions};
use survey_harvest::logging::init_logging;
use survey_harvest::progress::ProgressMode;
use survey_harvest::{continuity, missing, stats, verify};

/// Survey Harvest: fetch public surveillance tables on a schedule that
/// survives interruptions, rate limits and flaky upstreams.
#[derive(Parser)]
#[command(name = "harvest", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log format: `pretty`, `compact` or `json`.
    #[arg(long, global = true, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest every due cell.
    ///
    /// Resumes from the checkpoint when a previous run was suspended.
    /// Stops at the soft time budget, saving a checkpoint for the next
    /// invocation.
    Run {
        /// Show what would be fetched without fetching.
        #[arg(long)]
        dry_run: bool,

        /// Enumerate every cell, not just the missing ones.
        #[arg(long)]
        full: bool,

        /// Put permanently failed items back on the backlog.
        #[arg(long)]
        retry_failed: bool,

        /// Override the soft time budget, in seconds.
        #[arg(long)]
        budget_secs: Option<f64>,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show the suspended run, if any, and the failure ledger.
    Status,

    /// List cells that have no healthy file.
    Missing {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Compare expected periods against landed ones.
    Continuity {
        /// Check a single data type.
        #[arg(long)]
        data_type: Option<String>,

        #[arg(long)]
        start_year: Option<i32>,

        #[arg(long)]
        end_year: Option<i32>,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Re-hash landed files and re-run the structural checks.
    Verify {
        /// Flag broken records so the next run fetches them again.
        #[arg(long)]
        mark_corrupt: bool,
    },

    /// Summarize landed files.
    Stats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, &cli.log_format) {
        eprintln!("Error: {:#}", e);
        std::process::exit(2);
    }

    match dispatch(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let cfg = config::load_config(&cli.config)?;

    let code = match cli.command {
        Commands::Run {
            dry_run,
            full,
            retry_failed,
            budget_secs,
            progress,
        } => {
            let opts = RunOptions {
                dry_run,
                full,
                retry_failed,
                budget_secs,
                progress: progress.unwrap_or_else(ProgressMode::default_for_tty),
                today: harvest::local_today(),
            };
            harvest::run_harvest(&cfg, opts).await?.exit_code()
        }
        Commands::Status => {
            harvest::run_status(&cfg).await?;
            0
        }
        Commands::Missing { json } => {
            missing::run_missing(&cfg, json).await?;
            0
        }
        Commands::Continuity {
            data_type,
            start_year,
            end_year,
            json,
        } => {
            let complete =
                continuity::run_continuity(&cfg, data_type, start_year, end_year, json).await?;
            if complete {
                0
            } else {
                1
            }
        }
        Commands::Verify { mark_corrupt } => {
            if verify::run_verify(&cfg, mark_corrupt).await? {
                0
            } else {
                1
            }
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
            0
        }
    };
    Ok(code)
}
