//! Command-line surface of susi.
//!
//! All pipeline behaviour lives in `susi-core`; this module parses arguments,
//! loads the configuration, builds the components and picks how often the
//! orchestrator runs.
//!
//! - `susi run --config susi.yaml` runs on the configured schedule until Ctrl-C.
//! - `susi run --config susi.yaml --once` runs a single cycle and exits.
//! - `susi validate --config susi.yaml` checks the file and prints a summary.
use crate::components::build_orchestrator;
use crate::load_config::{load_config, parse_config};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use susi_core::config::{LoggingSettings, ScheduleMode};
use susi_core::orchestrator::RunReport;

/// CLI for susi: post new OneDrive images to Instagram.
#[derive(Parser)]
#[clap(
    name = "susi",
    version,
    about = "Watch a OneDrive folder and publish new images as captioned Instagram posts"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent
    Run {
        /// Path to the YAML config file
        #[clap(long, env = "SUSI_CONFIG")]
        config: PathBuf,
        /// Run a single cycle and exit
        #[clap(long)]
        once: bool,
        /// Override the configured schedule: polling or weekly
        #[clap(long)]
        mode: Option<ScheduleMode>,
    },
    /// Load and validate the config file, then print a summary
    Validate {
        /// Path to the YAML config file
        #[clap(long, env = "SUSI_CONFIG")]
        config: PathBuf,
    },
}

impl Cli {
    pub fn config_path(&self) -> &Path {
        match &self.command {
            Commands::Run { config, .. } | Commands::Validate { config } => config,
        }
    }
}

/// Logging section of the config file, if it can be read at all. Used before
/// logging is set up, so failures are silent here and reported by `run`.
pub fn configured_logging(path: &Path) -> Option<LoggingSettings> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_config(&content).ok().map(|c| c.logging)
}

fn print_report(report: &RunReport) {
    println!(
        "run {}: listed {}, skipped {}, posted {}, failed {}{}",
        report.run_id,
        report.listed,
        report.skipped,
        report.posted.len(),
        report.failed.len(),
        if report.aborted {
            format!(", aborted with {} deferred", report.deferred)
        } else {
            String::new()
        }
    );
    for posted in &report.posted {
        let link = posted.post.url.as_deref().unwrap_or(posted.post.id.as_str());
        println!("  posted {} -> {}", posted.name, link);
    }
    for failed in &report.failed {
        println!("  failed {} at {}: {}", failed.name, failed.step, failed.error);
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl-C received, finishing current cycle"),
        Err(e) => {
            tracing::error!(error = %e, "Cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Validate { config } => {
            let config = load_config(config)?;
            println!("{}", config.summary());
            println!("Configuration is valid");
            Ok(())
        }
        Commands::Run { config, once, mode } => {
            let config = load_config(config)?;
            let mut orchestrator = build_orchestrator(&config)?;

            if once {
                tracing::info!(command = "run", "Running a single cycle");
                let report = orchestrator.run_once().await.map_err(|e| {
                    tracing::error!(command = "run", error = %e, "Cycle failed");
                    anyhow::Error::new(e).context("Run failed")
                })?;
                print_report(&report);
                return Ok(());
            }

            let trigger = config.schedule.trigger(mode)?;
            tracing::info!(command = "run", trigger = ?trigger, "Starting scheduled runs");
            orchestrator
                .run_scheduled(&trigger, shutdown_signal())
                .await;
            tracing::info!(command = "run", "exit");
            Ok(())
        }
    }
}
