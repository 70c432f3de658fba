use anyhow::Result;
use clap::Parser;
use susi::cli::{configured_logging, run, Cli};
use susi_core::config::LoggingSettings;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let logging = configured_logging(cli.config_path()).unwrap_or_default();
    let _log_guard = match susi::logging::init(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Log file unavailable, logging to the console only: {e:#}");
            susi::logging::init(&LoggingSettings {
                file: None,
                ..logging
            })?
        }
    };
    tracing::info!("CLI application startup: tracing initialised, environment loaded");

    let result = run(cli).await;
    match &result {
        Ok(_) => tracing::info!("CLI completed successfully"),
        Err(e) => tracing::error!(error = %e, "CLI exited with error"),
    }
    result
}
