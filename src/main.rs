use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ancientt::{cancel, pipeline, Config, Registry};

#[derive(Parser)]
#[command(author, version, about = "Automated network testing tool", long_about = None)]
struct Cli {
    /// Path to the test definition file
    #[arg(short = 'c', long, default_value = "testdefinition.yaml")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `ancientt=debug`
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let registry = Registry::with_defaults();

    // Ctrl-C translates into the cancellation token; consumers drain and
    // runner cleanup still runs.
    let (cancel_src, cancel_token) = cancel::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupt received, shutting down");
                cancel_src.cancel();
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for interrupts");
                std::mem::forget(cancel_src);
            }
        }
    });

    let report = match pipeline::run_config(&config, &registry, cancel_token).await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "run failed");
            return ExitCode::FAILURE;
        }
    };

    for test in &report.tests {
        test.log();
    }

    if report.failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
