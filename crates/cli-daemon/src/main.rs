//! CLI entry point for the timelapse daemon
//!
//! Parses command line arguments, starts the requested captures and serves
//! status until interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use timelapse_daemon::{configured_photo_service, Config, Coordinator, SourceSet, StartRequest};
use tracing_subscriber::EnvFilter;

/// Timelapse Daemon - interval frame capture assembled into videos
#[derive(Parser, Debug)]
#[command(name = "timelapse-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (encoding tool, output root). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Source to start capturing immediately; may be repeated
    #[arg(long = "start", value_name = "SOURCE")]
    start: Vec<String>,

    /// Capture interval in seconds for sources given with --start
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Capture duration in minutes for sources given with --start
    #[arg(long, value_name = "MINS")]
    duration: Option<u64>,
}

fn init_tracing(config: &Config) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match config.logging.filter.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: logging filter '{}' is not valid ({}); falling back to 'info'",
                    config.logging.filter, e
                );
                EnvFilter::new("info")
            }
        },
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "Timelapse daemon starting"
    );

    let coordinator = if args.skip_checks {
        tracing::warn!("Skipping startup checks (--skip-checks enabled)");
        let sources = SourceSet::from_config(&config, PathBuf::from(&config.encoder.tool));
        let photo_service = configured_photo_service(&config);
        Coordinator::new_without_checks(config, sources, photo_service)
    } else {
        match Coordinator::with_config(config) {
            Ok(coordinator) => coordinator,
            Err(e) => {
                tracing::error!(error = %e, "Failed to initialize daemon");
                return ExitCode::FAILURE;
            }
        }
    };

    for source in &args.start {
        let mut request = StartRequest::new(source.as_str());
        if let Some(secs) = args.interval {
            request = request.with_interval(Duration::from_secs(secs));
        }
        if let Some(mins) = args.duration {
            match mins.checked_mul(60) {
                Some(secs) => request = request.with_duration(Duration::from_secs(secs)),
                None => {
                    tracing::error!(source = %source, minutes = mins, "Capture duration out of range");
                    continue;
                }
            }
        }
        match coordinator.start(request).await {
            Ok(task_id) => tracing::info!(source = %source, task_id = %task_id, "Capture started"),
            Err(e) => tracing::error!(source = %source, error = %e, "Capture not started"),
        }
    }

    tracing::info!(bind = %coordinator.config.server.bind, "Serving status");
    if let Err(e) = coordinator.run_with_server().await {
        tracing::error!(error = %e, "Daemon error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
