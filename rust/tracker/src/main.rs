//! Distributed Boost Runtime Tracker
//!
//! Runs the rendezvous tracker for one training round as its own process.
//! The worker environment is printed to stdout as `KEY=VALUE` lines once the
//! tracker is listening; the process exits with the round's return code.
//!
//! # Usage
//!
//! ```bash
//! # Track a round of 4 workers on an ephemeral port
//! dbr-tracker --workers 4
//!
//! # Fixed address, give up after ten minutes
//! dbr-tracker --workers 8 --host 0.0.0.0 --port 9091 --wait-timeout 600000
//!
//! # Take tracker settings from a training config
//! dbr-tracker --config boost.toml
//! ```

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boost_runtime::config::TrainingConfig;
use boost_runtime::tracker::{SocketTracker, Tracker, CODE_SUCCESS};

/// Distributed Boost Runtime Tracker
#[derive(Parser, Debug)]
#[command(name = "dbr-tracker")]
#[command(about = "Rendezvous tracker for distributed boosting workers")]
struct Args {
    /// Number of workers in the round (defaults to training.num_workers)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Address to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Milliseconds to wait for the tracker to become ready (0 = unbounded)
    #[arg(long)]
    start_timeout: Option<u64>,

    /// Milliseconds to wait for all workers to finish (0 = unbounded)
    #[arg(long)]
    wait_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => TrainingConfig::from_file(path)?,
        None => TrainingConfig::default(),
    }
    .with_env_overrides();

    // Command-line flags win over the config file
    let mut tracker_config = config.tracker.clone();
    if let Some(host) = args.host {
        tracker_config.host = host;
    }
    if let Some(port) = args.port {
        tracker_config.port = port;
    }
    if let Some(ms) = args.start_timeout {
        tracker_config.start_timeout_ms = ms;
    }
    if let Some(ms) = args.wait_timeout {
        tracker_config.wait_timeout_ms = ms;
    }
    let workers = args.workers.unwrap_or(config.training.num_workers);

    tracing::info!("Starting DBR Tracker");
    tracing::info!("  Workers: {}", workers);
    tracing::info!("  Start timeout: {:?}", tracker_config.start_timeout());
    tracing::info!("  Wait timeout: {:?}", tracker_config.wait_timeout());

    let tracker = SocketTracker::new(&tracker_config, workers)?;
    if !tracker.start(tracker_config.start_timeout())? {
        return Err(format!(
            "tracker did not become ready within {:?}",
            tracker_config.start_timeout()
        )
        .into());
    }

    for (key, value) in tracker.worker_env() {
        println!("{key}={value}");
    }

    let code = tracker.wait_for(tracker_config.wait_timeout());
    tracker.stop();

    if code == CODE_SUCCESS {
        tracing::info!("Round finished");
        Ok(())
    } else {
        tracing::error!("Round failed with code {}", code);
        std::process::exit(code);
    }
}
