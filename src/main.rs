//! # Stampede - Main Entry Point
//!
//! Entry point for the distributed load generation engine. One binary
//! serves all three roles:
//!
//! - **manager**: listens for workers over TCP, drives the configured
//!   rounds, and writes the consolidated report
//! - **worker**: connects to a manager over TCP and executes rounds under
//!   its direction
//! - **local**: runs the manager and the whole worker pool inside one
//!   process over an in-memory hub
//!
//! ## Startup Sequence
//!
//! 1. **Initialize logging**: colorized console output plus an optional
//!    log file, filtered via `RUST_LOG`
//! 2. **Parse arguments**: mode selection and configuration overrides
//! 3. **Load the benchmark config**: the same JSON file feeds manager and
//!    workers
//! 4. **Dispatch**: stand up the transport for the selected role and run
//!
//! ## Error Handling
//!
//! The application uses `anyhow::Result` throughout; any failure surfaces
//! with its context chain and a non-zero exit status.

use anyhow::Result;
use clap::Parser;
use stampede::{
    benchmark::{BenchmarkConfig, BenchmarkRunner},
    cli::{Args, Mode},
    logging,
    messaging::{ChannelHub, Messenger, MessengerConfig, MessengerFactory, MessengerRole},
    worker::BenchmarkWorker,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Keep the guard alive so the file layer flushes on exit.
    let _log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

    info!(
        "Stampede {} starting in {} mode",
        stampede::VERSION,
        args.mode
    );
    debug!("Arguments: {:?}", args);

    let mut config = BenchmarkConfig::load(&args.config)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    match args.mode {
        Mode::Manager => run_manager(config, &args).await,
        Mode::Worker => run_worker(config, &args).await,
        Mode::Local => run_local(config, &args).await,
    }
}

/// Drive a distributed run: listen for the pool, then run the benchmark.
async fn run_manager(config: BenchmarkConfig, args: &Args) -> Result<()> {
    let messenger = distributed_messenger(&config, args, MessengerRole::Manager).await?;
    let mut runner = build_runner(config, messenger, args)?;
    runner.run().await?;

    info!("Benchmark run complete");
    Ok(())
}

/// Join a distributed run and serve rounds until released.
async fn run_worker(config: BenchmarkConfig, args: &Args) -> Result<()> {
    let messenger = distributed_messenger(&config, args, MessengerRole::Worker).await?;
    let mut worker = BenchmarkWorker::new(messenger, config.sut.kind, config.sut.options)
        .with_max_in_flight(config.max_in_flight)
        .with_update_interval(Duration::from_millis(config.update_interval_ms));
    worker.run().await?;

    info!("Worker released");
    Ok(())
}

/// Run the manager and all workers inside this process over a channel hub.
async fn run_local(config: BenchmarkConfig, args: &Args) -> Result<()> {
    let hub = ChannelHub::new();

    let mut workers = Vec::new();
    for index in 0..config.workers {
        let endpoint: Arc<dyn Messenger> = Arc::new(hub.endpoint(format!("worker-{}", index)));
        let mut worker = BenchmarkWorker::new(
            endpoint,
            config.sut.kind.clone(),
            config.sut.options.clone(),
        )
        .with_max_in_flight(config.max_in_flight)
        .with_update_interval(Duration::from_millis(config.update_interval_ms));
        workers.push(tokio::spawn(async move { worker.run().await }));
    }

    let manager: Arc<dyn Messenger> = Arc::new(hub.endpoint("manager"));
    let mut runner = build_runner(config, manager, args)?;
    runner.run().await?;

    for worker in workers {
        if let Err(error) = worker.await? {
            warn!("A worker exited with an error: {}", error);
        }
    }

    info!("Benchmark run complete");
    Ok(())
}

/// Assemble the manager-side runner with the CLI overrides applied.
fn build_runner(
    config: BenchmarkConfig,
    messenger: Arc<dyn Messenger>,
    args: &Args,
) -> Result<BenchmarkRunner> {
    let mut runner = BenchmarkRunner::new(config, messenger, &args.output)?
        .with_startup_timeout(args.startup_timeout)
        .with_continue_on_error(args.continue_on_error);
    if let Some(ref path) = args.streaming_output {
        runner.enable_streaming(path)?;
    }
    Ok(runner)
}

/// Build the socket transport for a distributed role. The CLI endpoint
/// wins over the configured one; a config without a socket endpoint falls
/// back to the default.
async fn distributed_messenger(
    config: &BenchmarkConfig,
    args: &Args,
    role: MessengerRole,
) -> Result<Arc<dyn Messenger>> {
    let endpoint = args
        .endpoint
        .clone()
        .or_else(|| config.messenger.endpoint.clone())
        .unwrap_or_else(|| stampede::defaults::ENDPOINT.to_string());
    let messenger_config = MessengerConfig {
        kind: "tcp".to_string(),
        endpoint: Some(endpoint),
    };

    let messenger = MessengerFactory::create(&messenger_config, role, None).await?;
    Ok(Arc::from(messenger))
}
