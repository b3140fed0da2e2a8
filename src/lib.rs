//! # Stampede Load Generation Engine
//!
//! A distributed benchmarking engine in Rust. One manager process drives a
//! pool of worker processes through a series of load-generation rounds
//! against a pluggable system under test, collects streaming transaction
//! statistics from every worker, and writes a consolidated report.
//!
//! ## Architecture Overview
//!
//! The engine is organized into the following modules:
//!
//! - `benchmark`: Run configuration and the manager-side driver
//! - `orchestrator`: The phase state machine coordinating the worker pool
//! - `worker`: The worker-side message pump and round execution engine
//! - `messaging`: Envelope transports (in-process channels and TCP)
//! - `protocol`: Message bodies and round specifications on the wire
//! - `connector`: The SUT connector seam and the built-in simulator
//! - `workload`: Pluggable transaction generators
//! - `rate`: Rate controllers shaping each round's submission schedule
//! - `stats`: Streaming transaction statistics and latency digests
//! - `observer`: Periodic progress reporting from workers to the manager
//! - `results`: Report assembly and JSON output
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use stampede::benchmark::{BenchmarkConfig, BenchmarkRunner};
//! use stampede::messaging::{ChannelHub, Messenger};
//! use stampede::worker::BenchmarkWorker;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig::load(Path::new("benchmark.json"))?;
//!
//!     // Single-process run: manager and workers share a channel hub.
//!     let hub = ChannelHub::new();
//!     for index in 0..config.workers {
//!         let endpoint: Arc<dyn Messenger> = Arc::new(hub.endpoint(format!("worker-{}", index)));
//!         let mut worker = BenchmarkWorker::new(
//!             endpoint,
//!             config.sut.kind.clone(),
//!             config.sut.options.clone(),
//!         );
//!         tokio::spawn(async move { worker.run().await });
//!     }
//!
//!     let manager: Arc<dyn Messenger> = Arc::new(hub.endpoint("manager"));
//!     let mut runner = BenchmarkRunner::new(config, manager, Path::new("report.json"))?;
//!     runner.run().await
//! }
//! ```
//!
//! ## Measurement Characteristics
//!
//! - **Bounded in-flight load** per worker, so a slow SUT throttles
//!   submission instead of exhausting memory
//! - **HDR histograms** carried as compact digests, so percentiles survive
//!   aggregation across workers without shipping raw samples
//! - **Warm-up trimming** by count or duration before results are recorded
//! - **Async I/O** throughout using Tokio

/// Benchmark configuration and the manager-side run driver
///
/// Contains the `BenchmarkConfig` definition shared by the manager and
/// every worker, and the `BenchmarkRunner` that takes a pool through
/// mobilization, SUT setup, each configured round, and the final report.
pub mod benchmark;

/// Command-line interface
///
/// Argument parsing using clap, including the mode selection
/// (manager, worker, or single-process local run), transport overrides,
/// and duration parsing with human-readable formats (e.g. "10s", "5m").
pub mod cli;

/// SUT connector seam
///
/// The `SutConnector` trait adapters implement to plug a real system
/// under test into the engine, the statistics-feeding decorator wrapped
/// around it during rounds, and the built-in latency simulator.
pub mod connector;

pub mod logging;

/// Envelope transports
///
/// Moves protocol envelopes between the manager and its workers: an
/// in-process channel hub for single-process runs and tests, and
/// length-prefixed binary frames over TCP for distributed runs.
pub mod messaging;

/// Worker-to-manager progress streaming
pub mod observer;

/// Manager-side pool coordination
///
/// The `RoundOrchestrator` walks every worker through the phase ladder:
/// registration, identity assignment, SUT initialization, and the
/// prepare/execute pair of each round, merging per-worker results.
pub mod orchestrator;

/// Wire protocol: message bodies, envelopes, and round specifications
pub mod protocol;

/// Rate controllers
///
/// Pluggable controllers shaping each round's submission schedule, from
/// fixed and ramping rates through feedback-driven and replayed ones.
pub mod rate;

/// Report assembly and output
pub mod results;

/// Streaming transaction statistics
///
/// Status records for individual transactions, the per-round collector
/// merged across workers, and the compact latency digest that carries
/// full distributions between processes.
pub mod stats;

pub mod utils;

/// Worker-side engine
///
/// The `BenchmarkWorker` message pump and the bounded in-flight loop
/// that drives workloads against the SUT under rate control.
pub mod worker;

/// Pluggable transaction generators
pub mod workload;

// Re-export key types for convenient library usage

/// Run definition and driver
pub use benchmark::{BenchmarkConfig, BenchmarkRunner};

/// The connector seam adapters implement for a real SUT
pub use connector::{build_connector, SutConnector};

/// Transport abstraction shared by all messengers
pub use messaging::{Messenger, MessengerConfig};

/// Coordination endpoints of the protocol
pub use orchestrator::RoundOrchestrator;
pub use worker::BenchmarkWorker;

/// Per-round statistics as they appear in reports and on the wire
pub use stats::{LatencyDigest, TxStatsCollector, TxStatus};

/// The current version of the engine
///
/// Populated from Cargo.toml and recorded in every report for
/// reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default number of workers a manager waits for.
    pub const WORKERS: u64 = 1;

    /// Upper bound on concurrently in-flight transactions per worker.
    ///
    /// Large enough to keep a high-latency SUT busy at moderate rates
    /// while still bounding worker memory. Overridden per benchmark with
    /// the `max_in_flight` configuration field.
    pub const MAX_IN_FLIGHT: usize = 100;

    /// Milliseconds between progress updates from each worker.
    pub const TX_UPDATE_INTERVAL_MS: u64 = 5_000;

    /// Default endpoint for the tcp messenger.
    pub const ENDPOINT: &str = "127.0.0.1:9360";

    /// Default output file name for the consolidated report.
    pub const OUTPUT_FILE: &str = "benchmark_report.json";
}
