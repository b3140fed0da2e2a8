//! # Benchmark Configuration and Run Driver
//!
//! This module owns the benchmark definition and the manager-side driver
//! that takes a worker pool through it. The definition is loaded from a
//! JSON file shared by the manager and every worker, so both sides agree
//! on the SUT connector and the round list without further negotiation.
//!
//! ## Key Components
//!
//! - **BenchmarkConfig**: The validated run definition
//! - **RoundConfig**: One configured round, before per-worker tailoring
//! - **BenchmarkRunner**: Drives registration, SUT setup, every round, and
//!   the final report
//!
//! ## Run Lifecycle
//!
//! 1. **Mobilization**: Wait for the expected workers and hand out indices
//! 2. **SUT Setup**: Install contracts and initialize every connector
//! 3. **Rounds**: Prepare, execute, and report each configured round
//! 4. **Teardown**: Release the pool and write the consolidated report

use crate::connector::{build_connector, SutConnector};
use crate::messaging::{Messenger, MessengerConfig};
use crate::orchestrator::RoundOrchestrator;
use crate::protocol::{RateSpec, RoundSpec, TrimSpec, WorkloadSpec};
use crate::results::{ReportManager, RoundReport};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Complete benchmark definition, usually loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Name of the benchmark, carried into the report.
    pub name: String,

    /// Free-form description carried into the report.
    #[serde(default)]
    pub description: String,

    /// Number of workers the manager waits for before starting.
    #[serde(default = "default_workers")]
    pub workers: u64,

    /// Transport carrying the coordination protocol.
    #[serde(default)]
    pub messenger: MessengerConfig,

    /// Milliseconds between progress updates sent by each worker.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// Upper bound on concurrently in-flight transactions per worker.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// SUT connector shared by the manager and the workers.
    #[serde(default)]
    pub sut: SutConfig,

    /// Rounds to run, in order.
    pub rounds: Vec<RoundConfig>,
}

fn default_workers() -> u64 {
    crate::defaults::WORKERS
}

fn default_update_interval_ms() -> u64 {
    crate::defaults::TX_UPDATE_INTERVAL_MS
}

fn default_max_in_flight() -> usize {
    crate::defaults::MAX_IN_FLIGHT
}

/// SUT connector selection: a registry key plus connector options passed
/// through uninterpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SutConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: Value,
}

impl Default for SutConfig {
    fn default() -> Self {
        Self {
            kind: "sim".to_string(),
            options: Value::Null,
        }
    }
}

/// One round as written in the configuration file. Exactly one of
/// `tx_number` / `tx_duration_ms` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundConfig {
    pub label: String,

    /// Pool-wide transaction count bound.
    #[serde(default)]
    pub tx_number: Option<u64>,

    /// Duration bound in milliseconds.
    #[serde(default)]
    pub tx_duration_ms: Option<u64>,

    pub rate: RateSpec,

    /// Warm-up exclusion applied to the reported statistics.
    #[serde(default)]
    pub trim: Option<TrimSpec>,

    pub workload: WorkloadSpec,

    /// Override for the execution timeout, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl BenchmarkConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read the benchmark config at {:?}", path))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse the benchmark config at {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("The benchmark needs a name");
        }
        if self.workers == 0 {
            bail!("At least one worker is required");
        }
        if self.rounds.is_empty() {
            bail!("At least one round is required");
        }
        for (index, round) in self.rounds.iter().enumerate() {
            match (round.tx_number, round.tx_duration_ms) {
                (Some(_), Some(_)) => bail!(
                    "Round {} ({}) sets both a transaction count and a duration",
                    index,
                    round.label
                ),
                (None, None) => bail!(
                    "Round {} ({}) sets neither a transaction count nor a duration",
                    index,
                    round.label
                ),
                (Some(0), _) => bail!("Round {} ({}) has a zero transaction count", index, round.label),
                (_, Some(0)) => bail!("Round {} ({}) has a zero duration", index, round.label),
                _ => {}
            }
        }
        Ok(())
    }

    /// Expand a configured round into the pool-wide specification the
    /// orchestrator tailors per worker.
    fn round_spec(&self, index: usize, round: &RoundConfig) -> RoundSpec {
        RoundSpec {
            label: round.label.clone(),
            round_index: index as u64,
            tx_number: round.tx_number,
            tx_duration_ms: round.tx_duration_ms,
            rate: round.rate.clone(),
            trim: round.trim,
            workload: round.workload.clone(),
            total_workers: self.workers,
            worker_args: Value::Null,
        }
    }
}

/// Single source of truth for the start-of-run configuration banner.
pub struct ConfigDisplay<'a> {
    pub config: &'a BenchmarkConfig,
}

impl<'a> fmt::Display for ConfigDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting benchmark: {}", self.config.name)?;
        if !self.config.description.is_empty() {
            writeln!(f, "  Description:        {}", self.config.description)?;
        }
        writeln!(f, "  Workers:            {}", self.config.workers)?;
        writeln!(f, "  Messenger:          {}", self.config.messenger.kind)?;
        writeln!(f, "  SUT Connector:      {}", self.config.sut.kind)?;
        writeln!(f, "  Max In-Flight:      {}", self.config.max_in_flight)?;
        writeln!(f, "  Rounds:             {}", self.config.rounds.len())?;
        for (index, round) in self.config.rounds.iter().enumerate() {
            let bound = match (round.tx_number, round.tx_duration_ms) {
                (Some(count), _) => format!("{} txs", count),
                (_, Some(ms)) => format!("{} ms", ms),
                _ => "unbounded".to_string(),
            };
            writeln!(
                f,
                "    {}: '{}' ({}, rate '{}', workload '{}')",
                index, round.label, bound, round.rate.kind, round.workload.module
            )?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Drives a full benchmark run from the manager side.
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    orchestrator: RoundOrchestrator,
    reports: ReportManager,
    startup_timeout: Duration,
    continue_on_error: bool,
}

impl BenchmarkRunner {
    // Phase timing defaults
    const STARTUP_TIMEOUT_MS: u64 = 60_000;
    const ROUND_TIMEOUT_MS: u64 = 600_000;
    const ROUND_GRACE_MS: u64 = 30_000;

    /// Create a runner on an already-connected messenger.
    pub fn new(
        config: BenchmarkConfig,
        messenger: Arc<dyn Messenger>,
        output_file: &Path,
    ) -> Result<Self> {
        config.validate()?;
        let orchestrator = RoundOrchestrator::new(messenger, config.workers)?;
        let reports = ReportManager::new(
            config.name.clone(),
            config.description.clone(),
            output_file,
        );
        Ok(Self {
            config,
            orchestrator,
            reports,
            startup_timeout: Duration::from_millis(Self::STARTUP_TIMEOUT_MS),
            continue_on_error: false,
        })
    }

    /// Override the wait for workers to connect and stand up phases.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Keep running later rounds when one fails.
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Stream round reports to a file as they land.
    pub fn enable_streaming<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.reports.enable_streaming(path)
    }

    /// Reports recorded so far.
    pub fn reports(&self) -> &[RoundReport] {
        self.reports.rounds()
    }

    /// Run the whole benchmark and write the consolidated report.
    ///
    /// Workers are released even when a round fails; the report is only
    /// written for runs that reach the end.
    pub async fn run(&mut self) -> Result<()> {
        info!("{}", ConfigDisplay {
            config: &self.config
        });

        let startup = self.startup_timeout;
        self.orchestrator.mobilize(startup).await?;
        self.orchestrator.assign_identities(startup).await?;

        // The manager keeps its own connector for installation and for
        // preparing per-worker arguments.
        let connector = build_connector(&self.config.sut.kind, -1, &self.config.sut.options)?;
        connector.init(false).await?;
        connector.install_contracts().await?;

        self.orchestrator.initialize_sut(startup).await?;

        let run_result = self.run_rounds(&connector).await;

        if let Err(error) = self.orchestrator.shutdown().await {
            warn!("Shutdown after the run reported: {}", error);
        }
        run_result?;

        self.reports.finalize()
    }

    async fn run_rounds(&mut self, connector: &Arc<dyn SutConnector>) -> Result<()> {
        let startup = self.startup_timeout;
        let rounds = self.config.rounds.clone();

        for (index, round) in rounds.iter().enumerate() {
            let spec = self.config.round_spec(index, round);
            let worker_args = connector.prepare_worker_arguments(self.config.workers).await?;

            let outcome = self
                .run_one_round(&spec, &worker_args, self.round_timeout(round), startup)
                .await;
            match outcome {
                Ok(report) => {
                    info!("{}", report);
                    self.reports.add_round(report)?;
                }
                Err(error) if self.continue_on_error => {
                    warn!("Round {} ({}) failed: {}", index, round.label, error);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn run_one_round(
        &mut self,
        spec: &RoundSpec,
        worker_args: &[Value],
        timeout: Duration,
        startup: Duration,
    ) -> Result<RoundReport> {
        self.orchestrator
            .prepare_round(spec, worker_args, startup)
            .await?;
        let result = self
            .orchestrator
            .execute_round(spec, worker_args, timeout)
            .await?;
        RoundReport::new(&result.stats, result.latencies)
    }

    /// Execution timeout for a round: the configured override, or the
    /// duration bound plus a grace window, or the count-round default.
    fn round_timeout(&self, round: &RoundConfig) -> Duration {
        let ms = round.timeout_ms.unwrap_or(match round.tx_duration_ms {
            Some(duration) => duration + Self::ROUND_GRACE_MS,
            None => Self::ROUND_TIMEOUT_MS,
        });
        Duration::from_millis(ms)
    }
}
