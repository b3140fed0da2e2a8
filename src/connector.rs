//! SUT connector abstraction
//!
//! A connector adapts one system under test to the framework: it owns the
//! connection lifecycle, translates opaque request payloads into SUT
//! operations and reports each transaction's fate as a [`TxStatus`].
//! Workloads never talk to a SUT directly. They go through the connector
//! handed to them at initialization, which lets the worker interpose
//! statistics collection and warm-up trimming without the workload
//! noticing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::protocol::TrimSpec;
use crate::stats::{LatencyDigest, SharedTxStats, TxStatus, DIGEST_SIGFIGS};

/// Opaque request payload routed to the SUT.
pub type SutRequest = Value;

/// Adapter between the framework and one kind of system under test.
///
/// Methods take `&self` so a connector can be shared across the in-flight
/// transaction tasks of a round; implementations keep their mutable state
/// behind interior locks.
#[async_trait]
pub trait SutConnector: Send + Sync {
    /// Registry name of the connector.
    fn name(&self) -> &'static str;

    /// Index of the worker owning this connector, -1 on the manager.
    fn worker_index(&self) -> i64;

    /// Connect to the system under test.
    async fn init(&self, for_worker: bool) -> Result<()>;

    /// Deploy whatever the SUT needs before rounds can run. Called once,
    /// by the manager.
    async fn install_contracts(&self) -> Result<()>;

    /// Produce one argument blob per worker for the coming rounds.
    async fn prepare_worker_arguments(&self, total_workers: u64) -> Result<Vec<Value>>;

    /// Open the per-round context.
    async fn open_context(&self, round_index: u64, worker_args: &Value) -> Result<()>;

    /// Release the per-round context.
    async fn release_context(&self) -> Result<()>;

    /// Execute a batch of requests, returning one status per request.
    ///
    /// Transaction failures are reported inside the returned statuses; an
    /// `Err` means the connector itself broke.
    async fn send_requests(&self, requests: &[SutRequest]) -> Result<Vec<TxStatus>>;
}

/// Build a connector by registry key.
pub fn build_connector(kind: &str, worker_index: i64, options: &Value) -> Result<Arc<dyn SutConnector>> {
    match kind {
        "sim" => Ok(Arc::new(SimConnector::from_options(worker_index, options)?)),
        other => bail!("Unknown SUT connector type '{}'", other),
    }
}

/// Options for the built-in simulated SUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConnectorOptions {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub failure_rate: f64,
}

impl Default for SimConnectorOptions {
    fn default() -> Self {
        Self {
            min_latency_ms: SimConnector::DEFAULT_MIN_LATENCY_MS,
            max_latency_ms: SimConnector::DEFAULT_MAX_LATENCY_MS,
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug)]
struct SimContext {
    round_index: u64,
}

/// Connector that simulates a SUT with a configurable latency band and
/// failure rate. Exercises the full pipeline without any external system.
pub struct SimConnector {
    worker_index: i64,
    options: SimConnectorOptions,
    context: Mutex<Option<SimContext>>,
    sequence: AtomicU64,
}

impl SimConnector {
    pub const DEFAULT_MIN_LATENCY_MS: u64 = 2;
    pub const DEFAULT_MAX_LATENCY_MS: u64 = 10;

    fn from_options(worker_index: i64, options: &Value) -> Result<Self> {
        let options: SimConnectorOptions = if options.is_null() {
            SimConnectorOptions::default()
        } else {
            serde_json::from_value(options.clone())
                .map_err(|e| anyhow!("Invalid sim connector options: {}", e))?
        };
        if options.max_latency_ms < options.min_latency_ms {
            bail!("sim connector max_latency_ms must not be below min_latency_ms");
        }
        if !(0.0..=1.0).contains(&options.failure_rate) {
            bail!("sim connector failure_rate must be within [0, 1]");
        }
        Ok(Self {
            worker_index,
            options,
            context: Mutex::new(None),
            sequence: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl SutConnector for SimConnector {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn worker_index(&self) -> i64 {
        self.worker_index
    }

    async fn init(&self, for_worker: bool) -> Result<()> {
        info!(
            "Sim connector initialized for {} {}",
            if for_worker { "worker" } else { "manager" },
            self.worker_index
        );
        Ok(())
    }

    async fn install_contracts(&self) -> Result<()> {
        debug!("Sim connector has nothing to install");
        Ok(())
    }

    async fn prepare_worker_arguments(&self, total_workers: u64) -> Result<Vec<Value>> {
        Ok(vec![Value::Null; total_workers as usize])
    }

    async fn open_context(&self, round_index: u64, _worker_args: &Value) -> Result<()> {
        debug!("Opening sim context for round {}", round_index);
        *self.context.lock() = Some(SimContext { round_index });
        Ok(())
    }

    async fn release_context(&self) -> Result<()> {
        match self.context.lock().take() {
            Some(context) => debug!("Released sim context for round {}", context.round_index),
            None => debug!("No sim context to release"),
        }
        Ok(())
    }

    async fn send_requests(&self, requests: &[SutRequest]) -> Result<Vec<TxStatus>> {
        if self.context.lock().is_none() {
            bail!("sim connector has no open context");
        }

        let mut results = Vec::with_capacity(requests.len());
        for _request in requests {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let mut status = TxStatus::new(format!("sim-{}-{}", self.worker_index, seq));

            // The rng is not held across the await below.
            let (latency_ms, fail) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(self.options.min_latency_ms..=self.options.max_latency_ms),
                    rng.gen::<f64>() < self.options.failure_rate,
                )
            };
            if latency_ms > 0 {
                tokio::time::sleep(Duration::from_millis(latency_ms)).await;
            }

            if fail {
                status.fail("simulated failure");
            } else {
                status.success();
            }
            results.push(status);
        }
        Ok(results)
    }
}

enum TrimState {
    Disabled,
    Count { remaining: u64 },
    Duration { threshold_ms: u64 },
}

/// Decorator that feeds the round's statistics from every batch a
/// workload sends, applying the round's warm-up trim to finished results.
///
/// Submitted counts are never trimmed; only finished results inside the
/// warm-up window are withheld from the collector. Rate controllers read
/// the same collector, so they see the trimmed view too. The workload
/// always receives the untrimmed results.
///
/// Successful latencies of kept results also land in a histogram, whose
/// compacted form ships to the manager with the round result.
pub struct NotifyingConnector {
    inner: Arc<dyn SutConnector>,
    stats: SharedTxStats,
    trim: Mutex<TrimState>,
    latencies: Mutex<Histogram<u64>>,
}

impl NotifyingConnector {
    pub fn new(
        inner: Arc<dyn SutConnector>,
        stats: SharedTxStats,
        trim: Option<TrimSpec>,
    ) -> Result<Self> {
        let trim = match trim {
            None | Some(TrimSpec::Count(0)) | Some(TrimSpec::DurationMs(0)) => TrimState::Disabled,
            Some(TrimSpec::Count(n)) => TrimState::Count { remaining: n },
            Some(TrimSpec::DurationMs(t)) => TrimState::Duration { threshold_ms: t },
        };
        Ok(Self {
            inner,
            stats,
            trim: Mutex::new(trim),
            latencies: Mutex::new(Histogram::new(DIGEST_SIGFIGS)?),
        })
    }

    /// Compacted distribution of the successful latencies seen so far.
    pub fn latency_digest(&self) -> LatencyDigest {
        LatencyDigest::from_histogram(&self.latencies.lock())
    }

    /// Apply the warm-up countdown to one batch of finished results.
    ///
    /// A count trim slices the batch that crosses zero; a duration trim
    /// drops whole batches until the round has been running longer than
    /// the threshold.
    fn trim_batch<'a>(&self, results: &'a [TxStatus]) -> &'a [TxStatus] {
        let mut state = self.trim.lock();
        let mut exhausted = false;
        let kept = match &mut *state {
            TrimState::Disabled => results,
            TrimState::Count { remaining } => {
                let len = results.len() as u64;
                if *remaining >= len {
                    *remaining -= len;
                    &results[..0]
                } else {
                    let skip = *remaining as usize;
                    exhausted = true;
                    &results[skip..]
                }
            }
            TrimState::Duration { threshold_ms } => {
                let start = self.stats.round_start_time();
                let elapsed = crate::utils::current_timestamp_ms().saturating_sub(start);
                if elapsed <= *threshold_ms {
                    &results[..0]
                } else {
                    exhausted = true;
                    results
                }
            }
        };
        if exhausted {
            *state = TrimState::Disabled;
        }
        kept
    }
}

#[async_trait]
impl SutConnector for NotifyingConnector {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn worker_index(&self) -> i64 {
        self.inner.worker_index()
    }

    async fn init(&self, for_worker: bool) -> Result<()> {
        self.inner.init(for_worker).await
    }

    async fn install_contracts(&self) -> Result<()> {
        self.inner.install_contracts().await
    }

    async fn prepare_worker_arguments(&self, total_workers: u64) -> Result<Vec<Value>> {
        self.inner.prepare_worker_arguments(total_workers).await
    }

    async fn open_context(&self, round_index: u64, worker_args: &Value) -> Result<()> {
        self.inner.open_context(round_index, worker_args).await
    }

    async fn release_context(&self) -> Result<()> {
        self.inner.release_context().await
    }

    async fn send_requests(&self, requests: &[SutRequest]) -> Result<Vec<TxStatus>> {
        self.stats.tx_submitted(requests.len() as u64);
        let results = self.inner.send_requests(requests).await?;
        let kept = self.trim_batch(&results);
        if !kept.is_empty() {
            self.stats.tx_finished(kept);
            let mut latencies = self.latencies.lock();
            for status in kept {
                if status.is_committed() {
                    if let Some(latency_ms) = status.latency_ms() {
                        latencies.saturating_record(latency_ms);
                    }
                }
            }
        }
        Ok(results)
    }
}
