//! Transaction status and streaming statistics collection
//!
//! This module provides the two data types every other part of the engine
//! feeds or consumes:
//!
//! - [`TxStatus`]: the outcome record of a single submitted transaction
//! - [`TxStatsCollector`]: a streaming aggregate of many `TxStatus` records
//!   scoped to one (worker, round) pair, with support for nested
//!   sub-collectors and a pure merge over snapshots
//!
//! Collectors are intentionally cheap: counters, timestamp extrema, and
//! per-outcome latency extrema/sums. Full latency distributions travel
//! beside the collector as a compact [`LatencyDigest`].

use std::sync::Arc;

use anyhow::Result;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::utils;

/// Sentinel identity used by [`TxStatsCollector::merge`] when the merged
/// inputs do not share a worker or round index.
pub const MIXED_IDENTITY: i64 = -1;

/// Final disposition of a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxOutcome {
    /// Submitted but not yet resolved
    Created,
    /// Resolved successfully
    Success,
    /// Resolved with an error
    Failed,
}

/// Outcome record for one unit of submitted load.
///
/// A status is created when a workload issues a request, resolved exactly
/// once via [`TxStatus::success`] or [`TxStatus::fail`], and treated as
/// immutable afterward. Timestamps are Unix epoch milliseconds; the final
/// time stays 0 until the transaction resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxStatus {
    id: String,
    time_create: u64,
    time_final: u64,
    outcome: TxOutcome,
    verified: bool,
    error_messages: Vec<String>,
    custom: Vec<(String, serde_json::Value)>,
}

impl TxStatus {
    /// Create a new status stamped with the current time.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            time_create: utils::current_timestamp_ms(),
            time_final: 0,
            outcome: TxOutcome::Created,
            verified: false,
            error_messages: Vec::new(),
            custom: Vec::new(),
        }
    }

    /// Create a status with an explicit creation time (epoch ms).
    pub fn new_at(id: impl Into<String>, time_create: u64) -> Self {
        let mut status = Self::new(id);
        status.time_create = time_create;
        status
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn time_create(&self) -> u64 {
        self.time_create
    }

    pub fn time_final(&self) -> u64 {
        self.time_final
    }

    pub fn outcome(&self) -> TxOutcome {
        self.outcome
    }

    /// Whether the transaction resolved successfully.
    pub fn is_committed(&self) -> bool {
        self.outcome == TxOutcome::Success
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }

    /// Mark the transaction successful, stamping the final time with now.
    pub fn success(&mut self) {
        self.success_at(utils::current_timestamp_ms());
    }

    /// Mark the transaction successful with an explicit final time.
    pub fn success_at(&mut self, time_final: u64) {
        self.outcome = TxOutcome::Success;
        self.time_final = time_final;
    }

    /// Mark the transaction failed, stamping the final time with now and
    /// recording the failure reason.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.outcome = TxOutcome::Failed;
        self.time_final = utils::current_timestamp_ms();
        self.error_messages.push(error.into());
    }

    pub fn error_messages(&self) -> &[String] {
        &self.error_messages
    }

    /// Milliseconds between creation and resolution, or `None` while the
    /// transaction is unresolved.
    pub fn latency_ms(&self) -> Option<u64> {
        if self.time_final == 0 {
            None
        } else {
            Some(self.time_final.saturating_sub(self.time_create))
        }
    }

    /// Attach an adapter-specific annotation. Entries keep insertion order
    /// and are not interpreted by the engine.
    pub fn set_custom(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        if let Some(entry) = self.custom.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.custom.push((key, value));
        }
    }

    pub fn get_custom(&self, key: &str) -> Option<&serde_json::Value> {
        self.custom
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

/// Running min/max/total latency aggregate for one outcome class.
///
/// `min` starts at `u64::MAX` and `max` at 0 so that merging untouched
/// aggregates is a no-op under min/max folding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LatencyAggregate {
    pub min_ms: u64,
    pub max_ms: u64,
    pub total_ms: u64,
}

impl Default for LatencyAggregate {
    fn default() -> Self {
        Self {
            min_ms: u64::MAX,
            max_ms: 0,
            total_ms: 0,
        }
    }
}

impl LatencyAggregate {
    fn record(&mut self, latency_ms: u64) {
        self.min_ms = self.min_ms.min(latency_ms);
        self.max_ms = self.max_ms.max(latency_ms);
        self.total_ms += latency_ms;
    }

    fn fold(&mut self, other: &LatencyAggregate) {
        self.min_ms = self.min_ms.min(other.min_ms);
        self.max_ms = self.max_ms.max(other.max_ms);
        self.total_ms += other.total_ms;
    }
}

/// Streaming statistics for one (worker, round) pair.
///
/// The collector only counts while active: [`TxStatsCollector::activate`]
/// stamps the round start and opens the gate, and finished transactions
/// created before that stamp are discarded so late results from a previous
/// round cannot leak into this one. Events fan out to registered
/// sub-collectors, each of which applies its own activation gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxStatsCollector {
    worker_index: i64,
    round_index: i64,
    round_label: String,
    active: bool,
    round_start_time: u64,
    round_finish_time: u64,
    total_submitted: u64,
    total_finished: u64,
    total_successful: u64,
    total_failed: u64,
    first_create_time: u64,
    last_create_time: u64,
    first_finish_time: u64,
    last_finish_time: u64,
    successful_latency: LatencyAggregate,
    failed_latency: LatencyAggregate,
    #[serde(skip)]
    sub_collectors: Vec<SharedTxStats>,
}

impl TxStatsCollector {
    /// Create an inactive collector for the given identity.
    pub fn new(worker_index: i64, round_index: i64, round_label: impl Into<String>) -> Self {
        Self {
            worker_index,
            round_index,
            round_label: round_label.into(),
            active: false,
            round_start_time: 0,
            round_finish_time: 0,
            total_submitted: 0,
            total_finished: 0,
            total_successful: 0,
            total_failed: 0,
            first_create_time: u64::MAX,
            last_create_time: 0,
            first_finish_time: u64::MAX,
            last_finish_time: 0,
            successful_latency: LatencyAggregate::default(),
            failed_latency: LatencyAggregate::default(),
            sub_collectors: Vec::new(),
        }
    }

    pub fn worker_index(&self) -> i64 {
        self.worker_index
    }

    pub fn round_index(&self) -> i64 {
        self.round_index
    }

    pub fn round_label(&self) -> &str {
        &self.round_label
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Epoch ms of activation, 0 while never activated.
    pub fn round_start_time(&self) -> u64 {
        self.round_start_time
    }

    /// Epoch ms of deactivation, 0 while never deactivated.
    pub fn round_finish_time(&self) -> u64 {
        self.round_finish_time
    }

    pub fn total_submitted(&self) -> u64 {
        self.total_submitted
    }

    pub fn total_finished(&self) -> u64 {
        self.total_finished
    }

    pub fn total_successful(&self) -> u64 {
        self.total_successful
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed
    }

    pub fn first_create_time(&self) -> u64 {
        self.first_create_time
    }

    pub fn last_create_time(&self) -> u64 {
        self.last_create_time
    }

    pub fn first_finish_time(&self) -> u64 {
        self.first_finish_time
    }

    pub fn last_finish_time(&self) -> u64 {
        self.last_finish_time
    }

    pub fn successful_latency(&self) -> &LatencyAggregate {
        &self.successful_latency
    }

    pub fn failed_latency(&self) -> &LatencyAggregate {
        &self.failed_latency
    }

    /// Mean successful latency in milliseconds, 0.0 before the first
    /// successful transaction.
    pub fn avg_successful_latency_ms(&self) -> f64 {
        if self.total_successful == 0 {
            0.0
        } else {
            self.successful_latency.total_ms as f64 / self.total_successful as f64
        }
    }

    /// Register a nested collector that receives every event this collector
    /// accepts. Sub-collectors apply their own activation gating and are
    /// not activated by the parent.
    pub fn add_sub_collector(&mut self, sub: SharedTxStats) {
        self.sub_collectors.push(sub);
    }

    /// Stamp the round start and begin counting.
    pub fn activate(&mut self) {
        self.round_start_time = utils::current_timestamp_ms();
        self.active = true;
    }

    /// Stamp the round finish and stop counting.
    pub fn deactivate(&mut self) {
        self.round_finish_time = utils::current_timestamp_ms();
        self.active = false;
    }

    /// Record `count` newly submitted transactions. Ignored while inactive.
    pub fn tx_submitted(&mut self, count: u64) {
        if !self.active {
            return;
        }

        self.total_submitted += count;
        for sub in &self.sub_collectors {
            sub.tx_submitted(count);
        }
    }

    /// Record a batch of resolved transactions. Ignored while inactive.
    /// Results created before the round start are discarded; a result
    /// created exactly at the round start is counted.
    pub fn tx_finished(&mut self, results: &[TxStatus]) {
        if !self.active {
            return;
        }

        let accepted: Vec<&TxStatus> = results
            .iter()
            .filter(|status| status.time_create >= self.round_start_time)
            .collect();
        if accepted.is_empty() {
            return;
        }

        for status in &accepted {
            self.record_finished(status);
        }

        if !self.sub_collectors.is_empty() {
            let forwarded: Vec<TxStatus> = accepted.into_iter().cloned().collect();
            for sub in &self.sub_collectors {
                sub.tx_finished(&forwarded);
            }
        }
    }

    fn record_finished(&mut self, status: &TxStatus) {
        self.total_finished += 1;

        self.first_create_time = self.first_create_time.min(status.time_create);
        self.last_create_time = self.last_create_time.max(status.time_create);
        self.first_finish_time = self.first_finish_time.min(status.time_final);
        self.last_finish_time = self.last_finish_time.max(status.time_final);

        let latency = status.time_final.saturating_sub(status.time_create);
        if status.is_committed() {
            self.total_successful += 1;
            self.successful_latency.record(latency);
        } else {
            self.total_failed += 1;
            self.failed_latency.record(latency);
        }
    }

    /// Clone the aggregate state into a detached, inactive value with no
    /// sub-collectors. Snapshots are what cross process boundaries and what
    /// [`TxStatsCollector::merge`] consumes.
    pub fn snapshot(&self) -> TxStatsCollector {
        TxStatsCollector {
            worker_index: self.worker_index,
            round_index: self.round_index,
            round_label: self.round_label.clone(),
            active: false,
            round_start_time: self.round_start_time,
            round_finish_time: self.round_finish_time,
            total_submitted: self.total_submitted,
            total_finished: self.total_finished,
            total_successful: self.total_successful,
            total_failed: self.total_failed,
            first_create_time: self.first_create_time,
            last_create_time: self.last_create_time,
            first_finish_time: self.first_finish_time,
            last_finish_time: self.last_finish_time,
            successful_latency: self.successful_latency,
            failed_latency: self.failed_latency,
            sub_collectors: Vec::new(),
        }
    }

    /// Merge a set of snapshots into one inactive collector.
    ///
    /// Counters and latency totals are summed, timestamp extrema folded
    /// with min/max, and the round start/finish become the earliest start
    /// and latest finish across the inputs. A worker or round index shared
    /// by every input is kept; otherwise the merged field is set to
    /// [`MIXED_IDENTITY`]. Inputs are never mutated.
    pub fn merge(snapshots: &[TxStatsCollector]) -> TxStatsCollector {
        let Some(first) = snapshots.first() else {
            return TxStatsCollector::new(MIXED_IDENTITY, MIXED_IDENTITY, "");
        };

        let worker_index = if snapshots.iter().all(|s| s.worker_index == first.worker_index) {
            first.worker_index
        } else {
            MIXED_IDENTITY
        };
        let round_index = if snapshots.iter().all(|s| s.round_index == first.round_index) {
            first.round_index
        } else {
            MIXED_IDENTITY
        };
        let round_label = if snapshots.iter().all(|s| s.round_label == first.round_label) {
            first.round_label.clone()
        } else {
            String::new()
        };

        let mut merged = TxStatsCollector::new(worker_index, round_index, round_label);
        for snapshot in snapshots {
            merged.round_start_time = if merged.round_start_time == 0 {
                snapshot.round_start_time
            } else {
                merged.round_start_time.min(snapshot.round_start_time)
            };
            merged.round_finish_time = merged.round_finish_time.max(snapshot.round_finish_time);

            merged.total_submitted += snapshot.total_submitted;
            merged.total_finished += snapshot.total_finished;
            merged.total_successful += snapshot.total_successful;
            merged.total_failed += snapshot.total_failed;

            merged.first_create_time = merged.first_create_time.min(snapshot.first_create_time);
            merged.last_create_time = merged.last_create_time.max(snapshot.last_create_time);
            merged.first_finish_time = merged.first_finish_time.min(snapshot.first_finish_time);
            merged.last_finish_time = merged.last_finish_time.max(snapshot.last_finish_time);

            merged.successful_latency.fold(&snapshot.successful_latency);
            merged.failed_latency.fold(&snapshot.failed_latency);
        }

        merged
    }
}

/// Cloneable, thread-safe handle to a [`TxStatsCollector`].
///
/// This is the form in which the active round's collector is handed to
/// connector contexts, observers, and rate controllers. Lock scope is
/// confined to single updates; nested locking only ever runs parent to
/// child during sub-collector fan-out.
#[derive(Debug, Clone)]
pub struct SharedTxStats {
    inner: Arc<Mutex<TxStatsCollector>>,
}

impl SharedTxStats {
    pub fn new(collector: TxStatsCollector) -> Self {
        Self {
            inner: Arc::new(Mutex::new(collector)),
        }
    }

    pub fn activate(&self) {
        self.inner.lock().activate();
    }

    pub fn deactivate(&self) {
        self.inner.lock().deactivate();
    }

    pub fn tx_submitted(&self, count: u64) {
        self.inner.lock().tx_submitted(count);
    }

    pub fn tx_finished(&self, results: &[TxStatus]) {
        self.inner.lock().tx_finished(results);
    }

    pub fn add_sub_collector(&self, sub: SharedTxStats) {
        self.inner.lock().add_sub_collector(sub);
    }

    /// Detached copy of the current aggregate state.
    pub fn snapshot(&self) -> TxStatsCollector {
        self.inner.lock().snapshot()
    }

    pub fn total_submitted(&self) -> u64 {
        self.inner.lock().total_submitted()
    }

    pub fn total_finished(&self) -> u64 {
        self.inner.lock().total_finished()
    }

    pub fn total_successful(&self) -> u64 {
        self.inner.lock().total_successful()
    }

    pub fn total_failed(&self) -> u64 {
        self.inner.lock().total_failed()
    }

    pub fn avg_successful_latency_ms(&self) -> f64 {
        self.inner.lock().avg_successful_latency_ms()
    }

    pub fn round_start_time(&self) -> u64 {
        self.inner.lock().round_start_time()
    }
}

/// Significant figures kept by latency histograms.
pub const DIGEST_SIGFIGS: u8 = 3;

/// Compact, serializable latency distribution for one (worker, round).
///
/// The wire form is the list of distinct `(latency_ms, count)` pairs a
/// histogram recorded. Digests from different processes merge by simple
/// concatenation; percentile queries rebuild a queryable histogram from
/// the pairs, which reproduces the source distribution exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyDigest {
    pub total_samples: u64,
    pub histogram_data: Vec<(u64, u64)>,
}

impl LatencyDigest {
    /// Compact a recorded histogram into its wire form.
    pub fn from_histogram(histogram: &Histogram<u64>) -> Self {
        let mut histogram_data = Vec::new();
        for value in histogram.iter_recorded() {
            histogram_data.push((value.value_iterated_to(), value.count_at_value()));
        }
        Self {
            total_samples: histogram.len(),
            histogram_data,
        }
    }

    /// Combine digests from many workers into one.
    pub fn merge(digests: &[LatencyDigest]) -> LatencyDigest {
        let mut merged = LatencyDigest::default();
        for digest in digests {
            merged.total_samples += digest.total_samples;
            merged
                .histogram_data
                .extend_from_slice(&digest.histogram_data);
        }
        merged
    }

    /// Rebuild a queryable histogram from the recorded pairs.
    pub fn to_histogram(&self) -> Result<Histogram<u64>> {
        let mut histogram = Histogram::new(DIGEST_SIGFIGS)?;
        for &(value, count) in &self.histogram_data {
            histogram.record_n(value, count)?;
        }
        Ok(histogram)
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples == 0
    }
}
