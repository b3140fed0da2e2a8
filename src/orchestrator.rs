//! # Round Orchestration Module
//!
//! Manager-side coordination of the worker pool. The orchestrator walks
//! every worker through the connection ladder, then drives each round by
//! distributing tailored round definitions and merging the statistics the
//! workers send back.
//!
//! ```text
//! ┌──────────────┐  Register / AssignId / Initialize / Prepare / Test
//! │ Orchestrator │ ─────────────────────────────────────────────────►
//! │  (manager)   │ ◄─────────────────────────────────────────────────
//! └──────────────┘  Connected / Assigned / Ready / Prepared / TestResult
//! ```
//!
//! ## Key Components
//!
//! - **RoundOrchestrator**: owns the worker table and drives the phases
//! - **WorkerEntry**: one registered worker, keyed by transport address
//! - **WorkerPhases**: phase flags plus per-round completion slots
//!
//! All worker state lives in one table owned by the orchestrator task.
//! Incoming envelopes are pumped inline while a phase wait is in progress,
//! so no locking is involved and progress updates keep flowing even while
//! a round is executing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, info, warn};

use crate::messaging::Messenger;
use crate::protocol::{Envelope, MessageBody, ProgressDelta, RoundSpec, TrimSpec};
use crate::stats::{LatencyDigest, TxStatsCollector};

/// Phase flags and per-round completion slots for one worker.
///
/// The one-shot phases are plain booleans. Round phases are `Option`
/// slots so they can be cleared before every round; an `Err` slot records
/// the failure message the worker attached to its reply.
#[derive(Debug, Default)]
struct WorkerPhases {
    connected: bool,
    assigned: bool,
    ready: bool,
    prepared: Option<Result<(), String>>,
    test_result: Option<Result<WorkerRoundResult, String>>,
}

/// What one worker sent back for a round.
#[derive(Debug)]
struct WorkerRoundResult {
    stats: TxStatsCollector,
    latencies: LatencyDigest,
}

/// Merged outcome of one round across the whole pool.
#[derive(Debug, Clone)]
pub struct RoundResult {
    pub stats: TxStatsCollector,
    pub latencies: LatencyDigest,
}

/// One registered worker. The index equals its position in registration
/// order and never changes afterwards.
#[derive(Debug)]
struct WorkerEntry {
    address: String,
    worker_index: u64,
    phases: WorkerPhases,
}

/// Drives a pool of workers through registration, initialization and any
/// number of benchmark rounds.
pub struct RoundOrchestrator {
    messenger: Arc<dyn Messenger>,
    expected_workers: u64,
    workers: Vec<WorkerEntry>,
    round_progress: ProgressDelta,
    fault: Option<String>,
}

impl RoundOrchestrator {
    // Coordination timing constants
    const REGISTER_POLL_INTERVAL_MS: u64 = 200;
    const PHASE_POLL_INTERVAL_MS: u64 = 100;
    const PROGRESS_LOG_EVERY_TICKS: u64 = 50;
    const EXIT_FLUSH_DELAY_MS: u64 = 100;

    /// Create an orchestrator expecting a fixed number of workers.
    pub fn new(messenger: Arc<dyn Messenger>, expected_workers: u64) -> Result<Self> {
        if expected_workers == 0 {
            bail!("expected_workers must be greater than 0");
        }
        Ok(Self {
            messenger,
            expected_workers,
            workers: Vec::new(),
            round_progress: ProgressDelta::default(),
            fault: None,
        })
    }

    /// Number of workers that have announced themselves so far.
    pub fn connected_workers(&self) -> usize {
        self.workers.len()
    }

    /// Accumulated progress totals for the round in flight.
    pub fn progress(&self) -> ProgressDelta {
        self.round_progress
    }

    /// Poll for workers until the expected number has connected.
    ///
    /// Registration broadcasts repeat on an interval so workers that join
    /// late still catch one. Worker identities are fixed by registration
    /// order, which makes index assignment deterministic for a given
    /// connection sequence.
    pub async fn mobilize(&mut self, timeout: Duration) -> Result<()> {
        info!("Polling for {} workers", self.expected_workers);
        let messenger = Arc::clone(&self.messenger);
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(Duration::from_millis(Self::REGISTER_POLL_INTERVAL_MS));

        while (self.workers.len() as u64) < self.expected_workers {
            tokio::select! {
                maybe = messenger.recv() => match maybe {
                    Some(envelope) => self.dispatch(envelope),
                    None => bail!("Messaging channel closed while polling for workers"),
                },
                _ = ticker.tick() => {
                    if Instant::now() >= deadline {
                        bail!(
                            "Timed out waiting for workers: {} of {} connected",
                            self.workers.len(),
                            self.expected_workers
                        );
                    }
                    messenger
                        .send(Envelope::broadcast(messenger.address(), MessageBody::Register))
                        .await?;
                }
            }
        }

        info!("All {} workers connected", self.workers.len());
        Ok(())
    }

    /// Hand every worker its stable index, in registration order.
    pub async fn assign_identities(&mut self, timeout: Duration) -> Result<()> {
        let targets: Vec<(String, u64)> = self
            .workers
            .iter()
            .map(|w| (w.address.clone(), w.worker_index))
            .collect();
        for (address, worker_index) in targets {
            debug!("Assigning index {} to {}", worker_index, address);
            self.messenger
                .send(Envelope::to_one(
                    self.messenger.address(),
                    address,
                    MessageBody::AssignId { worker_index },
                ))
                .await?;
        }
        self.await_flag("id assignment", timeout, |w| w.phases.assigned)
            .await
    }

    /// Ask every worker to stand up its SUT connector.
    pub async fn initialize_sut(&mut self, timeout: Duration) -> Result<()> {
        info!("Initializing {} workers", self.workers.len());
        self.messenger
            .send(Envelope::broadcast(
                self.messenger.address(),
                MessageBody::Initialize,
            ))
            .await?;
        self.await_flag("initialization", timeout, |w| w.phases.ready)
            .await
    }

    /// Distribute a round definition and wait for every worker to stand up
    /// its workload module. The first reported failure rejects the phase.
    pub async fn prepare_round(
        &mut self,
        round: &RoundSpec,
        worker_args: &[Value],
        timeout: Duration,
    ) -> Result<()> {
        if self.workers.is_empty() {
            bail!("No workers connected");
        }
        info!("Preparing round {} ({})", round.round_index, round.label);
        for worker in &mut self.workers {
            worker.phases.prepared = None;
        }

        let targets: Vec<(String, u64)> = self
            .workers
            .iter()
            .map(|w| (w.address.clone(), w.worker_index))
            .collect();
        for (address, worker_index) in targets {
            let tailored = self.tailor_round(round, worker_args, worker_index);
            self.messenger
                .send(Envelope::to_one(
                    self.messenger.address(),
                    address,
                    MessageBody::Prepare { round: tailored },
                ))
                .await?;
        }

        let messenger = Arc::clone(&self.messenger);
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(Duration::from_millis(Self::PHASE_POLL_INTERVAL_MS));

        loop {
            if let Some((address, message)) = self.first_prepare_failure() {
                bail!(
                    "Worker {} failed to prepare round {}: {}",
                    address,
                    round.label,
                    message
                );
            }
            if self
                .workers
                .iter()
                .all(|w| matches!(w.phases.prepared, Some(Ok(()))))
            {
                return Ok(());
            }
            tokio::select! {
                maybe = messenger.recv() => match maybe {
                    Some(envelope) => self.dispatch(envelope),
                    None => bail!("Messaging channel closed while preparing round {}", round.label),
                },
                _ = ticker.tick() => {
                    if Instant::now() >= deadline {
                        bail!("Timed out preparing round {}", round.label);
                    }
                }
            }
        }
    }

    /// Run one round across the pool and merge the per-worker statistics
    /// and latency digests.
    ///
    /// Progress updates arriving mid-round are folded into the running
    /// totals and logged periodically. The merged collector spans the
    /// earliest activation and the latest deactivation across workers.
    pub async fn execute_round(
        &mut self,
        round: &RoundSpec,
        worker_args: &[Value],
        timeout: Duration,
    ) -> Result<RoundResult> {
        if self.workers.is_empty() {
            bail!("No workers connected");
        }
        if round.tx_number.is_none() && round.tx_duration_ms.is_none() {
            bail!(
                "Round {} needs a transaction count or a duration",
                round.label
            );
        }

        info!("Executing round {} ({})", round.round_index, round.label);
        self.round_progress = ProgressDelta::default();
        for worker in &mut self.workers {
            worker.phases.test_result = None;
        }

        let targets: Vec<(String, u64)> = self
            .workers
            .iter()
            .map(|w| (w.address.clone(), w.worker_index))
            .collect();
        for (address, worker_index) in targets {
            let tailored = self.tailor_round(round, worker_args, worker_index);
            self.messenger
                .send(Envelope::to_one(
                    self.messenger.address(),
                    address,
                    MessageBody::Test { round: tailored },
                ))
                .await?;
        }

        let messenger = Arc::clone(&self.messenger);
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(Duration::from_millis(Self::PHASE_POLL_INTERVAL_MS));
        let mut ticks: u64 = 0;

        loop {
            if let Some((address, message)) = self.first_test_failure() {
                bail!("Worker {} failed round {}: {}", address, round.label, message);
            }
            if self
                .workers
                .iter()
                .all(|w| matches!(w.phases.test_result, Some(Ok(_))))
            {
                break;
            }
            tokio::select! {
                maybe = messenger.recv() => match maybe {
                    Some(envelope) => self.dispatch(envelope),
                    None => bail!("Messaging channel closed during round {}", round.label),
                },
                _ = ticker.tick() => {
                    ticks += 1;
                    if Instant::now() >= deadline {
                        bail!("Timed out waiting for round {} results", round.label);
                    }
                    if ticks % Self::PROGRESS_LOG_EVERY_TICKS == 0 {
                        info!(
                            "Round {} progress: {} submitted, {} successful, {} failed",
                            round.label,
                            self.round_progress.submitted,
                            self.round_progress.successful,
                            self.round_progress.failed
                        );
                    }
                }
            }
        }

        let mut snapshots = Vec::new();
        let mut digests = Vec::new();
        for worker in &mut self.workers {
            if let Some(Ok(result)) = worker.phases.test_result.take() {
                snapshots.push(result.stats);
                digests.push(result.latencies);
            }
        }
        let merged = TxStatsCollector::merge(&snapshots);
        info!(
            "Round {} complete: {} submitted, {} successful, {} failed",
            round.label,
            merged.total_submitted(),
            merged.total_successful(),
            merged.total_failed()
        );
        Ok(RoundResult {
            stats: merged,
            latencies: LatencyDigest::merge(&digests),
        })
    }

    /// Broadcast the exit request and release the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down {} workers", self.workers.len());
        self.messenger
            .send(Envelope::broadcast(
                self.messenger.address(),
                MessageBody::Exit,
            ))
            .await?;
        // Let the exit broadcast reach slow transports before dropping them.
        sleep(Duration::from_millis(Self::EXIT_FLUSH_DELAY_MS)).await;
        self.messenger.close().await?;
        Ok(())
    }

    /// Specialize the shared round definition for one worker: its share of
    /// the transaction count and count-based trim, its prepared arguments,
    /// and the pool size rate controllers divide by.
    fn tailor_round(&self, round: &RoundSpec, worker_args: &[Value], worker_index: u64) -> RoundSpec {
        let total_workers = self.workers.len() as u64;
        let mut tailored = round.clone();
        tailored.total_workers = total_workers;
        tailored.worker_args = worker_args
            .get(worker_index as usize)
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(total_tx) = round.tx_number {
            tailored.tx_number = Some((total_tx / total_workers).max(1));
        }
        if let Some(TrimSpec::Count(count)) = round.trim {
            tailored.trim = Some(TrimSpec::Count(count / total_workers));
        }
        tailored
    }

    /// Pump envelopes until `done` holds for every worker or the deadline
    /// passes.
    async fn await_flag<F>(&mut self, phase: &str, timeout: Duration, done: F) -> Result<()>
    where
        F: Fn(&WorkerEntry) -> bool,
    {
        let messenger = Arc::clone(&self.messenger);
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(Duration::from_millis(Self::PHASE_POLL_INTERVAL_MS));

        loop {
            if let Some(message) = self.fault.take() {
                bail!("{}", message);
            }
            if self.workers.iter().all(|w| done(w)) {
                return Ok(());
            }
            tokio::select! {
                maybe = messenger.recv() => match maybe {
                    Some(envelope) => self.dispatch(envelope),
                    None => bail!("Messaging channel closed while awaiting {}", phase),
                },
                _ = ticker.tick() => {
                    if Instant::now() >= deadline {
                        let missing = self.workers.iter().filter(|w| !done(w)).count();
                        bail!(
                            "Timed out awaiting {} from {} of {} workers",
                            phase,
                            missing,
                            self.workers.len()
                        );
                    }
                }
            }
        }
    }

    fn first_prepare_failure(&self) -> Option<(String, String)> {
        self.workers.iter().find_map(|w| match &w.phases.prepared {
            Some(Err(message)) => Some((w.address.clone(), message.clone())),
            _ => None,
        })
    }

    fn first_test_failure(&self) -> Option<(String, String)> {
        self.workers.iter().find_map(|w| match &w.phases.test_result {
            Some(Err(message)) => Some((w.address.clone(), message.clone())),
            _ => None,
        })
    }

    fn worker_mut(&mut self, address: &str) -> Option<&mut WorkerEntry> {
        self.workers.iter_mut().find(|w| w.address == address)
    }

    fn register_worker(&mut self, address: String) {
        if let Some(worker) = self.worker_mut(&address) {
            worker.phases.connected = true;
            return;
        }
        let worker_index = self.workers.len() as u64;
        if worker_index >= self.expected_workers {
            warn!(
                "Worker {} connected beyond the expected {}",
                address, self.expected_workers
            );
        }
        info!("Worker {} connected, will be index {}", address, worker_index);
        self.workers.push(WorkerEntry {
            address,
            worker_index,
            phases: WorkerPhases {
                connected: true,
                ..WorkerPhases::default()
            },
        });
    }

    /// Apply one incoming envelope to the worker table.
    ///
    /// Registration is the only message accepted from an unknown address;
    /// anything else from a stranger is logged and discarded so a stray
    /// peer cannot corrupt the phase state.
    fn dispatch(&mut self, envelope: Envelope) {
        let Envelope {
            sender,
            body,
            error,
            ..
        } = envelope;

        if matches!(body, MessageBody::Connected) {
            self.register_worker(sender);
            return;
        }
        if !self.workers.iter().any(|w| w.address == sender) {
            warn!(
                "Discarding {} message from unknown sender {}",
                body.name(),
                sender
            );
            return;
        }

        match body {
            MessageBody::Assigned => {
                if let Some(message) = error {
                    self.fault = Some(format!("Worker {} rejected id assignment: {}", sender, message));
                } else if let Some(worker) = self.worker_mut(&sender) {
                    debug!("Worker {} acknowledged its index", sender);
                    worker.phases.assigned = true;
                }
            }
            MessageBody::Ready => {
                if let Some(message) = error {
                    self.fault = Some(format!("Worker {} failed to initialize: {}", sender, message));
                } else if let Some(worker) = self.worker_mut(&sender) {
                    info!("Worker {} is ready", sender);
                    worker.phases.ready = true;
                }
            }
            MessageBody::Prepared => {
                let slot = match error {
                    Some(message) => Err(message),
                    None => Ok(()),
                };
                if let Some(worker) = self.worker_mut(&sender) {
                    worker.phases.prepared = Some(slot);
                }
            }
            MessageBody::TestResult { stats, latencies } => {
                let slot = match error {
                    Some(message) => Err(message),
                    None => Ok(WorkerRoundResult { stats, latencies }),
                };
                if let Some(worker) = self.worker_mut(&sender) {
                    worker.phases.test_result = Some(slot);
                }
            }
            MessageBody::TxUpdate { progress } => {
                self.round_progress.submitted += progress.submitted;
                self.round_progress.successful += progress.successful;
                self.round_progress.failed += progress.failed;
            }
            MessageBody::TxReset { stats } => {
                debug!(
                    "Worker {} closed its progress stream: {} submitted, {} successful, {} failed",
                    sender,
                    stats.total_submitted(),
                    stats.total_successful(),
                    stats.total_failed()
                );
            }
            other => {
                warn!("Unexpected {} message from {}", other.name(), sender);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::channel::ChannelHub;
    use crate::protocol::{RateSpec, WorkloadSpec};
    use crate::stats::{TxStatus, MIXED_IDENTITY};

    fn sample_round(total_tx: Option<u64>, duration_ms: Option<u64>) -> RoundSpec {
        RoundSpec {
            label: "orchestrated".to_string(),
            round_index: 0,
            tx_number: total_tx,
            tx_duration_ms: duration_ms,
            rate: RateSpec::new("no-rate", serde_json::Value::Null),
            trim: None,
            workload: WorkloadSpec {
                module: "noop".to_string(),
                arguments: serde_json::Value::Null,
            },
            total_workers: 0,
            worker_args: serde_json::Value::Null,
        }
    }

    /// A worker stand-in that walks the protocol ladder and reports one
    /// successful transaction per assigned tx_number unit.
    fn spawn_scripted_worker(
        hub: &ChannelHub,
        name: &str,
        fail_prepare: bool,
        updates_per_round: u64,
    ) -> tokio::task::JoinHandle<()> {
        let endpoint = hub.endpoint(name);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut my_index: i64 = 0;
            while let Some(envelope) = endpoint.recv().await {
                let Envelope {
                    sender: manager, body, ..
                } = envelope;
                match body {
                    MessageBody::Register => {
                        endpoint
                            .send(Envelope::to_one(name.as_str(), manager, MessageBody::Connected))
                            .await
                            .unwrap();
                    }
                    MessageBody::AssignId { worker_index } => {
                        my_index = worker_index as i64;
                        endpoint
                            .send(Envelope::to_one(name.as_str(), manager, MessageBody::Assigned))
                            .await
                            .unwrap();
                    }
                    MessageBody::Initialize => {
                        endpoint
                            .send(Envelope::to_one(name.as_str(), manager, MessageBody::Ready))
                            .await
                            .unwrap();
                    }
                    MessageBody::Prepare { .. } => {
                        let reply =
                            Envelope::to_one(name.as_str(), manager, MessageBody::Prepared);
                        let reply = if fail_prepare {
                            reply.with_error("workload missing")
                        } else {
                            reply
                        };
                        endpoint.send(reply).await.unwrap();
                    }
                    MessageBody::Test { round } => {
                        for _ in 0..updates_per_round {
                            endpoint
                                .send(Envelope::to_one(
                                    name.as_str(),
                                    manager.as_str(),
                                    MessageBody::TxUpdate {
                                        progress: ProgressDelta {
                                            submitted: 5,
                                            successful: 3,
                                            failed: 2,
                                        },
                                    },
                                ))
                                .await
                                .unwrap();
                        }

                        let share = round.tx_number.unwrap_or(1);
                        let mut stats =
                            TxStatsCollector::new(my_index, round.round_index as i64, &round.label);
                        stats.activate();
                        stats.tx_submitted(share);
                        let base = stats.round_start_time();
                        let finished: Vec<TxStatus> = (0..share)
                            .map(|i| {
                                let mut tx = TxStatus::new_at(format!("tx-{}", i), base + 1);
                                tx.success_at(base + 5);
                                tx
                            })
                            .collect();
                        stats.tx_finished(&finished);
                        stats.deactivate();

                        endpoint
                            .send(Envelope::to_one(
                                name.as_str(),
                                manager,
                                MessageBody::TestResult {
                                    stats: stats.snapshot(),
                                    latencies: LatencyDigest::default(),
                                },
                            ))
                            .await
                            .unwrap();
                    }
                    MessageBody::Exit => break,
                    _ => {}
                }
            }
        })
    }

    #[tokio::test]
    async fn test_full_phase_ladder_merges_round_results() {
        let hub = ChannelHub::new();
        let messenger: Arc<dyn Messenger> = Arc::new(hub.endpoint("manager"));
        let mut orchestrator = RoundOrchestrator::new(messenger, 2).unwrap();

        spawn_scripted_worker(&hub, "worker-a", false, 0);
        spawn_scripted_worker(&hub, "worker-b", false, 0);

        let wait = Duration::from_secs(5);
        orchestrator.mobilize(wait).await.unwrap();
        assert_eq!(orchestrator.connected_workers(), 2);
        orchestrator.assign_identities(wait).await.unwrap();
        orchestrator.initialize_sut(wait).await.unwrap();

        let round = sample_round(Some(10), None);
        orchestrator.prepare_round(&round, &[], wait).await.unwrap();
        let result = orchestrator.execute_round(&round, &[], wait).await.unwrap();

        // Each worker got a share of 5 and reported 5 successes.
        let merged = result.stats;
        assert_eq!(merged.total_submitted(), 10);
        assert_eq!(merged.total_successful(), 10);
        assert_eq!(merged.worker_index(), MIXED_IDENTITY);
        assert_eq!(merged.round_index(), 0);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_failure_rejects_the_round() {
        let hub = ChannelHub::new();
        let messenger: Arc<dyn Messenger> = Arc::new(hub.endpoint("manager"));
        let mut orchestrator = RoundOrchestrator::new(messenger, 1).unwrap();

        spawn_scripted_worker(&hub, "worker-a", true, 0);

        let wait = Duration::from_secs(5);
        orchestrator.mobilize(wait).await.unwrap();
        orchestrator.assign_identities(wait).await.unwrap();
        orchestrator.initialize_sut(wait).await.unwrap();

        let round = sample_round(Some(4), None);
        let err = orchestrator
            .prepare_round(&round, &[], wait)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workload missing"));

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_progress_updates_accumulate_during_round() {
        let hub = ChannelHub::new();
        let messenger: Arc<dyn Messenger> = Arc::new(hub.endpoint("manager"));
        let mut orchestrator = RoundOrchestrator::new(messenger, 1).unwrap();

        spawn_scripted_worker(&hub, "worker-a", false, 2);

        let wait = Duration::from_secs(5);
        orchestrator.mobilize(wait).await.unwrap();
        orchestrator.assign_identities(wait).await.unwrap();
        orchestrator.initialize_sut(wait).await.unwrap();

        let round = sample_round(Some(4), None);
        orchestrator.prepare_round(&round, &[], wait).await.unwrap();
        orchestrator.execute_round(&round, &[], wait).await.unwrap();

        let progress = orchestrator.progress();
        assert_eq!(progress.submitted, 10);
        assert_eq!(progress.successful, 6);
        assert_eq!(progress.failed, 4);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_sender_is_discarded() {
        let hub = ChannelHub::new();
        let messenger: Arc<dyn Messenger> = Arc::new(hub.endpoint("manager"));
        let mut orchestrator = RoundOrchestrator::new(messenger, 1).unwrap();

        // A stray peer firing off progress before ever registering.
        let ghost = hub.endpoint("ghost");
        ghost
            .send(Envelope::to_one(
                "ghost",
                "manager",
                MessageBody::TxUpdate {
                    progress: ProgressDelta {
                        submitted: 999,
                        successful: 999,
                        failed: 999,
                    },
                },
            ))
            .await
            .unwrap();

        spawn_scripted_worker(&hub, "worker-a", false, 0);
        orchestrator.mobilize(Duration::from_secs(5)).await.unwrap();

        assert_eq!(orchestrator.connected_workers(), 1);
        assert_eq!(orchestrator.progress().submitted, 0);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_without_bounds_is_rejected() {
        let hub = ChannelHub::new();
        let messenger: Arc<dyn Messenger> = Arc::new(hub.endpoint("manager"));
        let mut orchestrator = RoundOrchestrator::new(messenger, 1).unwrap();

        spawn_scripted_worker(&hub, "worker-a", false, 0);
        orchestrator.mobilize(Duration::from_secs(5)).await.unwrap();

        let round = sample_round(None, None);
        let err = orchestrator
            .execute_round(&round, &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("needs a transaction count"));

        orchestrator.shutdown().await.unwrap();
    }

    #[test]
    fn test_round_tailoring_divides_count_and_trim() {
        let hub = ChannelHub::new();
        let messenger: Arc<dyn Messenger> = Arc::new(hub.endpoint("manager"));
        let mut orchestrator = RoundOrchestrator::new(messenger, 3).unwrap();
        for name in ["a", "b", "c"] {
            orchestrator.register_worker(name.to_string());
        }

        let mut round = sample_round(Some(100), None);
        round.trim = Some(TrimSpec::Count(10));

        let args = vec![serde_json::json!({"seed": 7}), Value::Null, Value::Null];
        let tailored = orchestrator.tailor_round(&round, &args, 0);
        assert_eq!(tailored.tx_number, Some(33));
        assert_eq!(tailored.trim, Some(TrimSpec::Count(3)));
        assert_eq!(tailored.total_workers, 3);
        assert_eq!(tailored.worker_args["seed"], 7);

        // A count smaller than the pool still hands each worker one.
        let tiny = sample_round(Some(2), None);
        let tailored = orchestrator.tailor_round(&tiny, &[], 2);
        assert_eq!(tailored.tx_number, Some(1));
        assert_eq!(tailored.worker_args, Value::Null);
    }
}
