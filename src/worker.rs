//! # Benchmark Worker Module
//!
//! The worker side of the protocol: a message pump that walks the phase
//! ladder under manager direction, plus the round engine that drives a
//! workload against the SUT under rate control.
//!
//! ## Round execution loop
//!
//! Each iteration asks the rate controller for permission to proceed,
//! recycles one slot of the in-flight ring (awaiting whatever task still
//! holds it), spawns the next submit task into that slot and yields. The
//! ring bounds concurrent submits without queueing: once it wraps, the
//! oldest outstanding task throttles the loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::connector::{build_connector, NotifyingConnector, SutConnector};
use crate::messaging::Messenger;
use crate::observer::{ProgressReporter, ProgressSink};
use crate::protocol::{Envelope, MessageBody, RoundSpec};
use crate::rate::{build_controller, RateController};
use crate::stats::{LatencyDigest, SharedTxStats, TxStatsCollector};
use crate::workload::{build_workload, WorkloadContext, WorkloadModule};

/// State carried from a round's prepare phase into its execution.
struct PreparedRound {
    round: RoundSpec,
    workload: Arc<dyn WorkloadModule>,
    stats: SharedTxStats,
    notifier: Arc<NotifyingConnector>,
}

/// One worker process: pumps protocol messages and executes rounds.
pub struct BenchmarkWorker {
    messenger: Arc<dyn Messenger>,
    sut_kind: String,
    sut_options: Value,
    max_in_flight: usize,
    update_interval: Duration,
    registered: bool,
    manager_address: Option<String>,
    worker_index: Option<u64>,
    connector: Option<Arc<dyn SutConnector>>,
    prepared: Option<PreparedRound>,
}

impl BenchmarkWorker {
    // Worker timing constants
    const PREPARE_LOG_INTERVAL_MS: u64 = 1_000;

    pub fn new(
        messenger: Arc<dyn Messenger>,
        sut_kind: impl Into<String>,
        sut_options: Value,
    ) -> Self {
        Self {
            messenger,
            sut_kind: sut_kind.into(),
            sut_options,
            max_in_flight: crate::defaults::MAX_IN_FLIGHT,
            update_interval: Duration::from_millis(crate::defaults::TX_UPDATE_INTERVAL_MS),
            registered: false,
            manager_address: None,
            worker_index: None,
            connector: None,
            prepared: None,
        }
    }

    /// Override the in-flight window size.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Override the progress update interval.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Pump protocol messages until the manager requests the exit or the
    /// transport closes.
    ///
    /// Phase failures are reported back inside the corresponding reply
    /// rather than crashing the pump, so the manager decides what a
    /// failed worker means for the run.
    pub async fn run(&mut self) -> Result<()> {
        info!("Worker {} awaiting the manager", self.messenger.address());
        while let Some(envelope) = self.messenger.recv().await {
            let Envelope { sender, body, .. } = envelope;
            if self.manager_address.is_none() {
                self.manager_address = Some(sender.clone());
            }
            match body {
                MessageBody::Register => self.on_register(&sender).await?,
                MessageBody::AssignId { worker_index } => {
                    self.on_assign(&sender, worker_index).await?
                }
                MessageBody::Initialize => self.on_initialize(&sender).await?,
                MessageBody::Prepare { round } => self.on_prepare(&sender, round).await?,
                MessageBody::Test { round } => self.on_test(&sender, round).await?,
                MessageBody::Exit => {
                    info!("Worker {} exiting on manager request", self.messenger.address());
                    break;
                }
                other => debug!("Ignoring {} message from {}", other.name(), sender),
            }
        }
        self.messenger.close().await?;
        Ok(())
    }

    async fn on_register(&mut self, manager: &str) -> Result<()> {
        if self.registered {
            debug!("Already connected, ignoring registration poll");
            return Ok(());
        }
        self.registered = true;
        self.messenger
            .send(Envelope::to_one(
                self.messenger.address(),
                manager,
                MessageBody::Connected,
            ))
            .await?;
        Ok(())
    }

    async fn on_assign(&mut self, manager: &str, worker_index: u64) -> Result<()> {
        info!("Assigned worker index {}", worker_index);
        self.worker_index = Some(worker_index);
        self.messenger
            .send(Envelope::to_one(
                self.messenger.address(),
                manager,
                MessageBody::Assigned,
            ))
            .await?;
        Ok(())
    }

    async fn on_initialize(&mut self, manager: &str) -> Result<()> {
        let reply = Envelope::to_one(self.messenger.address(), manager, MessageBody::Ready);
        match self.initialize_connector().await {
            Ok(()) => self.messenger.send(reply).await?,
            Err(e) => {
                error!("Connector initialization failed: {}", e);
                self.messenger.send(reply.with_error(e.to_string())).await?;
            }
        }
        Ok(())
    }

    async fn initialize_connector(&mut self) -> Result<()> {
        let worker_index = self
            .worker_index
            .ok_or_else(|| anyhow!("Cannot initialize before an index is assigned"))?;
        let connector = build_connector(&self.sut_kind, worker_index as i64, &self.sut_options)?;
        connector.init(true).await?;
        self.connector = Some(connector);
        Ok(())
    }

    async fn on_prepare(&mut self, manager: &str, round: RoundSpec) -> Result<()> {
        let label = round.label.clone();
        let reply = Envelope::to_one(self.messenger.address(), manager, MessageBody::Prepared);
        match self.prepare_round(round).await {
            Ok(()) => self.messenger.send(reply).await?,
            Err(e) => {
                error!("Failed to prepare round {}: {}", label, e);
                self.messenger.send(reply.with_error(e.to_string())).await?;
            }
        }
        Ok(())
    }

    /// Stand up the round: fresh statistics, the notifying connector
    /// wrapper, the SUT context and the workload module.
    async fn prepare_round(&mut self, round: RoundSpec) -> Result<()> {
        let worker_index = self
            .worker_index
            .ok_or_else(|| anyhow!("Cannot prepare before an index is assigned"))?;
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| anyhow!("Cannot prepare before the connector is initialized"))?
            .clone();

        let stats = SharedTxStats::new(TxStatsCollector::new(
            worker_index as i64,
            round.round_index as i64,
            &round.label,
        ));
        let notifier = Arc::new(NotifyingConnector::new(
            connector.clone(),
            stats.clone(),
            round.trim,
        )?);

        connector
            .open_context(round.round_index, &round.worker_args)
            .await?;

        let workload = build_workload(&round.workload)?;
        let context = WorkloadContext {
            worker_index,
            total_workers: round.total_workers,
            round_index: round.round_index,
            round_arguments: round.workload.arguments.clone(),
            worker_arguments: round.worker_args.clone(),
            sut: notifier.clone(),
        };
        if let Err(e) =
            Self::initialize_with_heartbeat(&round.label, workload.as_ref(), context).await
        {
            if let Err(release_err) = connector.release_context().await {
                warn!(
                    "Context release after failed preparation also failed: {}",
                    release_err
                );
            }
            return Err(e);
        }

        info!("Round {} prepared", round.label);
        self.prepared = Some(PreparedRound {
            round,
            workload,
            stats,
            notifier,
        });
        Ok(())
    }

    /// Run the workload's initialize hook, logging a heartbeat while slow
    /// initializations are in flight.
    async fn initialize_with_heartbeat(
        label: &str,
        workload: &dyn WorkloadModule,
        context: WorkloadContext,
    ) -> Result<()> {
        let init = workload.initialize(context);
        tokio::pin!(init);
        let mut ticker = interval(Duration::from_millis(Self::PREPARE_LOG_INTERVAL_MS));
        ticker.tick().await;
        loop {
            tokio::select! {
                result = &mut init => return result,
                _ = ticker.tick() => debug!("Round {} workload is still initializing", label),
            }
        }
    }

    async fn on_test(&mut self, manager: &str, round: RoundSpec) -> Result<()> {
        let label = round.label.clone();
        let index = self.worker_index.unwrap_or(0);
        match self.run_round(round).await {
            Ok((stats, latencies)) => {
                self.messenger
                    .send(Envelope::to_one(
                        self.messenger.address(),
                        manager,
                        MessageBody::TestResult { stats, latencies },
                    ))
                    .await?;
            }
            Err(e) => {
                error!("Round {} failed: {}", label, e);
                let placeholder = TxStatsCollector::new(index as i64, -1, &label);
                self.messenger
                    .send(
                        Envelope::to_one(
                            self.messenger.address(),
                            manager,
                            MessageBody::TestResult {
                                stats: placeholder,
                                latencies: LatencyDigest::default(),
                            },
                        )
                        .with_error(e.to_string()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Execute one round and return its statistics snapshot and latency
    /// digest.
    ///
    /// Teardown always runs, whatever the loop's outcome: the progress
    /// stream is closed, the rate controller and workload get their end
    /// hooks, and the SUT context is released. Teardown failures are
    /// logged so they cannot mask the run result.
    async fn run_round(&mut self, round: RoundSpec) -> Result<(TxStatsCollector, LatencyDigest)> {
        let worker_index = self
            .worker_index
            .ok_or_else(|| anyhow!("Cannot run a round before an index is assigned"))?;
        let prepared = self
            .prepared
            .take()
            .ok_or_else(|| anyhow!("Round {} was never prepared", round.label))?;
        if prepared.round.round_index != round.round_index {
            bail!(
                "Round {} was requested but round {} is prepared",
                round.round_index,
                prepared.round.round_index
            );
        }
        if round.tx_number.is_none() && round.tx_duration_ms.is_none() {
            bail!(
                "Round {} has neither a transaction count nor a duration",
                round.label
            );
        }

        let stats = prepared.stats;
        let workload = prepared.workload;
        let notifier = prepared.notifier;
        let mut rate = build_controller(&round, worker_index as i64, &stats)?;
        info!(
            "Running round {} ({}) under {} control",
            round.round_index,
            round.label,
            rate.name()
        );

        let sink = match &self.manager_address {
            Some(manager) => ProgressSink::Manager {
                messenger: Arc::clone(&self.messenger),
                manager_address: manager.clone(),
            },
            None => ProgressSink::Log,
        };
        let reporter = ProgressReporter::new(sink, self.messenger.address(), self.update_interval)
            .start(stats.clone());

        stats.activate();
        let start_time = stats.round_start_time();
        let run_result = Self::drive_round(
            &round,
            rate.as_mut(),
            &workload,
            &stats,
            start_time,
            self.max_in_flight,
        )
        .await;

        stats.deactivate();
        if let Err(e) = reporter.finish().await {
            warn!("Progress stream close failed: {}", e);
        }
        if let Err(e) = rate.end().await {
            warn!("Rate controller teardown failed: {}", e);
        }
        if let Err(e) = workload.cleanup().await {
            warn!("Workload cleanup failed: {}", e);
        }
        if let Some(connector) = &self.connector {
            if let Err(e) = connector.release_context().await {
                warn!("Context release failed: {}", e);
            }
        }

        run_result?;
        let snapshot = stats.snapshot();
        info!(
            "Round {} done: {} submitted, {} successful, {} failed",
            round.label,
            snapshot.total_submitted(),
            snapshot.total_successful(),
            snapshot.total_failed()
        );
        Ok((snapshot, notifier.latency_digest()))
    }

    /// The submit loop. Exactly one ring slot is recycled per iteration,
    /// so at most `max_in_flight` submit tasks exist at any moment.
    async fn drive_round(
        round: &RoundSpec,
        rate: &mut dyn RateController,
        workload: &Arc<dyn WorkloadModule>,
        stats: &SharedTxStats,
        start_time: u64,
        max_in_flight: usize,
    ) -> Result<()> {
        let mut ring: Vec<Option<JoinHandle<Result<()>>>> =
            (0..max_in_flight).map(|_| None).collect();
        let deadline = round
            .tx_duration_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut submitted: u64 = 0;

        loop {
            if let Some(count) = round.tx_number {
                if submitted >= count {
                    break;
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }

            rate.apply_rate_control(start_time, submitted, &[], stats)
                .await?;

            let slot = (submitted as usize) % ring.len();
            if let Some(handle) = ring[slot].take() {
                handle
                    .await
                    .map_err(|e| anyhow!("In-flight submit task panicked: {}", e))??;
            }
            let task_workload = Arc::clone(workload);
            ring[slot] = Some(tokio::spawn(async move {
                task_workload.submit_transaction().await
            }));
            submitted += 1;

            tokio::task::yield_now().await;
        }

        // Wait out the stragglers before the round is declared over.
        for slot in ring.iter_mut() {
            if let Some(handle) = slot.take() {
                handle
                    .await
                    .map_err(|e| anyhow!("In-flight submit task panicked: {}", e))??;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::channel::{ChannelHub, ChannelMessenger};
    use crate::protocol::{RateSpec, TrimSpec, WorkloadSpec};
    use serde_json::json;

    fn count_round(total: u64) -> RoundSpec {
        RoundSpec {
            label: "count".to_string(),
            round_index: 0,
            tx_number: Some(total),
            tx_duration_ms: None,
            rate: RateSpec::new("fixed-rate", json!({ "tps": 10_000 })),
            trim: None,
            workload: WorkloadSpec {
                module: "noop".to_string(),
                arguments: Value::Null,
            },
            total_workers: 1,
            worker_args: Value::Null,
        }
    }

    fn spawn_worker(hub: &ChannelHub, name: &str) -> tokio::task::JoinHandle<Result<()>> {
        let endpoint: Arc<dyn Messenger> = Arc::new(hub.endpoint(name));
        let mut worker = BenchmarkWorker::new(
            endpoint,
            "sim",
            json!({ "min_latency_ms": 0, "max_latency_ms": 1 }),
        )
        .with_update_interval(Duration::from_millis(50));
        tokio::spawn(async move { worker.run().await })
    }

    /// Receive the next phase reply, skipping the progress stream.
    async fn next_ladder_reply(manager: &ChannelMessenger) -> Envelope {
        loop {
            let envelope = manager.recv().await.expect("worker hung up");
            match envelope.body {
                MessageBody::TxUpdate { .. } | MessageBody::TxReset { .. } => continue,
                _ => return envelope,
            }
        }
    }

    async fn walk_ladder(manager: &ChannelMessenger, worker_address: &str) {
        manager
            .send(Envelope::broadcast("manager", MessageBody::Register))
            .await
            .unwrap();
        assert_eq!(next_ladder_reply(manager).await.body.name(), "connected");

        manager
            .send(Envelope::to_one(
                "manager",
                worker_address,
                MessageBody::AssignId { worker_index: 0 },
            ))
            .await
            .unwrap();
        assert_eq!(next_ladder_reply(manager).await.body.name(), "assigned");

        manager
            .send(Envelope::to_one(
                "manager",
                worker_address,
                MessageBody::Initialize,
            ))
            .await
            .unwrap();
        let ready = next_ladder_reply(manager).await;
        assert_eq!(ready.body.name(), "ready");
        assert!(ready.error.is_none());
    }

    #[tokio::test]
    async fn test_worker_walks_the_ladder_and_runs_a_count_round() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker_task = spawn_worker(&hub, "worker-1");

        walk_ladder(&manager, "worker-1").await;

        let round = count_round(10);
        manager
            .send(Envelope::to_one(
                "manager",
                "worker-1",
                MessageBody::Prepare {
                    round: round.clone(),
                },
            ))
            .await
            .unwrap();
        let prepared = next_ladder_reply(&manager).await;
        assert_eq!(prepared.body.name(), "prepared");
        assert!(prepared.error.is_none());

        manager
            .send(Envelope::to_one(
                "manager",
                "worker-1",
                MessageBody::Test { round },
            ))
            .await
            .unwrap();
        let result = next_ladder_reply(&manager).await;
        assert!(result.error.is_none());
        let (stats, latencies) = match result.body {
            MessageBody::TestResult { stats, latencies } => (stats, latencies),
            other => panic!("unexpected {}", other.name()),
        };
        assert_eq!(stats.total_submitted(), 10);
        assert_eq!(stats.total_successful(), 10);
        assert_eq!(stats.worker_index(), 0);
        assert!(stats.round_finish_time() >= stats.round_start_time());
        assert_eq!(latencies.total_samples, 10);

        manager
            .send(Envelope::broadcast("manager", MessageBody::Exit))
            .await
            .unwrap();
        worker_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duration_round_sleeps_once_under_no_rate() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker_task = spawn_worker(&hub, "worker-1");

        walk_ladder(&manager, "worker-1").await;

        let mut round = count_round(0);
        round.label = "timed".to_string();
        round.tx_number = None;
        round.tx_duration_ms = Some(300);
        round.rate = RateSpec::new("no-rate", Value::Null);

        manager
            .send(Envelope::to_one(
                "manager",
                "worker-1",
                MessageBody::Prepare {
                    round: round.clone(),
                },
            ))
            .await
            .unwrap();
        assert!(next_ladder_reply(&manager).await.error.is_none());

        manager
            .send(Envelope::to_one(
                "manager",
                "worker-1",
                MessageBody::Test { round },
            ))
            .await
            .unwrap();
        let result = next_ladder_reply(&manager).await;
        let stats = match result.body {
            MessageBody::TestResult { stats, .. } => stats,
            other => panic!("unexpected {}", other.name()),
        };

        // The controller sleeps the whole duration before the one submit.
        assert_eq!(stats.total_submitted(), 1);
        assert!(stats.round_finish_time() - stats.round_start_time() >= 300);

        manager
            .send(Envelope::broadcast("manager", MessageBody::Exit))
            .await
            .unwrap();
        worker_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_count_trim_reaches_the_collector() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker_task = spawn_worker(&hub, "worker-1");

        walk_ladder(&manager, "worker-1").await;

        let mut round = count_round(10);
        round.trim = Some(TrimSpec::Count(4));

        manager
            .send(Envelope::to_one(
                "manager",
                "worker-1",
                MessageBody::Prepare {
                    round: round.clone(),
                },
            ))
            .await
            .unwrap();
        assert!(next_ladder_reply(&manager).await.error.is_none());

        manager
            .send(Envelope::to_one(
                "manager",
                "worker-1",
                MessageBody::Test { round },
            ))
            .await
            .unwrap();
        let result = next_ladder_reply(&manager).await;
        let (stats, latencies) = match result.body {
            MessageBody::TestResult { stats, latencies } => (stats, latencies),
            other => panic!("unexpected {}", other.name()),
        };

        assert_eq!(stats.total_submitted(), 10);
        assert_eq!(stats.total_finished(), 6);
        assert_eq!(stats.total_successful(), 6);
        assert_eq!(latencies.total_samples, 6);

        manager
            .send(Envelope::broadcast("manager", MessageBody::Exit))
            .await
            .unwrap();
        worker_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unprepared_round_reports_an_error() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker_task = spawn_worker(&hub, "worker-1");

        walk_ladder(&manager, "worker-1").await;

        manager
            .send(Envelope::to_one(
                "manager",
                "worker-1",
                MessageBody::Test {
                    round: count_round(5),
                },
            ))
            .await
            .unwrap();
        let result = next_ladder_reply(&manager).await;
        assert_eq!(result.body.name(), "test_result");
        assert!(result.error.unwrap().contains("never prepared"));

        manager
            .send(Envelope::broadcast("manager", MessageBody::Exit))
            .await
            .unwrap();
        worker_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_workload_fails_preparation() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker_task = spawn_worker(&hub, "worker-1");

        walk_ladder(&manager, "worker-1").await;

        let mut round = count_round(5);
        round.workload.module = "bogus".to_string();
        manager
            .send(Envelope::to_one(
                "manager",
                "worker-1",
                MessageBody::Prepare { round },
            ))
            .await
            .unwrap();
        let prepared = next_ladder_reply(&manager).await;
        assert_eq!(prepared.body.name(), "prepared");
        assert!(prepared
            .error
            .unwrap()
            .contains("Unknown workload module"));

        manager
            .send(Envelope::broadcast("manager", MessageBody::Exit))
            .await
            .unwrap();
        worker_task.await.unwrap().unwrap();
    }
}
