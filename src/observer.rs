//! Round progress observation
//!
//! While a round runs, the worker streams periodic progress deltas
//! computed between collector snapshots. Deltas go to exactly one sink:
//! the manager as protocol messages, or the local log when no manager is
//! listening. Every stream ends with a final delta followed by a closing
//! snapshot, so the receiving side can reconcile its running totals
//! against the authoritative numbers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use crate::messaging::Messenger;
use crate::protocol::{Envelope, MessageBody, ProgressDelta};
use crate::stats::SharedTxStats;

/// Where progress deltas are delivered.
pub enum ProgressSink {
    /// Stream updates to the manager as protocol messages.
    Manager {
        messenger: Arc<dyn Messenger>,
        manager_address: String,
    },
    /// Log updates locally.
    Log,
}

/// Totals already reported, so the next flush only carries the delta.
#[derive(Debug, Default, Clone, Copy)]
struct ReportedTotals {
    submitted: u64,
    successful: u64,
    failed: u64,
}

/// Periodic progress stream for one round.
pub struct ProgressReporter {
    sink: ProgressSink,
    worker_address: String,
    interval: Duration,
}

impl ProgressReporter {
    pub fn new(sink: ProgressSink, worker_address: impl Into<String>, interval: Duration) -> Self {
        Self {
            sink,
            worker_address: worker_address.into(),
            interval,
        }
    }

    /// Spawn the reporting task over the given round statistics.
    pub fn start(self, stats: SharedTxStats) -> ReporterHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut reported = ReportedTotals::default();
            let mut ticker = interval(self.interval);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush(&stats, &mut reported, false).await {
                            warn!("Progress update failed: {}", e);
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }

            if let Err(e) = self.flush(&stats, &mut reported, true).await {
                warn!("Final progress flush failed: {}", e);
            }
        });

        ReporterHandle {
            stop: stop_tx,
            task,
        }
    }

    /// Send whatever happened since the previous flush. The final flush
    /// also closes the stream with the full snapshot.
    async fn flush(
        &self,
        stats: &SharedTxStats,
        reported: &mut ReportedTotals,
        final_flush: bool,
    ) -> Result<()> {
        let submitted = stats.total_submitted();
        let successful = stats.total_successful();
        let failed = stats.total_failed();
        let delta = ProgressDelta {
            submitted: submitted.saturating_sub(reported.submitted),
            successful: successful.saturating_sub(reported.successful),
            failed: failed.saturating_sub(reported.failed),
        };
        *reported = ReportedTotals {
            submitted,
            successful,
            failed,
        };
        let has_news = delta.submitted > 0 || delta.successful > 0 || delta.failed > 0;

        match &self.sink {
            ProgressSink::Manager {
                messenger,
                manager_address,
            } => {
                if has_news {
                    messenger
                        .send(Envelope::to_one(
                            self.worker_address.as_str(),
                            manager_address.as_str(),
                            MessageBody::TxUpdate { progress: delta },
                        ))
                        .await?;
                }
                if final_flush {
                    messenger
                        .send(Envelope::to_one(
                            self.worker_address.as_str(),
                            manager_address.as_str(),
                            MessageBody::TxReset {
                                stats: stats.snapshot(),
                            },
                        ))
                        .await?;
                }
            }
            ProgressSink::Log => {
                if has_news {
                    info!(
                        "Progress: {} submitted, {} successful, {} failed",
                        submitted, successful, failed
                    );
                }
                if final_flush {
                    info!(
                        "Round finished with {} submitted, {} successful, {} failed",
                        submitted, successful, failed
                    );
                }
            }
        }
        Ok(())
    }
}

/// Control handle for a running reporter.
pub struct ReporterHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReporterHandle {
    /// Stop the periodic stream, flushing the final delta and snapshot.
    pub async fn finish(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.task
            .await
            .map_err(|e| anyhow!("Progress reporter task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::channel::ChannelHub;
    use crate::stats::{TxStatsCollector, TxStatus};

    fn active_stats() -> SharedTxStats {
        let stats = SharedTxStats::new(TxStatsCollector::new(0, 0, "observer-test"));
        stats.activate();
        stats
    }

    fn record_successes(stats: &SharedTxStats, count: u64) {
        stats.tx_submitted(count);
        let base = stats.round_start_time();
        let finished: Vec<TxStatus> = (0..count)
            .map(|i| {
                let mut tx = TxStatus::new_at(format!("tx-{}", i), base + 1);
                tx.success_at(base + 2);
                tx
            })
            .collect();
        stats.tx_finished(&finished);
    }

    #[tokio::test]
    async fn test_reporter_streams_deltas_then_reset() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker_side: Arc<dyn Messenger> = Arc::new(hub.endpoint("worker-1"));

        let stats = active_stats();
        let reporter = ProgressReporter::new(
            ProgressSink::Manager {
                messenger: worker_side,
                manager_address: "manager".to_string(),
            },
            "worker-1",
            Duration::from_millis(30),
        );
        let handle = reporter.start(stats.clone());

        record_successes(&stats, 4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        record_successes(&stats, 2);
        handle.finish().await.unwrap();

        let mut updates = Vec::new();
        let mut resets = 0;
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(100), manager.recv()).await
        {
            match envelope.body {
                MessageBody::TxUpdate { progress } => updates.push(progress),
                MessageBody::TxReset { stats } => {
                    assert_eq!(stats.total_submitted(), 6);
                    resets += 1;
                }
                other => panic!("unexpected message {}", other.name()),
            }
        }

        assert_eq!(resets, 1);
        let submitted: u64 = updates.iter().map(|u| u.submitted).sum();
        assert_eq!(submitted, 6);
        // The first window alone carried the first burst.
        assert_eq!(updates[0].submitted, 4);
    }

    #[tokio::test]
    async fn test_quiet_windows_send_nothing() {
        let hub = ChannelHub::new();
        let manager = hub.endpoint("manager");
        let worker_side: Arc<dyn Messenger> = Arc::new(hub.endpoint("worker-1"));

        let reporter = ProgressReporter::new(
            ProgressSink::Manager {
                messenger: worker_side,
                manager_address: "manager".to_string(),
            },
            "worker-1",
            Duration::from_millis(10),
        );
        let handle = reporter.start(active_stats());

        // Several empty windows pass before the stream closes.
        tokio::time::sleep(Duration::from_millis(45)).await;
        handle.finish().await.unwrap();

        let envelope = manager.recv().await.unwrap();
        assert_eq!(envelope.body.name(), "tx_reset");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), manager.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_log_sink_flushes_without_a_manager() {
        let stats = active_stats();
        let reporter =
            ProgressReporter::new(ProgressSink::Log, "worker-0", Duration::from_millis(20));
        let handle = reporter.start(stats.clone());

        record_successes(&stats, 3);
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.finish().await.unwrap();
    }
}
