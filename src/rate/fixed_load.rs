//! Backlog-targeting closed-loop pacing
//!
//! Tries to hold the number of unfinished transactions at a configured
//! target. Below the target it submits as fast as the loop allows; above
//! it, it estimates the drain time of the excess as
//! `(unfinished - target) * average successful latency` and sleeps that
//! long. Until the first transaction finishes there is no latency estimate,
//! so the controller paces at a configured starting TPS instead.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatus};

use super::{pace, parse_opts, per_worker, ConfigError, RateController};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FixedLoadOpts {
    transaction_load: f64,
    start_tps: f64,
}

impl Default for FixedLoadOpts {
    fn default() -> Self {
        Self {
            transaction_load: FixedLoadController::DEFAULT_TRANSACTION_LOAD,
            start_tps: FixedLoadController::DEFAULT_START_TPS,
        }
    }
}

/// Closed-loop controller holding a constant transaction backlog.
#[derive(Debug)]
pub struct FixedLoadController {
    target_load: f64,
    startup_gap_ms: f64,
}

impl FixedLoadController {
    /// Default global backlog target.
    pub const DEFAULT_TRANSACTION_LOAD: f64 = 10.0;

    /// Default global TPS driven before the first completion arrives.
    pub const DEFAULT_START_TPS: f64 = 5.0;

    pub fn build(spec: &RateSpec, round: &RoundSpec) -> Result<Self, ConfigError> {
        let opts: FixedLoadOpts = parse_opts("fixed-load", &spec.opts)?;
        if opts.transaction_load <= 0.0 || opts.start_tps <= 0.0 {
            return Err(ConfigError::InvalidOptions {
                controller: "fixed-load",
                reason: format!(
                    "transaction_load and start_tps must be positive, got {} and {}",
                    opts.transaction_load, opts.start_tps
                ),
            });
        }

        let worker_start_tps = per_worker(opts.start_tps, round.total_workers);
        Ok(Self {
            target_load: per_worker(opts.transaction_load, round.total_workers),
            startup_gap_ms: 1000.0 / worker_start_tps,
        })
    }

    /// Drain-time estimate for the current backlog, or `None` while the
    /// backlog is under target and submission should continue immediately.
    fn pending_delay_ms(
        &self,
        submitted: u64,
        finished: u64,
        avg_successful_latency_ms: f64,
    ) -> Option<f64> {
        let unfinished = submitted.saturating_sub(finished) as f64;
        if unfinished < self.target_load {
            None
        } else {
            Some((unfinished - self.target_load) * avg_successful_latency_ms)
        }
    }
}

#[async_trait]
impl RateController for FixedLoadController {
    fn name(&self) -> &'static str {
        "fixed-load"
    }

    async fn apply_rate_control(
        &mut self,
        _start_time: u64,
        submitted: u64,
        _results: &[TxStatus],
        stats: &SharedTxStats,
    ) -> Result<()> {
        let finished = stats.total_finished();
        if finished == 0 {
            pace(self.startup_gap_ms).await;
            return Ok(());
        }

        let avg_latency = stats.avg_successful_latency_ms();
        if let Some(delay) = self.pending_delay_ms(submitted, finished, avg_latency) {
            pace(delay).await;
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        Ok(())
    }
}
