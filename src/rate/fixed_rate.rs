//! Open-loop fixed-rate pacing
//!
//! Schedules submission `n` at `start_time + n * (1000 / per_worker_tps)`
//! and sleeps off any positive difference to that schedule. Completion
//! status is ignored entirely, so a SUT slower than the target accumulates
//! backlog without bound; that is the intended behavior of this
//! controller, not a defect.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatus};
use crate::utils;

use super::{pace, parse_opts, per_worker, ConfigError, RateController};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FixedRateOpts {
    tps: f64,
    sleep_skip_ms: f64,
}

impl Default for FixedRateOpts {
    fn default() -> Self {
        Self {
            tps: FixedRateController::DEFAULT_TPS,
            sleep_skip_ms: FixedRateController::DEFAULT_SLEEP_SKIP_MS,
        }
    }
}

/// Constant-rate controller. A global `tps` of 0 disables pacing.
#[derive(Debug)]
pub struct FixedRateController {
    gap_ms: f64,
    sleep_skip_ms: f64,
}

impl FixedRateController {
    /// Default global transactions-per-second target.
    pub const DEFAULT_TPS: f64 = 10.0;

    /// Computed sleeps at or under this many milliseconds are skipped; a
    /// sleep that short costs more in scheduling than it buys in pacing.
    pub const DEFAULT_SLEEP_SKIP_MS: f64 = 5.0;

    pub fn build(spec: &RateSpec, round: &RoundSpec) -> Result<Self, ConfigError> {
        let opts: FixedRateOpts = parse_opts("fixed-rate", &spec.opts)?;
        if opts.tps < 0.0 {
            return Err(ConfigError::InvalidOptions {
                controller: "fixed-rate",
                reason: format!("tps must be non-negative, got {}", opts.tps),
            });
        }

        let worker_tps = per_worker(opts.tps, round.total_workers);
        let gap_ms = if worker_tps > 0.0 { 1000.0 / worker_tps } else { 0.0 };

        Ok(Self {
            gap_ms,
            sleep_skip_ms: opts.sleep_skip_ms,
        })
    }

    /// Milliseconds between the next scheduled send and `now`. Negative
    /// when the worker is behind schedule.
    fn pending_delay_ms(&self, start_time: u64, submitted: u64, now: u64) -> f64 {
        if self.gap_ms == 0.0 {
            return 0.0;
        }
        start_time as f64 + submitted as f64 * self.gap_ms - now as f64
    }
}

#[async_trait]
impl RateController for FixedRateController {
    fn name(&self) -> &'static str {
        "fixed-rate"
    }

    async fn apply_rate_control(
        &mut self,
        start_time: u64,
        submitted: u64,
        _results: &[TxStatus],
        _stats: &SharedTxStats,
    ) -> Result<()> {
        let delay = self.pending_delay_ms(start_time, submitted, utils::current_timestamp_ms());
        if delay > self.sleep_skip_ms {
            pace(delay).await;
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        Ok(())
    }
}
