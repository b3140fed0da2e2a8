//! Saturation-seeking adaptive pacing
//!
//! Hill-climbs toward the highest rate the SUT sustains. The controller
//! drives a current TPS and, once per sample window, compares the observed
//! completion rate against the previous window: no regression means the
//! driven rate goes up by one step, a regression means it goes down by one
//! step and the step itself is halved until it reaches a floor. The driven
//! rate therefore oscillates with shrinking amplitude around the SUT's
//! saturation point.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatus};
use crate::utils;

use super::{pace, parse_opts, per_worker, ConfigError, RateController};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct MaxRateOpts {
    tps: f64,
    step: f64,
    sample_interval_ms: u64,
    include_failed: bool,
    step_floor: f64,
}

impl Default for MaxRateOpts {
    fn default() -> Self {
        Self {
            tps: MaxRateController::DEFAULT_TPS,
            step: MaxRateController::DEFAULT_STEP,
            sample_interval_ms: MaxRateController::DEFAULT_SAMPLE_INTERVAL_MS,
            include_failed: true,
            step_floor: MaxRateController::DEFAULT_STEP_FLOOR,
        }
    }
}

/// Adaptive-search controller.
#[derive(Debug)]
pub struct MaxRateController {
    current_tps: f64,
    step: f64,
    step_floor: f64,
    sample_interval_ms: u64,
    include_failed: bool,
    window_start_ms: u64,
    window_base_count: u64,
    previous_observed_tps: f64,
}

impl MaxRateController {
    /// Default global starting TPS.
    pub const DEFAULT_TPS: f64 = 5.0;

    /// Default global TPS adjustment per sample window.
    pub const DEFAULT_STEP: f64 = 5.0;

    /// Default length of one observation window.
    pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 10_000;

    /// The step stops halving once it reaches this value.
    pub const DEFAULT_STEP_FLOOR: f64 = 0.2;

    pub fn build(spec: &RateSpec, round: &RoundSpec) -> Result<Self, ConfigError> {
        let opts: MaxRateOpts = parse_opts("maximum-rate", &spec.opts)?;
        if opts.tps <= 0.0 || opts.step <= 0.0 || opts.sample_interval_ms == 0 {
            return Err(ConfigError::InvalidOptions {
                controller: "maximum-rate",
                reason: format!(
                    "tps, step and sample_interval_ms must be positive, got {}, {} and {}",
                    opts.tps, opts.step, opts.sample_interval_ms
                ),
            });
        }

        Ok(Self {
            current_tps: per_worker(opts.tps, round.total_workers),
            step: per_worker(opts.step, round.total_workers),
            step_floor: opts.step_floor,
            sample_interval_ms: opts.sample_interval_ms,
            include_failed: opts.include_failed,
            window_start_ms: 0,
            window_base_count: 0,
            previous_observed_tps: 0.0,
        })
    }

    fn observed_count(&self, stats: &SharedTxStats) -> u64 {
        if self.include_failed {
            stats.total_successful() + stats.total_failed()
        } else {
            stats.total_successful()
        }
    }

    /// Adjust the driven rate after one completed observation window.
    fn evaluate_window(&mut self, observed_tps: f64) {
        if observed_tps >= self.previous_observed_tps {
            self.current_tps += self.step;
        } else {
            self.current_tps -= self.step;
            if self.step > self.step_floor {
                self.step /= 2.0;
            }
        }
        self.previous_observed_tps = observed_tps;
        debug!(
            "Sampled {:.2} tps, now driving {:.2} tps (step {:.2})",
            observed_tps, self.current_tps, self.step
        );
    }

    /// Roll the sample window forward, adjusting the rate when a full
    /// window has elapsed. Returns whether an adjustment happened.
    fn maybe_sample(&mut self, now: u64, completed_count: u64) -> bool {
        if self.window_start_ms == 0 {
            self.window_start_ms = now;
            self.window_base_count = completed_count;
            return false;
        }

        let elapsed = now.saturating_sub(self.window_start_ms);
        if elapsed < self.sample_interval_ms {
            return false;
        }

        let delta = completed_count.saturating_sub(self.window_base_count);
        self.evaluate_window(delta as f64 * 1000.0 / elapsed as f64);
        self.window_start_ms = now;
        self.window_base_count = completed_count;
        true
    }

    fn current_gap_ms(&self) -> f64 {
        if self.current_tps > 0.0 {
            1000.0 / self.current_tps
        } else {
            0.0
        }
    }
}

#[async_trait]
impl RateController for MaxRateController {
    fn name(&self) -> &'static str {
        "maximum-rate"
    }

    async fn apply_rate_control(
        &mut self,
        _start_time: u64,
        _submitted: u64,
        _results: &[TxStatus],
        stats: &SharedTxStats,
    ) -> Result<()> {
        let completed = self.observed_count(stats);
        self.maybe_sample(utils::current_timestamp_ms(), completed);
        pace(self.current_gap_ms()).await;
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        debug!(
            "Adaptive search settled at {:.2} tps per worker",
            self.current_tps
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkloadSpec;
    use crate::stats::TxStatsCollector;

    fn round(total_workers: u64) -> RoundSpec {
        RoundSpec {
            label: "search".to_string(),
            round_index: 0,
            tx_number: None,
            tx_duration_ms: Some(60_000),
            rate: RateSpec::new("maximum-rate", serde_json::Value::Null),
            trim: None,
            workload: WorkloadSpec {
                module: "noop".to_string(),
                arguments: serde_json::Value::Null,
            },
            total_workers,
            worker_args: serde_json::Value::Null,
        }
    }

    fn build(opts: serde_json::Value, total_workers: u64) -> MaxRateController {
        let spec = RateSpec::new("maximum-rate", opts);
        MaxRateController::build(&spec, &round(total_workers)).unwrap()
    }

    #[test]
    fn test_targets_divided_across_workers() {
        let controller = build(serde_json::json!({ "tps": 10, "step": 4 }), 2);
        assert_eq!(controller.current_tps, 5.0);
        assert_eq!(controller.step, 2.0);
    }

    #[test]
    fn test_hill_climb_grows_then_backs_off_with_halved_step() {
        let mut controller = build(serde_json::json!({ "tps": 5, "step": 5 }), 1);

        // First window did not regress against the (zero) baseline.
        controller.evaluate_window(6.0);
        assert_eq!(controller.current_tps, 10.0);

        // Regression: back off and halve the step.
        controller.evaluate_window(4.0);
        assert_eq!(controller.current_tps, 5.0);
        assert_eq!(controller.step, 2.5);

        // Recovery relative to the previous window: climb by the new step.
        controller.evaluate_window(4.5);
        assert_eq!(controller.current_tps, 7.5);
    }

    #[test]
    fn test_step_halving_stops_at_floor() {
        let mut controller = build(serde_json::json!({ "tps": 5, "step": 5 }), 1);
        controller.step = 0.2;
        controller.previous_observed_tps = 10.0;

        controller.evaluate_window(1.0);
        assert_eq!(controller.step, 0.2);
    }

    #[test]
    fn test_sample_window_bookkeeping() {
        let mut controller = build(
            serde_json::json!({ "tps": 5, "step": 5, "sample_interval_ms": 10000 }),
            1,
        );

        // First call only establishes the baseline.
        assert!(!controller.maybe_sample(1_000, 0));
        // Window not yet elapsed.
        assert!(!controller.maybe_sample(6_000, 30));
        // 10 s elapsed, 50 completions: 5 tps observed, rate climbs.
        assert!(controller.maybe_sample(11_000, 50));
        assert_eq!(controller.previous_observed_tps, 5.0);
        assert_eq!(controller.current_tps, 10.0);
        assert_eq!(controller.window_base_count, 50);
    }

    #[test]
    fn test_observed_count_respects_include_failed() {
        let mut collector = TxStatsCollector::new(0, 0, "search");
        collector.activate();
        let start = collector.round_start_time();
        let mut ok = crate::stats::TxStatus::new_at("ok", start + 1);
        ok.success_at(start + 2);
        let mut bad = crate::stats::TxStatus::new_at("bad", start + 1);
        bad.fail("nope");
        collector.tx_finished(&[ok, bad]);
        let stats = SharedTxStats::new(collector);

        let with_failed = build(serde_json::json!({ "include_failed": true }), 1);
        assert_eq!(with_failed.observed_count(&stats), 2);

        let without_failed = build(serde_json::json!({ "include_failed": false }), 1);
        assert_eq!(without_failed.observed_count(&stats), 1);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let spec = RateSpec::new("maximum-rate", serde_json::json!({ "step": 0 }));
        let err = MaxRateController::build(&spec, &round(1)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions { controller: "maximum-rate", .. }));
    }
}
