//! Linearly interpolated pacing
//!
//! Ramps the per-submission sleep from a starting value to a finishing
//! value over the course of the round. Count-bounded rounds interpolate on
//! the submission index, duration-bounded rounds on elapsed time; the
//! basis is fixed at construction.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatus};
use crate::utils;

use super::{pace, parse_opts, per_worker, ConfigError, RateController};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct LinearRateOpts {
    starting_tps: Option<f64>,
    finishing_tps: Option<f64>,
    sleep_skip_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterpolationBasis {
    /// x = number of submitted transactions
    Index,
    /// x = milliseconds elapsed since round start
    Time,
}

/// Ramped-rate controller.
#[derive(Debug)]
pub struct LinearRateController {
    basis: InterpolationBasis,
    starting_sleep_ms: f64,
    gradient: f64,
    sleep_skip_ms: f64,
}

impl LinearRateController {
    /// Computed sleeps at or under this many milliseconds are skipped.
    pub const DEFAULT_SLEEP_SKIP_MS: f64 = 5.0;

    pub fn build(spec: &RateSpec, round: &RoundSpec) -> Result<Self, ConfigError> {
        let opts: LinearRateOpts = parse_opts("linear-rate", &spec.opts)?;
        let (Some(starting_tps), Some(finishing_tps)) = (opts.starting_tps, opts.finishing_tps)
        else {
            return Err(ConfigError::InvalidOptions {
                controller: "linear-rate",
                reason: "both starting_tps and finishing_tps are required".to_string(),
            });
        };
        if starting_tps <= 0.0 || finishing_tps <= 0.0 {
            return Err(ConfigError::InvalidOptions {
                controller: "linear-rate",
                reason: format!(
                    "starting_tps and finishing_tps must be positive, got {} and {}",
                    starting_tps, finishing_tps
                ),
            });
        }

        let starting_sleep_ms = 1000.0 / per_worker(starting_tps, round.total_workers);
        let finishing_sleep_ms = 1000.0 / per_worker(finishing_tps, round.total_workers);

        // The ramp spans the worker's own share of the round, which is what
        // the tailored specification carries.
        let (basis, span) = if let Some(tx_number) = round.tx_number {
            (InterpolationBasis::Index, tx_number as f64)
        } else if let Some(duration_ms) = round.tx_duration_ms {
            (InterpolationBasis::Time, duration_ms as f64)
        } else {
            return Err(ConfigError::UnconditionedRound {
                label: round.label.clone(),
            });
        };
        if span <= 0.0 {
            return Err(ConfigError::InvalidOptions {
                controller: "linear-rate",
                reason: "the round bound must be positive".to_string(),
            });
        }

        Ok(Self {
            basis,
            starting_sleep_ms,
            gradient: (finishing_sleep_ms - starting_sleep_ms) / span,
            sleep_skip_ms: opts.sleep_skip_ms.unwrap_or(Self::DEFAULT_SLEEP_SKIP_MS),
        })
    }

    fn interpolate(&self, x: f64) -> f64 {
        self.starting_sleep_ms + x * self.gradient
    }
}

#[async_trait]
impl RateController for LinearRateController {
    fn name(&self) -> &'static str {
        "linear-rate"
    }

    async fn apply_rate_control(
        &mut self,
        start_time: u64,
        submitted: u64,
        _results: &[TxStatus],
        _stats: &SharedTxStats,
    ) -> Result<()> {
        let x = match self.basis {
            InterpolationBasis::Index => submitted as f64,
            InterpolationBasis::Time => {
                utils::current_timestamp_ms().saturating_sub(start_time) as f64
            }
        };

        let delay = self.interpolate(x);
        if delay > self.sleep_skip_ms {
            pace(delay).await;
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkloadSpec;

    fn round(tx_number: Option<u64>, tx_duration_ms: Option<u64>, total_workers: u64) -> RoundSpec {
        RoundSpec {
            label: "ramp".to_string(),
            round_index: 0,
            tx_number,
            tx_duration_ms,
            rate: RateSpec::new("linear-rate", serde_json::Value::Null),
            trim: None,
            workload: WorkloadSpec {
                module: "noop".to_string(),
                arguments: serde_json::Value::Null,
            },
            total_workers,
            worker_args: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_index_based_interpolation() {
        let controller = LinearRateController {
            basis: InterpolationBasis::Index,
            starting_sleep_ms: 3.0,
            gradient: 2.0,
            sleep_skip_ms: 5.0,
        };
        assert_eq!(controller.interpolate(5.0), 13.0);
    }

    #[test]
    fn test_time_based_interpolation_at_round_start() {
        let controller = LinearRateController {
            basis: InterpolationBasis::Time,
            starting_sleep_ms: 3.0,
            gradient: 2.0,
            sleep_skip_ms: 5.0,
        };
        assert_eq!(controller.interpolate(0.0), 3.0);
    }

    #[test]
    fn test_build_derives_gradient_from_round_bound() {
        let spec = RateSpec::new(
            "linear-rate",
            serde_json::json!({ "starting_tps": 200, "finishing_tps": 400 }),
        );

        // 2 workers: 100 -> 200 tps per worker, 10 ms -> 5 ms sleeps over
        // a 100-transaction share.
        let controller = LinearRateController::build(&spec, &round(Some(100), None, 2)).unwrap();
        assert_eq!(controller.basis, InterpolationBasis::Index);
        assert_eq!(controller.starting_sleep_ms, 10.0);
        assert_eq!(controller.gradient, -0.05);
        assert_eq!(controller.interpolate(100.0), 5.0);
    }

    #[test]
    fn test_duration_round_uses_time_basis() {
        let spec = RateSpec::new(
            "linear-rate",
            serde_json::json!({ "starting_tps": 100, "finishing_tps": 100 }),
        );
        let controller =
            LinearRateController::build(&spec, &round(None, Some(5_000), 1)).unwrap();
        assert_eq!(controller.basis, InterpolationBasis::Time);
        assert_eq!(controller.gradient, 0.0);
    }

    #[test]
    fn test_missing_endpoints_rejected() {
        let spec = RateSpec::new("linear-rate", serde_json::json!({ "starting_tps": 10 }));
        let err = LinearRateController::build(&spec, &round(Some(10), None, 1)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions { controller: "linear-rate", .. }));
    }

    #[test]
    fn test_unbounded_round_rejected() {
        let spec = RateSpec::new(
            "linear-rate",
            serde_json::json!({ "starting_tps": 10, "finishing_tps": 20 }),
        );
        let err = LinearRateController::build(&spec, &round(None, None, 1)).unwrap_err();
        assert!(matches!(err, ConfigError::UnconditionedRound { .. }));
    }
}
