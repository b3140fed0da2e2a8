//! Rate controller abstraction and factory
//!
//! A rate controller decides, once per submission-loop iteration, how long
//! the worker should pause before issuing the next transaction. Controllers
//! are selected by a registry key carried in the round specification and
//! constructed per round on the worker, so every controller starts from a
//! clean slate and may keep mutable pacing state across iterations.
//!
//! All controllers translate a configured global rate into a per-worker
//! target by dividing by the round's total worker count.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatus};

pub mod composite;
pub mod fixed_feedback;
pub mod fixed_load;
pub mod fixed_rate;
pub mod linear_rate;
pub mod max_rate;
pub mod no_rate;
pub mod record_rate;
pub mod replay_rate;

pub use composite::CompositeRateController;
pub use fixed_feedback::FixedFeedbackController;
pub use fixed_load::FixedLoadController;
pub use fixed_rate::FixedRateController;
pub use linear_rate::LinearRateController;
pub use max_rate::MaxRateController;
pub use no_rate::NoRateController;
pub use record_rate::RecordRateController;
pub use replay_rate::ReplayRateController;

/// Fatal construction-time errors. Nothing in this enum is retried: a
/// round that cannot build its controller never starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown rate controller type '{0}'")]
    UnknownController(String),

    #[error("Invalid options for the {controller} controller: {reason}")]
    InvalidOptions {
        controller: &'static str,
        reason: String,
    },

    #[error("The {controller} controller can only be applied for duration-based rounds")]
    DurationOnly { controller: &'static str },

    #[error("Round '{label}' drives neither a transaction count nor a duration")]
    UnconditionedRound { label: String },

    #[error("Rate trace '{path}' is unusable: {reason}")]
    Trace { path: String, reason: String },
}

/// Pacing strategy contract.
///
/// `apply_rate_control` suspends the calling task for zero or more time and
/// then returns; it never preempts in-flight work. `start_time` is the
/// round start in epoch milliseconds, `submitted` the number of
/// transactions this worker has issued so far, `results` the resolved
/// statuses collected so far, and `stats` the statistics feeding
/// feedback-driven variants.
#[async_trait]
pub trait RateController: Send + Sync + std::fmt::Debug {
    /// Registry key of the concrete controller, for log lines.
    fn name(&self) -> &'static str;

    async fn apply_rate_control(
        &mut self,
        start_time: u64,
        submitted: u64,
        results: &[TxStatus],
        stats: &SharedTxStats,
    ) -> Result<()>;

    /// Release any resources once the round's submission loop has exited.
    async fn end(&mut self) -> Result<()>;
}

/// Build the controller named by the round's rate specification.
///
/// `round_stats` is the round's active collector; controllers that observe
/// only a slice of the round (the composite's segments) register their
/// sub-collectors with it here.
pub fn build_controller(
    round: &RoundSpec,
    worker_index: i64,
    round_stats: &SharedTxStats,
) -> Result<Box<dyn RateController>, ConfigError> {
    build_from_spec(&round.rate, round, worker_index, round_stats)
}

pub(crate) fn build_from_spec(
    spec: &RateSpec,
    round: &RoundSpec,
    worker_index: i64,
    round_stats: &SharedTxStats,
) -> Result<Box<dyn RateController>, ConfigError> {
    match spec.kind.as_str() {
        "fixed-rate" => Ok(Box::new(FixedRateController::build(spec, round)?)),
        "fixed-load" => Ok(Box::new(FixedLoadController::build(spec, round)?)),
        "fixed-feedback-rate" => Ok(Box::new(FixedFeedbackController::build(spec, round)?)),
        "linear-rate" => Ok(Box::new(LinearRateController::build(spec, round)?)),
        "maximum-rate" => Ok(Box::new(MaxRateController::build(spec, round)?)),
        "no-rate" => Ok(Box::new(NoRateController::build(spec, round)?)),
        "composite-rate" => Ok(Box::new(CompositeRateController::build(
            spec,
            round,
            worker_index,
            round_stats,
        )?)),
        "record-rate" => Ok(Box::new(RecordRateController::build(
            spec,
            round,
            worker_index,
            round_stats,
        )?)),
        "replay-rate" => Ok(Box::new(ReplayRateController::build(spec, round, worker_index)?)),
        other => Err(ConfigError::UnknownController(other.to_string())),
    }
}

/// Deserialize a controller's option block, falling back to its defaults
/// when the round specification carries no options.
pub(crate) fn parse_opts<T>(controller: &'static str, opts: &serde_json::Value) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    if opts.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(opts.clone()).map_err(|e| ConfigError::InvalidOptions {
        controller,
        reason: e.to_string(),
    })
}

/// Divide a global target by the round's worker count.
pub(crate) fn per_worker(value: f64, total_workers: u64) -> f64 {
    value / total_workers.max(1) as f64
}

/// Suspend the caller for `delay_ms` milliseconds. Non-positive delays
/// return immediately.
pub(crate) async fn pace(delay_ms: f64) {
    if delay_ms <= 0.0 {
        return;
    }
    tokio::time::sleep(Duration::from_secs_f64(delay_ms / 1000.0)).await;
}
