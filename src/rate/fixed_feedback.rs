//! Fixed-rate pacing with backlog and stall feedback
//!
//! Drives the same ideal schedule as the fixed-rate controller, with three
//! feedback overrides layered on top:
//!
//! 1. pacing is suspended entirely until the worker has submitted its
//!    backlog target, and again whenever the backlog falls under half the
//!    target (the SUT is keeping up, no need to slow down);
//! 2. schedule debt is computed against wall time *minus* the back-off
//!    time already served, so a stalled SUT does not turn served penalties
//!    into fresh submission credit;
//! 3. once the schedule is caught up, two escalation ladders hold the
//!    worker back: a zero-success ladder that grows while no transaction
//!    succeeds, and a backlog ladder keyed to how many multiples of the
//!    target are unfinished.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatus};
use crate::utils;

use super::{pace, parse_opts, per_worker, ConfigError, RateController};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FixedFeedbackOpts {
    tps: f64,
    transaction_load: f64,
    back_off_ms: f64,
    sleep_skip_ms: f64,
    max_zero_success_scale: u32,
    max_backlog_scale: u32,
}

impl Default for FixedFeedbackOpts {
    fn default() -> Self {
        Self {
            tps: FixedFeedbackController::DEFAULT_TPS,
            transaction_load: FixedFeedbackController::DEFAULT_TRANSACTION_LOAD,
            back_off_ms: FixedFeedbackController::DEFAULT_BACK_OFF_MS,
            sleep_skip_ms: FixedFeedbackController::DEFAULT_SLEEP_SKIP_MS,
            max_zero_success_scale: FixedFeedbackController::DEFAULT_MAX_ZERO_SUCCESS_SCALE,
            max_backlog_scale: FixedFeedbackController::DEFAULT_MAX_BACKLOG_SCALE,
        }
    }
}

/// What one pacing decision resolved to.
#[derive(Debug, Clone, Copy, PartialEq)]
enum FeedbackAction {
    Proceed,
    /// Sleep off accumulated schedule debt.
    ScheduleDebt(f64),
    /// Escalating hold while the SUT produces no successes.
    ZeroSuccessHold(f64),
    /// Escalating hold keyed to backlog depth.
    BacklogHold(f64),
}

/// Feedback-throttled fixed-rate controller.
#[derive(Debug)]
pub struct FixedFeedbackController {
    general_gap_ms: f64,
    backlog_target: f64,
    back_off_ms: f64,
    sleep_skip_ms: f64,
    max_zero_success_scale: u32,
    max_backlog_scale: u32,
    zero_success_count: u32,
    total_back_off_ms: f64,
}

impl FixedFeedbackController {
    /// Default global transactions-per-second target.
    pub const DEFAULT_TPS: f64 = 10.0;

    /// Default global unfinished-transaction target.
    pub const DEFAULT_TRANSACTION_LOAD: f64 = 10.0;

    /// Base hold served once a ladder triggers.
    pub const DEFAULT_BACK_OFF_MS: f64 = 100.0;

    /// Schedule debt at or under this threshold is ignored.
    pub const DEFAULT_SLEEP_SKIP_MS: f64 = 5.0;

    /// Upper bound on the zero-success ladder multiplier.
    pub const DEFAULT_MAX_ZERO_SUCCESS_SCALE: u32 = 30;

    /// Upper bound on the backlog ladder multiplier.
    pub const DEFAULT_MAX_BACKLOG_SCALE: u32 = 10;

    pub fn build(spec: &RateSpec, round: &RoundSpec) -> Result<Self, ConfigError> {
        let opts: FixedFeedbackOpts = parse_opts("fixed-feedback-rate", &spec.opts)?;
        if opts.tps < 0.0 || opts.transaction_load <= 0.0 || opts.back_off_ms < 0.0 {
            return Err(ConfigError::InvalidOptions {
                controller: "fixed-feedback-rate",
                reason: format!(
                    "tps must be non-negative, transaction_load positive, back_off_ms non-negative, \
                     got {}, {} and {}",
                    opts.tps, opts.transaction_load, opts.back_off_ms
                ),
            });
        }

        let worker_tps = per_worker(opts.tps, round.total_workers);
        Ok(Self {
            general_gap_ms: if worker_tps > 0.0 { 1000.0 / worker_tps } else { 0.0 },
            backlog_target: per_worker(opts.transaction_load, round.total_workers),
            back_off_ms: opts.back_off_ms,
            sleep_skip_ms: opts.sleep_skip_ms,
            max_zero_success_scale: opts.max_zero_success_scale,
            max_backlog_scale: opts.max_backlog_scale,
            zero_success_count: 0,
            total_back_off_ms: 0.0,
        })
    }

    fn decide(
        &mut self,
        start_time: u64,
        submitted: u64,
        finished: u64,
        successful: u64,
        now: u64,
    ) -> FeedbackAction {
        if self.general_gap_ms == 0.0 || (submitted as f64) < self.backlog_target {
            return FeedbackAction::Proceed;
        }

        let unfinished = submitted.saturating_sub(finished);
        if (unfinished as f64) < self.backlog_target / 2.0 {
            return FeedbackAction::Proceed;
        }

        // Time served in back-off holds does not count against the ideal
        // schedule, otherwise every hold would be repaid as a burst.
        let effective_elapsed = now as f64 - self.total_back_off_ms - start_time as f64;
        let debt = self.general_gap_ms * submitted as f64 - effective_elapsed;
        if debt > self.sleep_skip_ms {
            return FeedbackAction::ScheduleDebt(debt);
        }

        if successful == 0 {
            self.zero_success_count += 1;
        } else {
            self.zero_success_count = 0;
        }

        for scale in (1..=self.max_zero_success_scale).rev() {
            if self.zero_success_count >= scale {
                let hold = scale as f64 * self.back_off_ms;
                self.total_back_off_ms += hold;
                return FeedbackAction::ZeroSuccessHold(hold);
            }
        }

        for scale in (1..=self.max_backlog_scale).rev() {
            if unfinished as f64 >= scale as f64 * self.backlog_target {
                return FeedbackAction::BacklogHold(scale as f64 * self.back_off_ms);
            }
        }

        FeedbackAction::Proceed
    }
}

#[async_trait]
impl RateController for FixedFeedbackController {
    fn name(&self) -> &'static str {
        "fixed-feedback-rate"
    }

    async fn apply_rate_control(
        &mut self,
        start_time: u64,
        submitted: u64,
        _results: &[TxStatus],
        stats: &SharedTxStats,
    ) -> Result<()> {
        let finished = stats.total_finished();
        let successful = stats.total_successful();
        let now = utils::current_timestamp_ms();

        match self.decide(start_time, submitted, finished, successful, now) {
            FeedbackAction::Proceed => {}
            FeedbackAction::ScheduleDebt(ms)
            | FeedbackAction::ZeroSuccessHold(ms)
            | FeedbackAction::BacklogHold(ms) => pace(ms).await,
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        Ok(())
    }
}
