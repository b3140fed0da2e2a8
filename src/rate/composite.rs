//! Weighted sequencing of child rate controllers
//!
//! Splits the round's bound (count or duration) into contiguous segments
//! proportional to a weight list and delegates pacing to one child
//! controller at a time. Each child sees only its own segment: it gets a
//! dedicated sub-collector registered with the round's collector, a
//! segment-relative start time, and its sub-collector's submission count,
//! so a child behaves exactly as it would in a round of its segment's
//! size.
//!
//! Segment switches happen inside `apply_rate_control` when the cumulative
//! submitted count (or elapsed time) crosses the next boundary: the
//! outgoing child's sub-collector is deactivated and its `end()` runs,
//! then the incoming child's sub-collector is activated. The last segment
//! never switches away.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatsCollector, TxStatus};
use crate::utils;

use super::{build_from_spec, parse_opts, ConfigError, RateController};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CompositeOpts {
    weights: Vec<f64>,
    rate_controllers: Vec<RateSpec>,
}

/// Boundary at which a segment hands over to the next one.
#[derive(Debug, Clone, Copy)]
enum SegmentEnd {
    /// Cumulative submitted-count boundary (count-bounded rounds).
    AtSubmitted(u64),
    /// Cumulative elapsed-time boundary relative to round start
    /// (duration-bounded rounds).
    AtElapsedMs(u64),
    /// Final segment, runs to the end of the round.
    Never,
}

#[derive(Debug)]
struct Segment {
    controller: Box<dyn RateController>,
    stats: SharedTxStats,
    end: SegmentEnd,
}

/// Weighted multi-phase controller.
#[derive(Debug)]
pub struct CompositeRateController {
    segments: Vec<Segment>,
    active: usize,
    /// Epoch ms at which the active segment began; the round start for the
    /// first segment, the switch time for later ones.
    segment_start_ms: u64,
}

impl CompositeRateController {
    pub fn build(
        spec: &RateSpec,
        round: &RoundSpec,
        worker_index: i64,
        round_stats: &SharedTxStats,
    ) -> Result<Self, ConfigError> {
        let opts: CompositeOpts = parse_opts("composite-rate", &spec.opts)?;
        if opts.weights.is_empty() || opts.weights.len() != opts.rate_controllers.len() {
            return Err(ConfigError::InvalidOptions {
                controller: "composite-rate",
                reason: format!(
                    "weights and rate_controllers must be non-empty lists of equal length, \
                     got {} and {}",
                    opts.weights.len(),
                    opts.rate_controllers.len()
                ),
            });
        }
        if opts.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::InvalidOptions {
                controller: "composite-rate",
                reason: "weights must be non-negative numbers".to_string(),
            });
        }
        let weight_sum: f64 = opts.weights.iter().sum();
        if weight_sum <= 0.0 {
            return Err(ConfigError::InvalidOptions {
                controller: "composite-rate",
                reason: "at least one weight must be positive".to_string(),
            });
        }
        if round.tx_number.is_none() && round.tx_duration_ms.is_none() {
            return Err(ConfigError::UnconditionedRound {
                label: round.label.clone(),
            });
        }

        // Zero-weight children never get a segment.
        let weighted: Vec<(f64, &RateSpec)> = opts
            .weights
            .iter()
            .zip(opts.rate_controllers.iter())
            .filter(|(w, _)| **w > 0.0)
            .map(|(w, spec)| (*w / weight_sum, spec))
            .collect();

        let mut segments = Vec::with_capacity(weighted.len());
        let mut cumulative = 0.0;
        for (position, (weight, child_spec)) in weighted.iter().enumerate() {
            cumulative += weight;
            let is_last = position == weighted.len() - 1;

            // The child's tailored round covers just its segment, so its
            // own per-round math (ramps, schedules) spans the segment.
            let mut child_round = round.clone();
            let end = if let Some(tx_number) = round.tx_number {
                child_round.tx_number = Some((tx_number as f64 * weight).floor() as u64);
                if is_last {
                    SegmentEnd::Never
                } else {
                    SegmentEnd::AtSubmitted((tx_number as f64 * cumulative).floor() as u64)
                }
            } else {
                let duration_ms = round.tx_duration_ms.unwrap_or(0);
                child_round.tx_duration_ms = Some((duration_ms as f64 * weight).floor() as u64);
                if is_last {
                    SegmentEnd::Never
                } else {
                    SegmentEnd::AtElapsedMs((duration_ms as f64 * cumulative).floor() as u64)
                }
            };
            child_round.rate = (*child_spec).clone();

            let stats = SharedTxStats::new(TxStatsCollector::new(
                worker_index,
                round.round_index as i64,
                round.label.clone(),
            ));
            round_stats.add_sub_collector(stats.clone());

            let controller = build_from_spec(child_spec, &child_round, worker_index, &stats)?;
            segments.push(Segment {
                controller,
                stats,
                end,
            });
        }

        // The first segment observes the round from the very beginning.
        segments[0].stats.activate();

        Ok(Self {
            segments,
            active: 0,
            segment_start_ms: 0,
        })
    }

    fn boundary_crossed(&self, submitted: u64, start_time: u64, now: u64) -> bool {
        match self.segments[self.active].end {
            SegmentEnd::AtSubmitted(boundary) => submitted >= boundary,
            SegmentEnd::AtElapsedMs(boundary) => now.saturating_sub(start_time) >= boundary,
            SegmentEnd::Never => false,
        }
    }

    async fn maybe_switch(&mut self, submitted: u64, start_time: u64, now: u64) {
        while self.boundary_crossed(submitted, start_time, now) {
            let outgoing = &mut self.segments[self.active];
            outgoing.stats.deactivate();
            if let Err(e) = outgoing.controller.end().await {
                warn!(
                    "Rate controller {} failed to wind down on segment switch: {:#}",
                    outgoing.controller.name(),
                    e
                );
            }

            self.active += 1;
            self.segments[self.active].stats.activate();
            self.segment_start_ms = now;
            debug!(
                "Switched to rate segment {} ({})",
                self.active,
                self.segments[self.active].controller.name()
            );
        }
    }
}

#[async_trait]
impl RateController for CompositeRateController {
    fn name(&self) -> &'static str {
        "composite-rate"
    }

    async fn apply_rate_control(
        &mut self,
        start_time: u64,
        submitted: u64,
        results: &[TxStatus],
        _stats: &SharedTxStats,
    ) -> Result<()> {
        if self.segment_start_ms == 0 {
            self.segment_start_ms = start_time;
        }

        let now = utils::current_timestamp_ms();
        self.maybe_switch(submitted, start_time, now).await;

        let segment_start = self.segment_start_ms;
        let segment = &mut self.segments[self.active];
        let segment_stats = segment.stats.clone();
        let segment_submitted = segment_stats.total_submitted();
        segment
            .controller
            .apply_rate_control(segment_start, segment_submitted, results, &segment_stats)
            .await
    }

    async fn end(&mut self) -> Result<()> {
        let segment = &mut self.segments[self.active];
        segment.stats.deactivate();
        segment.controller.end().await
    }
}
