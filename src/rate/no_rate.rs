//! Unthrottled duration pass-through
//!
//! Sleeps once for the whole round duration and never paces again. The
//! submission loop crosses its time bound the moment the sleep returns, so
//! the round consists of exactly the submissions in flight while the sleep
//! runs. Only meaningful for duration-bounded rounds; a count-bounded
//! round would spin forever, so construction rejects it.

use anyhow::Result;
use async_trait::async_trait;

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatus};

use super::{pace, ConfigError, RateController};

/// One-shot full-duration sleeper.
#[derive(Debug)]
pub struct NoRateController {
    sleep_time_ms: u64,
    slept: bool,
}

impl NoRateController {
    pub fn build(_spec: &RateSpec, round: &RoundSpec) -> Result<Self, ConfigError> {
        if round.tx_number.is_some() {
            return Err(ConfigError::DurationOnly {
                controller: "no-rate",
            });
        }
        let Some(duration_ms) = round.tx_duration_ms else {
            return Err(ConfigError::UnconditionedRound {
                label: round.label.clone(),
            });
        };

        Ok(Self {
            sleep_time_ms: duration_ms,
            slept: false,
        })
    }
}

#[async_trait]
impl RateController for NoRateController {
    fn name(&self) -> &'static str {
        "no-rate"
    }

    async fn apply_rate_control(
        &mut self,
        _start_time: u64,
        _submitted: u64,
        _results: &[TxStatus],
        _stats: &SharedTxStats,
    ) -> Result<()> {
        if !self.slept {
            self.slept = true;
            pace(self.sleep_time_ms as f64).await;
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        Ok(())
    }
}
