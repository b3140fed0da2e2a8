//! Submission-trace recording decorator
//!
//! Wraps any other controller, lets it pace as usual, and records each
//! submission's offset from the round start in milliseconds. When the
//! round ends the trace is written to a per-worker, per-round file so a
//! later run can replay the exact submission timeline through the
//! replay controller.

use std::fs;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatus};
use crate::utils;

use super::{build_from_spec, parse_opts, ConfigError, RateController};

/// On-disk layout of a submission trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TraceFormat {
    /// One millisecond offset per line.
    #[default]
    #[serde(rename = "TEXT")]
    Text,
    /// u32 record count followed by u32 offsets, little-endian.
    #[serde(rename = "BIN_LE")]
    BinLe,
    /// u32 record count followed by u32 offsets, big-endian.
    #[serde(rename = "BIN_BE")]
    BinBe,
}

/// Substitute the round and worker index into a trace path template.
/// `<R>` expands to the round index and `<C>` to the worker index.
pub(crate) fn resolve_trace_path(template: &str, round_index: u64, worker_index: i64) -> String {
    template
        .replace("<R>", &round_index.to_string())
        .replace("<C>", &worker_index.to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RecordRateOpts {
    rate_controller: Option<RateSpec>,
    path_template: Option<String>,
    output_format: TraceFormat,
}

/// Trace-recording decorator.
#[derive(Debug)]
pub struct RecordRateController {
    delegate: Box<dyn RateController>,
    records_ms: Vec<u64>,
    path: String,
    format: TraceFormat,
}

impl RecordRateController {
    pub fn build(
        spec: &RateSpec,
        round: &RoundSpec,
        worker_index: i64,
        round_stats: &SharedTxStats,
    ) -> Result<Self, ConfigError> {
        let opts: RecordRateOpts = parse_opts("record-rate", &spec.opts)?;
        let Some(path_template) = opts.path_template else {
            return Err(ConfigError::InvalidOptions {
                controller: "record-rate",
                reason: "path_template is required".to_string(),
            });
        };
        let Some(delegate_spec) = opts.rate_controller else {
            return Err(ConfigError::InvalidOptions {
                controller: "record-rate",
                reason: "rate_controller is required".to_string(),
            });
        };

        let mut delegate_round = round.clone();
        delegate_round.rate = delegate_spec.clone();
        let delegate = build_from_spec(&delegate_spec, &delegate_round, worker_index, round_stats)?;

        Ok(Self {
            delegate,
            records_ms: Vec::new(),
            path: resolve_trace_path(&path_template, round.round_index, worker_index),
            format: opts.output_format,
        })
    }

    fn encode(&self) -> Vec<u8> {
        match self.format {
            TraceFormat::Text => {
                let mut text = String::new();
                for offset in &self.records_ms {
                    text.push_str(&offset.to_string());
                    text.push('\n');
                }
                text.into_bytes()
            }
            TraceFormat::BinLe => {
                let mut bytes = Vec::with_capacity(4 + self.records_ms.len() * 4);
                bytes.extend_from_slice(&(self.records_ms.len() as u32).to_le_bytes());
                for offset in &self.records_ms {
                    bytes.extend_from_slice(&(*offset as u32).to_le_bytes());
                }
                bytes
            }
            TraceFormat::BinBe => {
                let mut bytes = Vec::with_capacity(4 + self.records_ms.len() * 4);
                bytes.extend_from_slice(&(self.records_ms.len() as u32).to_be_bytes());
                for offset in &self.records_ms {
                    bytes.extend_from_slice(&(*offset as u32).to_be_bytes());
                }
                bytes
            }
        }
    }

    fn write_trace(&self) -> Result<()> {
        fs::write(&self.path, self.encode())
            .with_context(|| format!("Failed to write rate trace to {}", self.path))
    }
}

#[async_trait]
impl RateController for RecordRateController {
    fn name(&self) -> &'static str {
        "record-rate"
    }

    async fn apply_rate_control(
        &mut self,
        start_time: u64,
        submitted: u64,
        results: &[TxStatus],
        stats: &SharedTxStats,
    ) -> Result<()> {
        self.delegate
            .apply_rate_control(start_time, submitted, results, stats)
            .await?;
        self.records_ms
            .push(utils::current_timestamp_ms().saturating_sub(start_time));
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        self.delegate.end().await?;
        self.write_trace()?;
        info!(
            "Recorded {} submission offsets to {}",
            self.records_ms.len(),
            self.path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkloadSpec;
    use crate::stats::TxStatsCollector;

    fn round() -> RoundSpec {
        RoundSpec {
            label: "record".to_string(),
            round_index: 2,
            tx_number: Some(10),
            tx_duration_ms: None,
            rate: RateSpec::new("record-rate", serde_json::Value::Null),
            trim: None,
            workload: WorkloadSpec {
                module: "noop".to_string(),
                arguments: serde_json::Value::Null,
            },
            total_workers: 1,
            worker_args: serde_json::Value::Null,
        }
    }

    fn stats() -> SharedTxStats {
        SharedTxStats::new(TxStatsCollector::new(1, 2, "record"))
    }

    fn build_with(opts: serde_json::Value) -> Result<RecordRateController, ConfigError> {
        let spec = RateSpec::new("record-rate", opts);
        RecordRateController::build(&spec, &round(), 1, &stats())
    }

    #[test]
    fn test_path_template_substitution() {
        assert_eq!(resolve_trace_path("trace_<R>_<C>.txt", 2, 1), "trace_2_1.txt");
        assert_eq!(resolve_trace_path("plain.txt", 2, 1), "plain.txt");
    }

    #[test]
    fn test_missing_path_template_rejected() {
        let err = build_with(serde_json::json!({
            "rate_controller": { "type": "fixed-rate" }
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions { controller: "record-rate", .. }));
    }

    #[test]
    fn test_missing_delegate_rejected() {
        let err = build_with(serde_json::json!({ "path_template": "trace.txt" })).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions { controller: "record-rate", .. }));
    }

    #[test]
    fn test_text_encoding() {
        let mut controller = build_with(serde_json::json!({
            "path_template": "trace.txt",
            "rate_controller": { "type": "fixed-rate", "opts": { "tps": 0 } }
        }))
        .unwrap();
        controller.records_ms = vec![5, 9, 12];
        assert_eq!(controller.encode(), b"5\n9\n12\n".to_vec());
    }

    #[test]
    fn test_binary_encodings() {
        let mut controller = build_with(serde_json::json!({
            "path_template": "trace.bin",
            "rate_controller": { "type": "fixed-rate", "opts": { "tps": 0 } },
            "output_format": "BIN_LE"
        }))
        .unwrap();
        controller.records_ms = vec![256, 1];
        assert_eq!(
            controller.encode(),
            vec![2, 0, 0, 0, 0, 1, 0, 0, 1, 0, 0, 0]
        );

        controller.format = TraceFormat::BinBe;
        assert_eq!(
            controller.encode(),
            vec![0, 0, 0, 2, 0, 0, 1, 0, 0, 0, 0, 1]
        );
    }

    #[tokio::test]
    async fn test_records_offsets_and_writes_on_end() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir
            .path()
            .join("trace_<R>_<C>.txt")
            .to_string_lossy()
            .into_owned();

        let mut controller = build_with(serde_json::json!({
            "path_template": template,
            "rate_controller": { "type": "fixed-rate", "opts": { "tps": 0 } }
        }))
        .unwrap();

        let start = utils::current_timestamp_ms();
        let stats = stats();
        for i in 0..3 {
            controller.apply_rate_control(start, i, &[], &stats).await.unwrap();
        }
        controller.end().await.unwrap();

        let expected_path = dir.path().join("trace_2_1.txt");
        let written = std::fs::read_to_string(expected_path).unwrap();
        assert_eq!(written.lines().count(), 3);
        for line in written.lines() {
            let _: u64 = line.parse().unwrap();
        }
    }
}
