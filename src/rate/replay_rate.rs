//! Submission-trace replay
//!
//! Loads a trace written by the record controller and holds each
//! submission until its recorded offset from the round start. Once the
//! trace is exhausted the controller falls back to a fixed sleep and warns
//! once, so a round longer than its trace degrades gracefully instead of
//! bursting.

use std::fs;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::protocol::{RateSpec, RoundSpec};
use crate::stats::{SharedTxStats, TxStatus};
use crate::utils;

use super::record_rate::{resolve_trace_path, TraceFormat};
use super::{pace, parse_opts, ConfigError, RateController};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ReplayRateOpts {
    path_template: Option<String>,
    input_format: TraceFormat,
    default_sleep_ms: f64,
    sleep_skip_ms: f64,
}

impl Default for ReplayRateOpts {
    fn default() -> Self {
        Self {
            path_template: None,
            input_format: TraceFormat::Text,
            default_sleep_ms: ReplayRateController::DEFAULT_SLEEP_MS,
            sleep_skip_ms: ReplayRateController::DEFAULT_SLEEP_SKIP_MS,
        }
    }
}

/// Trace-driven controller.
#[derive(Debug)]
pub struct ReplayRateController {
    records_ms: Vec<u64>,
    default_sleep_ms: f64,
    sleep_skip_ms: f64,
    warned_exhausted: bool,
}

impl ReplayRateController {
    /// Sleep served per submission once the trace runs out.
    pub const DEFAULT_SLEEP_MS: f64 = 100.0;

    /// Replay delays at or under this threshold are skipped.
    pub const DEFAULT_SLEEP_SKIP_MS: f64 = 5.0;

    pub fn build(
        spec: &RateSpec,
        round: &RoundSpec,
        worker_index: i64,
    ) -> Result<Self, ConfigError> {
        let opts: ReplayRateOpts = parse_opts("replay-rate", &spec.opts)?;
        let Some(path_template) = opts.path_template else {
            return Err(ConfigError::InvalidOptions {
                controller: "replay-rate",
                reason: "path_template is required".to_string(),
            });
        };

        let path = resolve_trace_path(&path_template, round.round_index, worker_index);
        let raw = fs::read(&path).map_err(|e| ConfigError::Trace {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let records_ms = Self::decode(&raw, opts.input_format).map_err(|reason| {
            ConfigError::Trace {
                path: path.clone(),
                reason,
            }
        })?;

        Ok(Self {
            records_ms,
            default_sleep_ms: opts.default_sleep_ms,
            sleep_skip_ms: opts.sleep_skip_ms,
            warned_exhausted: false,
        })
    }

    fn decode(raw: &[u8], format: TraceFormat) -> Result<Vec<u64>, String> {
        match format {
            TraceFormat::Text => {
                let text =
                    std::str::from_utf8(raw).map_err(|e| format!("not valid UTF-8: {}", e))?;
                let mut records = Vec::new();
                for (number, line) in text.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let offset: u64 = line
                        .parse()
                        .map_err(|e| format!("line {}: {}", number + 1, e))?;
                    records.push(offset);
                }
                Ok(records)
            }
            TraceFormat::BinLe => Self::decode_binary(raw, u32::from_le_bytes),
            TraceFormat::BinBe => Self::decode_binary(raw, u32::from_be_bytes),
        }
    }

    fn decode_binary(raw: &[u8], word: fn([u8; 4]) -> u32) -> Result<Vec<u64>, String> {
        if raw.len() < 4 {
            return Err("truncated header".to_string());
        }
        let mut header = [0u8; 4];
        header.copy_from_slice(&raw[0..4]);
        let count = word(header) as usize;

        let body = &raw[4..];
        if body.len() != count * 4 {
            return Err(format!(
                "expected {} records ({} bytes), found {} bytes",
                count,
                count * 4,
                body.len()
            ));
        }

        let mut records = Vec::with_capacity(count);
        for chunk in body.chunks_exact(4) {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(chunk);
            records.push(word(bytes) as u64);
        }
        Ok(records)
    }

    /// Number of submissions covered by the loaded trace.
    pub fn trace_len(&self) -> usize {
        self.records_ms.len()
    }
}

#[async_trait]
impl RateController for ReplayRateController {
    fn name(&self) -> &'static str {
        "replay-rate"
    }

    async fn apply_rate_control(
        &mut self,
        start_time: u64,
        submitted: u64,
        _results: &[TxStatus],
        _stats: &SharedTxStats,
    ) -> Result<()> {
        match self.records_ms.get(submitted as usize) {
            Some(offset) => {
                let scheduled = start_time as f64 + *offset as f64;
                let delay = scheduled - utils::current_timestamp_ms() as f64;
                if delay > self.sleep_skip_ms {
                    pace(delay).await;
                }
            }
            None => {
                if !self.warned_exhausted {
                    self.warned_exhausted = true;
                    warn!(
                        "Rate trace exhausted after {} submissions, falling back to {} ms sleeps",
                        self.records_ms.len(),
                        self.default_sleep_ms
                    );
                }
                pace(self.default_sleep_ms).await;
            }
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
    use crate::stats::TxStatsCollector;
    use std::io::Write;

    fn round() -> RoundSpec {
        RoundSpec {
            label: "replay".to_string(),
            round_index: 0,
            tx_number: Some(10),
            tx_duration_ms: None,
            rate: RateSpec::new("replay-rate", serde_json::Value::Null),
            trim: None,
            workload: WorkloadSpec {
                module: "noop".to_string(),
                arguments: serde_json::Value::Null,
            },
            total_workers: 1,
            worker_args: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_text_trace_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "100").unwrap();
        writeln!(file, "200").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "350").unwrap();
        file.flush().unwrap();

        let spec = RateSpec::new(
            "replay-rate",
            serde_json::json!({ "path_template": file.path().to_string_lossy() }),
        );
        let controller = ReplayRateController::build(&spec, &round(), 0).unwrap();
        assert_eq!(controller.records_ms, vec![100, 200, 350]);
    }

    #[test]
    fn test_binary_trace_round_trip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        for offset in [10u32, 25, 40] {
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        let records = ReplayRateController::decode(&bytes, TraceFormat::BinLe).unwrap();
        assert_eq!(records, vec![10, 25, 40]);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        for offset in [7u32, 300] {
            bytes.extend_from_slice(&offset.to_be_bytes());
        }
        let records = ReplayRateController::decode(&bytes, TraceFormat::BinBe).unwrap();
        assert_eq!(records, vec![7, 300]);
    }

    #[test]
    fn test_truncated_binary_trace_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        let err = ReplayRateController::decode(&bytes, TraceFormat::BinLe).unwrap_err();
        assert!(err.contains("expected 5 records"));
    }

    #[test]
    fn test_missing_trace_file_rejected() {
        let spec = RateSpec::new(
            "replay-rate",
            serde_json::json!({ "path_template": "/nonexistent/trace_<R>_<C>.txt" }),
        );
        let err = ReplayRateController::build(&spec, &round(), 0).unwrap_err();
        assert!(matches!(err, ConfigError::Trace { .. }));
    }

    #[test]
    fn test_missing_path_template_rejected() {
        let spec = RateSpec::new("replay-rate", serde_json::json!({ "input_format": "TEXT" }));
        let err = ReplayRateController::build(&spec, &round(), 0).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions { controller: "replay-rate", .. }));
    }

    #[tokio::test]
    async fn test_exhausted_trace_falls_back_to_default_sleep() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0").unwrap();
        file.flush().unwrap();

        let spec = RateSpec::new(
            "replay-rate",
            serde_json::json!({
                "path_template": file.path().to_string_lossy(),
                "default_sleep_ms": 20
            }),
        );
        let mut controller = ReplayRateController::build(&spec, &round(), 0).unwrap();
        let stats = SharedTxStats::new(TxStatsCollector::new(0, 0, "replay"));

        // Past the end of the one-record trace.
        let started = std::time::Instant::now();
        controller
            .apply_rate_control(utils::current_timestamp_ms(), 5, &[], &stats)
            .await
            .unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_millis(19));
        assert!(controller.warned_exhausted);
    }
}
