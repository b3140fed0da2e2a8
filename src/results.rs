use crate::stats::{LatencyDigest, TxStatsCollector};
use crate::utils;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Pool-wide outcome of one benchmark round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundReport {
    pub label: String,
    pub round_index: i64,
    /// Wall time between the earliest activation and the latest
    /// deactivation across the pool, in milliseconds.
    pub duration_ms: u64,
    pub total_submitted: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    /// Finished transactions per second over the submission window.
    pub send_rate_tps: f64,
    /// Finished transactions per second from first submission to last
    /// resolution.
    pub throughput_tps: f64,
    pub latency: LatencySummary,
    /// Compacted distribution the percentiles were read from, kept for
    /// offline aggregation across runs.
    pub latencies: LatencyDigest,
}

/// Latency figures for the successful transactions of a round. All fields
/// stay `None` when the round produced no successful transactions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySummary {
    pub min_ms: Option<u64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
    pub p50_ms: Option<u64>,
    pub p90_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

impl RoundReport {
    /// Build the report for one round from the merged worker statistics
    /// and the merged latency distribution.
    pub fn new(stats: &TxStatsCollector, latencies: LatencyDigest) -> Result<Self> {
        let finished = stats.total_finished();
        let send_window_ms = stats
            .last_create_time()
            .saturating_sub(stats.first_create_time());
        let finish_window_ms = stats
            .last_finish_time()
            .saturating_sub(stats.first_create_time());

        let mut latency = LatencySummary::default();
        if stats.total_successful() > 0 {
            let aggregate = stats.successful_latency();
            latency.min_ms = Some(aggregate.min_ms);
            latency.avg_ms = Some(stats.avg_successful_latency_ms());
            latency.max_ms = Some(aggregate.max_ms);
        }
        if !latencies.is_empty() {
            let histogram = latencies.to_histogram()?;
            latency.p50_ms = Some(histogram.value_at_percentile(50.0));
            latency.p90_ms = Some(histogram.value_at_percentile(90.0));
            latency.p95_ms = Some(histogram.value_at_percentile(95.0));
            latency.p99_ms = Some(histogram.value_at_percentile(99.0));
        }

        Ok(Self {
            label: stats.round_label().to_string(),
            round_index: stats.round_index(),
            duration_ms: stats
                .round_finish_time()
                .saturating_sub(stats.round_start_time()),
            total_submitted: stats.total_submitted(),
            total_successful: stats.total_successful(),
            total_failed: stats.total_failed(),
            send_rate_tps: rate_per_second(finished, send_window_ms),
            throughput_tps: rate_per_second(finished, finish_window_ms),
            latency,
            latencies,
        })
    }
}

/// Transactions per second over a window. A degenerate window reports the
/// bare count, matching a single burst resolved within one millisecond.
fn rate_per_second(count: u64, window_ms: u64) -> f64 {
    if window_ms == 0 {
        count as f64
    } else {
        count as f64 / (window_ms as f64 / 1000.0)
    }
}

impl fmt::Display for RoundReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |value: Option<u64>| value.map_or("-".to_string(), |v| v.to_string());
        let avg = self
            .latency
            .avg_ms
            .map_or("-".to_string(), |v| format!("{:.1}", v));

        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Round {} '{}' finished", self.round_index, self.label)?;
        writeln!(
            f,
            "  Duration:           {:.1} s",
            self.duration_ms as f64 / 1000.0
        )?;
        writeln!(f, "  Submitted:          {}", self.total_submitted)?;
        writeln!(f, "  Successful:         {}", self.total_successful)?;
        writeln!(f, "  Failed:             {}", self.total_failed)?;
        writeln!(f, "  Send Rate:          {:.1} tps", self.send_rate_tps)?;
        writeln!(f, "  Throughput:         {:.1} tps", self.throughput_tps)?;
        writeln!(
            f,
            "  Latency:            min {} ms / avg {} ms / max {} ms",
            ms(self.latency.min_ms),
            avg,
            ms(self.latency.max_ms)
        )?;
        writeln!(
            f,
            "  Percentiles:        p50 {} ms / p90 {} ms / p95 {} ms / p99 {} ms",
            ms(self.latency.p50_ms),
            ms(self.latency.p90_ms),
            ms(self.latency.p95_ms),
            ms(self.latency.p99_ms)
        )?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Consolidated report for a whole benchmark run.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub metadata: RunMetadata,
    pub rounds: Vec<RoundReport>,
    pub summary: RunSummary,
}

/// Run metadata for reproducibility.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub test_name: String,
    pub description: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_rounds: usize,
    pub system_info: SystemInfo,
}

/// Aggregates across all rounds of a run.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_submitted: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    pub best_throughput_round: Option<String>,
    pub lowest_latency_round: Option<String>,
}

/// Host details captured alongside the results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub memory_gb: f64,
    pub rust_version: String,
    pub engine_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            memory_gb: utils::detect_memory_gb(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            engine_version: crate::VERSION.to_string(),
        }
    }
}

/// Collects round reports during a run and writes the consolidated report
/// when the run ends.
pub struct ReportManager {
    output_file: PathBuf,
    streaming_file: Option<PathBuf>,
    test_name: String,
    description: String,
    rounds: Vec<RoundReport>,
}

impl ReportManager {
    pub fn new(
        test_name: impl Into<String>,
        description: impl Into<String>,
        output_file: &Path,
    ) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
            streaming_file: None,
            test_name: test_name.into(),
            description: description.into(),
            rounds: Vec::new(),
        }
    }

    /// Enable streaming round reports to a file during the run. The file
    /// holds a JSON array that grows by one element per finished round.
    pub fn enable_streaming<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        writeln!(file, "[")?;

        debug!("Streaming round reports to {:?}", path);
        self.streaming_file = Some(path);
        Ok(())
    }

    /// Record a finished round.
    pub fn add_round(&mut self, report: RoundReport) -> Result<()> {
        info!(
            "Recorded results for round {} '{}'",
            report.round_index, report.label
        );
        self.stream_round(&report)?;
        self.rounds.push(report);
        Ok(())
    }

    pub fn rounds(&self) -> &[RoundReport] {
        &self.rounds
    }

    fn stream_round(&self, report: &RoundReport) -> Result<()> {
        let Some(ref path) = self.streaming_file else {
            return Ok(());
        };

        let mut file = OpenOptions::new().append(true).open(path)?;
        if !self.rounds.is_empty() {
            writeln!(file, ",")?;
        }
        write!(file, "{}", serde_json::to_string_pretty(report)?)?;
        file.flush()?;
        Ok(())
    }

    /// Close the streaming file and write the consolidated run report to
    /// the output file as pretty-printed JSON.
    pub fn finalize(&self) -> Result<()> {
        if let Some(ref path) = self.streaming_file {
            let mut file = OpenOptions::new().append(true).open(path)?;
            writeln!(file, "\n]")?;
            file.flush()?;
        }

        let report = self.assemble();
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("Failed to write the report to {:?}", self.output_file))?;

        info!("Report written to {:?}", self.output_file);
        Ok(())
    }

    /// Assemble the run report from the rounds recorded so far.
    pub fn assemble(&self) -> RunReport {
        RunReport {
            metadata: RunMetadata {
                test_name: self.test_name.clone(),
                description: self.description.clone(),
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                total_rounds: self.rounds.len(),
                system_info: SystemInfo::default(),
            },
            rounds: self.rounds.clone(),
            summary: self.summarize(),
        }
    }

    fn summarize(&self) -> RunSummary {
        let best_throughput_round = self
            .rounds
            .iter()
            .max_by(|a, b| a.throughput_tps.total_cmp(&b.throughput_tps))
            .map(|round| round.label.clone());
        let lowest_latency_round = self
            .rounds
            .iter()
            .filter_map(|round| round.latency.avg_ms.map(|avg| (round, avg)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(round, _)| round.label.clone());

        RunSummary {
            total_submitted: self.rounds.iter().map(|r| r.total_submitted).sum(),
            total_successful: self.rounds.iter().map(|r| r.total_successful).sum(),
            total_failed: self.rounds.iter().map(|r| r.total_failed).sum(),
            best_throughput_round,
            lowest_latency_round,
        }
    }
}
