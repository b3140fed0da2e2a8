use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Stampede - a distributed load generation engine that drives a worker
/// pool through configured benchmark rounds against a system under test
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Role of this process in the run
    #[clap(value_enum, default_value_t = Mode::Local)]
    pub mode: Mode,

    /// Benchmark configuration file (JSON), shared by manager and workers
    #[clap(short, long, default_value = "benchmark.json")]
    pub config: PathBuf,

    /// Number of workers (overrides the configuration file)
    #[clap(short, long)]
    pub workers: Option<u64>,

    /// TCP endpoint the manager listens on and workers connect to
    /// (overrides the configuration file)
    #[clap(short, long)]
    pub endpoint: Option<String>,

    /// Output file for the consolidated report (JSON)
    #[clap(short, long, default_value = crate::defaults::OUTPUT_FILE)]
    pub output: PathBuf,

    /// JSON file for streaming round reports during execution
    #[clap(long)]
    pub streaming_output: Option<PathBuf>,

    /// Time to wait for workers to connect and stand up
    #[clap(long, value_parser = parse_duration, default_value = "60s")]
    pub startup_timeout: Duration,

    /// Continue with later rounds when one fails
    #[clap(long, default_value_t = false)]
    pub continue_on_error: bool,

    /// Log file to write in addition to the console
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Verbose output
    #[clap(short, long, default_value_t = false)]
    pub verbose: bool,
}

/// Process roles within a benchmark run
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Coordinate the worker pool and write the report
    #[clap(name = "manager")]
    Manager,

    /// Execute rounds under manager direction
    #[clap(name = "worker")]
    Worker,

    /// Run the manager and all workers in one process
    #[clap(name = "local")]
    Local,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Manager => write!(f, "manager"),
            Mode::Worker => write!(f, "worker"),
            Mode::Local => write!(f, "local"),
        }
    }
}

/// Parse duration from string (e.g. "500ms", "10s", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}
