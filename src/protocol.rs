//! Coordination protocol message definitions
//!
//! Every exchange between the manager and its workers travels as an
//! [`Envelope`]: an addressed, timestamped wrapper around one
//! [`MessageBody`] variant. Envelopes are immutable once constructed;
//! routing them to the right worker is the messaging transport's job, the
//! protocol only names sender and recipients.
//!
//! The body enum doubles as the dispatch table contract: the manager and
//! worker each match on it exhaustively, so adding a phase means the
//! compiler walks both sides through the change.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stats::{LatencyDigest, TxStatsCollector};

/// Addressing of an envelope: either every connected peer or an explicit
/// list of transport addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipients {
    All,
    Addresses(Vec<String>),
}

impl Recipients {
    /// Address a single recipient.
    pub fn one(address: impl Into<String>) -> Self {
        Recipients::Addresses(vec![address.into()])
    }

    /// Whether an envelope with this addressing should be delivered to
    /// `address`.
    pub fn includes(&self, address: &str) -> bool {
        match self {
            Recipients::All => true,
            Recipients::Addresses(list) => list.iter().any(|a| a == address),
        }
    }
}

/// Rate-controller selection inside a round specification: a registry key
/// plus controller-specific options passed through uninterpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub opts: serde_json::Value,
}

impl RateSpec {
    pub fn new(kind: impl Into<String>, opts: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            opts,
        }
    }
}

/// Warm-up exclusion policy for a round's reported statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimSpec {
    /// Discard the first N results.
    Count(u64),
    /// Discard all results finished within the first T milliseconds.
    DurationMs(u64),
}

/// Workload-module selection: a registry key plus user arguments handed to
/// the module's initialize hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub module: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// One round of load generation, as delivered to a single worker.
///
/// The manager tailors the shared round definition per worker before
/// sending: `tx_number` and a count-based trim are already floor-divided
/// into this worker's share, `worker_args` holds this worker's prepared
/// arguments, and `total_workers` lets rate controllers derive per-worker
/// targets. Exactly one of `tx_number` / `tx_duration_ms` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSpec {
    pub label: String,
    pub round_index: u64,
    #[serde(default)]
    pub tx_number: Option<u64>,
    #[serde(default)]
    pub tx_duration_ms: Option<u64>,
    pub rate: RateSpec,
    #[serde(default)]
    pub trim: Option<TrimSpec>,
    pub workload: WorkloadSpec,
    pub total_workers: u64,
    #[serde(default)]
    pub worker_args: serde_json::Value,
}

impl RoundSpec {
    /// Whether the round is bounded by a transaction count rather than a
    /// duration.
    pub fn is_count_bounded(&self) -> bool {
        self.tx_number.is_some()
    }
}

/// Periodic progress payload: what happened since the previous update.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProgressDelta {
    pub submitted: u64,
    pub successful: u64,
    pub failed: u64,
}

/// The protocol vocabulary. Direction and ordering rules are enforced by
/// the manager-side orchestrator and the worker-side dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    /// manager -> all: poll for workers that have not yet connected
    Register,
    /// worker -> manager: announce presence
    Connected,
    /// manager -> worker: assign the stable numeric worker index
    AssignId { worker_index: u64 },
    /// worker -> manager: ack of index assignment
    Assigned,
    /// manager -> all: request connector initialization
    Initialize,
    /// worker -> manager: ack of readiness
    Ready,
    /// manager -> worker: request round preparation
    Prepare { round: RoundSpec },
    /// worker -> manager: ack or failure of preparation
    Prepared,
    /// manager -> worker: request round execution
    Test { round: RoundSpec },
    /// worker -> manager: the worker's merged statistics for the round,
    /// plus its compacted latency distribution
    TestResult {
        stats: TxStatsCollector,
        latencies: LatencyDigest,
    },
    /// worker -> manager: periodic progress delta
    TxUpdate { progress: ProgressDelta },
    /// worker -> manager: final snapshot, resets the progress tally
    TxReset { stats: TxStatsCollector },
    /// manager -> all: shutdown request
    Exit,
}

impl MessageBody {
    /// Short lowercase name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            MessageBody::Register => "register",
            MessageBody::Connected => "connected",
            MessageBody::AssignId { .. } => "assign_id",
            MessageBody::Assigned => "assigned",
            MessageBody::Initialize => "initialize",
            MessageBody::Ready => "ready",
            MessageBody::Prepare { .. } => "prepare",
            MessageBody::Prepared => "prepared",
            MessageBody::Test { .. } => "test",
            MessageBody::TestResult { .. } => "test_result",
            MessageBody::TxUpdate { .. } => "tx_update",
            MessageBody::TxReset { .. } => "tx_reset",
            MessageBody::Exit => "exit",
        }
    }
}

/// Addressed protocol message. Construct once, never mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Recipients,
    pub body: MessageBody,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, recipients: Recipients, body: MessageBody) -> Self {
        Self {
            sender: sender.into(),
            recipients,
            body,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Envelope addressed to every connected peer.
    pub fn broadcast(sender: impl Into<String>, body: MessageBody) -> Self {
        Self::new(sender, Recipients::All, body)
    }

    /// Envelope addressed to a single peer.
    pub fn to_one(sender: impl Into<String>, recipient: impl Into<String>, body: MessageBody) -> Self {
        Self::new(sender, Recipients::one(recipient), body)
    }

    /// Attach an error string, marking the carried phase as failed.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Serialize for wire transports.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("Failed to serialize envelope")
    }

    /// Deserialize from wire transports.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).context("Failed to deserialize envelope")
    }
}
