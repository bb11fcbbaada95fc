//! Per-stream watermarks and the status snapshot exposed to operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use chaingov_core::{OrderKey, StreamKey};
use chaingov_sources::Timeliness;

/// Sequencer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Booting,
    Booted,
    Running,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Booting => write!(f, "booting"),
            Self::Booted => write!(f, "booted"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Progress of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    /// Order key of the last applied event.
    pub last: Option<OrderKey>,
    pub events: u64,
    /// Set once a product rejects an event; the stream is frozen after that.
    pub failed: Option<String>,
    /// Highest block some client has fully read this stream through, events
    /// or not. Never below what was applied.
    pub read_through: Option<u64>,
}

impl StreamState {
    /// Highest block applied on this stream.
    pub fn watermark(&self) -> Option<u64> {
        self.last.map(|k| k.block_number)
    }

    /// How far the stream is known to be complete: the read-through height
    /// or the watermark, whichever is higher.
    pub fn progress(&self) -> u64 {
        self.watermark().unwrap_or(0).max(self.read_through.unwrap_or(0))
    }
}

/// Why an item was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Failed,
    AtOrBelowBoundary,
    AlreadyApplied,
}

/// Watermarks for every dispatched stream.
#[derive(Debug, Default)]
pub struct Watermarks {
    streams: HashMap<StreamKey, StreamState>,
}

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream: &StreamKey) -> Option<&StreamState> {
        self.streams.get(stream)
    }

    pub fn watermark(&self, stream: &StreamKey) -> Option<u64> {
        self.streams.get(stream).and_then(StreamState::watermark)
    }

    /// The cursor a client planned for `streams` should resume from: the
    /// lowest progress among them. A stream that never had an event still
    /// counts as read through whatever height a finished read reached.
    pub fn resume_point(&self, streams: &[StreamKey]) -> u64 {
        streams
            .iter()
            .map(|s| self.streams.get(s).map_or(0, StreamState::progress))
            .min()
            .unwrap_or(0)
    }

    /// Record that `streams` were read through `block` with every event at
    /// or below it delivered. Only moves forward; watermarks are untouched.
    pub fn cover(&mut self, streams: &[StreamKey], block: u64) {
        for stream in streams {
            let state = self.streams.entry(stream.clone()).or_default();
            if state.read_through.map_or(true, |r| block > r) {
                state.read_through = Some(block);
            }
        }
    }

    /// Snapshot of the watermarks of `streams` at a client handoff.
    pub fn boundary(&self, streams: &[StreamKey]) -> HashMap<StreamKey, u64> {
        streams
            .iter()
            .filter_map(|s| self.watermark(s).map(|w| (s.clone(), w)))
            .collect()
    }

    /// Whether an event may be applied to `stream`.
    pub fn admit(
        &self,
        stream: &StreamKey,
        key: OrderKey,
        boundary: &HashMap<StreamKey, u64>,
    ) -> Result<(), Skip> {
        if boundary.get(stream).is_some_and(|b| key.block_number <= *b) {
            return Err(Skip::AtOrBelowBoundary);
        }
        match self.streams.get(stream) {
            Some(s) if s.failed.is_some() => Err(Skip::Failed),
            Some(s) if s.last.is_some_and(|last| key <= last) => Err(Skip::AlreadyApplied),
            _ => Ok(()),
        }
    }

    /// Record an applied event; watermarks only move forward.
    pub fn advance(&mut self, stream: &StreamKey, key: OrderKey) {
        let state = self.streams.entry(stream.clone()).or_default();
        if state.last.map_or(true, |last| key > last) {
            state.last = Some(key);
        }
        state.events += 1;
    }

    pub fn fail(&mut self, stream: &StreamKey, reason: String) {
        self.streams.entry(stream.clone()).or_default().failed = Some(reason);
    }

    pub fn failed(&self) -> Vec<&StreamKey> {
        self.streams
            .iter()
            .filter(|(_, s)| s.failed.is_some())
            .map(|(k, _)| k)
            .collect()
    }
}

// ─── Snapshot ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatus {
    pub watermark: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_through: Option<u64>,
    pub events: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatus {
    pub name: String,
    pub timeliness: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A point-in-time view of the feed. A stream whose watermark stops moving
/// while its chain advances is stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedStatus {
    pub phase: Phase,
    pub clients: Vec<ClientStatus>,
    /// Rendered stream key → progress.
    pub streams: BTreeMap<String, StreamStatus>,
    pub taken_at: DateTime<Utc>,
}

impl FeedStatus {
    pub(crate) fn build(phase: Phase, clients: Vec<ClientStatus>, planned: &[StreamKey], marks: &Watermarks) -> Self {
        let streams = planned
            .iter()
            .map(|k| {
                let state = marks.get(k).cloned().unwrap_or_default();
                (
                    k.to_string(),
                    StreamStatus {
                        watermark: state.watermark(),
                        read_through: state.read_through,
                        events: state.events,
                        failed: state.failed,
                    },
                )
            })
            .collect();
        Self { phase, clients, streams, taken_at: Utc::now() }
    }

    pub fn failed_streams(&self) -> impl Iterator<Item = (&str, &str)> {
        self.streams
            .iter()
            .filter_map(|(k, s)| s.failed.as_deref().map(|r| (k.as_str(), r)))
    }
}

pub(crate) fn client_status(name: &str, timeliness: Timeliness, valid: bool, error: Option<String>) -> ClientStatus {
    ClientStatus { name: name.to_string(), timeliness: timeliness.to_string(), valid, error }
}
