//! The client abstraction every source implements.

use async_trait::async_trait;
use chaingov_core::{FeedEvent, StreamKey};
use futures::Stream;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// How fresh a client's data is. The sequencer drains tiers in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Timeliness {
    /// Bulk history, read once during boot.
    Archive,
    /// Periodic catch-up, re-read during run.
    Polling,
    /// Pushed as it happens.
    Realtime,
}

impl fmt::Display for Timeliness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Archive => write!(f, "archive"),
            Self::Polling => write!(f, "polling"),
            Self::Realtime => write!(f, "realtime"),
        }
    }
}

/// One normalized event as yielded by `read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub event: FeedEvent,
    pub stream_key: StreamKey,
    /// First item of this stream within the current `read`.
    pub is_first_in_stream: bool,
}

/// Items in non-decreasing order key per chain.
pub type ItemStream = Pin<Box<dyn Stream<Item = Result<FeedItem, ClientError>> + Send>>;

/// Register interest in streams before reading.
pub trait Plannable {
    /// Idempotent; must be called before `read`.
    fn plan(&mut self, stream: &StreamKey) -> Result<(), ClientError>;

    fn planned(&self) -> Vec<StreamKey>;
}

#[async_trait]
pub trait FeedClient: Plannable + Send + Sync {
    fn name(&self) -> &str;

    fn timeliness(&self) -> Timeliness;

    /// Cheap connectivity or existence check.
    async fn is_valid(&self) -> bool;

    /// Delay between re-reads for polling clients.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// Every planned event strictly after block `after`.
    async fn read(&self, after: u64) -> Result<ItemStream, ClientError>;
}

// ─── Shared helpers ───────────────────────────────────────────────────────────

/// The planned streams of a single-chain client.
#[derive(Debug, Clone, Default)]
pub struct PlanSet {
    chain_id: u64,
    streams: BTreeSet<StreamKey>,
}

impl PlanSet {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id, streams: BTreeSet::new() }
    }

    pub fn insert(&mut self, stream: &StreamKey) -> Result<(), ClientError> {
        if stream.chain_id() != self.chain_id {
            return Err(ClientError::WrongChain { expected: self.chain_id, got: stream.chain_id() });
        }
        self.streams.insert(stream.clone());
        Ok(())
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn keys(&self) -> Vec<StreamKey> {
        self.streams.iter().cloned().collect()
    }

    pub fn has_blocks(&self) -> bool {
        self.streams.iter().any(StreamKey::is_blocks)
    }

    /// Planned `(address, signature)` log streams.
    pub fn logs(&self) -> impl Iterator<Item = (&str, chaingov_core::Signature)> + '_ {
        self.streams.iter().filter_map(|k| match k {
            StreamKey::Log { address, signature, .. } => Some((address.as_str(), *signature)),
            StreamKey::Blocks { .. } => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Marks the first item seen per stream.
#[derive(Debug, Default)]
pub(crate) struct FirstSeen(HashSet<StreamKey>);

impl FirstSeen {
    pub(crate) fn item(&mut self, event: FeedEvent) -> FeedItem {
        let stream_key = event.stream_key();
        let is_first_in_stream = self.0.insert(stream_key.clone());
        FeedItem { event, stream_key, is_first_in_stream }
    }
}

/// Adapt a channel receiver into an [`ItemStream`].
pub(crate) fn channel_stream(rx: mpsc::Receiver<Result<FeedItem, ClientError>>) -> ItemStream {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Bounded channel depth between a background reader and its consumer.
pub(crate) const CHANNEL_DEPTH: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use chaingov_core::{BlockEvent, Signature};

    #[test]
    fn plan_is_idempotent_and_chain_checked() {
        let mut plans = PlanSet::new(10);
        let key = StreamKey::log(10, "0xAB", Signature::Transfer);
        plans.insert(&key).unwrap();
        plans.insert(&key).unwrap();
        plans.insert(&StreamKey::blocks(10)).unwrap();
        assert_eq!(plans.keys().len(), 2);
        assert!(plans.has_blocks());
        assert_eq!(plans.logs().collect::<Vec<_>>(), vec![("0xab", Signature::Transfer)]);
        assert!(matches!(
            plans.insert(&StreamKey::blocks(1)),
            Err(ClientError::WrongChain { expected: 10, got: 1 })
        ));
    }

    #[test]
    fn first_seen_per_stream() {
        let mut seen = FirstSeen::default();
        let block = |n| FeedEvent::Block(BlockEvent { chain_id: 1, block_number: n, timestamp: n });
        assert!(seen.item(block(1)).is_first_in_stream);
        assert!(!seen.item(block(2)).is_first_in_stream);
    }

    #[test]
    fn tiers_sort_archive_first() {
        let mut tiers = vec![Timeliness::Realtime, Timeliness::Archive, Timeliness::Polling];
        tiers.sort();
        assert_eq!(tiers, vec![Timeliness::Archive, Timeliness::Polling, Timeliness::Realtime]);
    }
}
