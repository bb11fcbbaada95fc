//! Boot and run sequencing over scripted clients.

use alloy_primitives::U256;
use async_trait::async_trait;
use chaingov_core::{
    BlockEvent, FeedEvent, FieldValue, LogEvent, OrderKey, Signature, StreamKey, TokenKind, ZERO_ADDRESS,
};
use chaingov_feed::{BatchHook, DispatchTable, EventFeed, FeedError, Phase};
use chaingov_products::{share, Balances, DataProduct, Proposals};
use chaingov_sources::{
    ClientError, FeedClient, FeedItem, ItemStream, PlanSet, Plannable, Timeliness,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

// ─── Helpers ──────────────────────────────────────────────────────────────────

const CHAIN: u64 = 10;
const TOKEN: &str = "0x4200000000000000000000000000000000000042";
const GOV: &str = "0xcdf27f107725988f2261ce2256bdfcde8b382b10";

fn holder(n: u64) -> String {
    format!("0x{n:040x}")
}

fn mint(block: u64, value: u64) -> FeedEvent {
    FeedEvent::Log(
        LogEvent::new(CHAIN, TOKEN, Signature::Transfer, block, 0, 0)
            .with_field("from", FieldValue::Address(ZERO_ADDRESS.into()))
            .with_field("to", FieldValue::Address(holder(block)))
            .with_field("value", FieldValue::Uint(U256::from(value))),
    )
}

fn block(n: u64) -> FeedEvent {
    FeedEvent::Block(BlockEvent { chain_id: CHAIN, block_number: n, timestamp: 1_700_000_000 + n })
}

fn transfers() -> StreamKey {
    StreamKey::log(CHAIN, TOKEN, Signature::Transfer)
}

/// Planned but never carries an event in these tests.
fn executions() -> StreamKey {
    StreamKey::log(CHAIN, GOV, Signature::ProposalExecuted)
}

/// A client that replays a fixed list of events.
struct Scripted {
    name: String,
    tier: Timeliness,
    plans: PlanSet,
    events: Vec<FeedEvent>,
    valid: bool,
    resumable: bool,
    honor_after: bool,
    interval: Option<Duration>,
    /// Records the cursor of every read.
    reads: Arc<Mutex<Vec<u64>>>,
    /// Records the client yields as undecodable, merged in by order key.
    broken: Vec<(StreamKey, OrderKey)>,
}

impl Scripted {
    fn new(name: &str, tier: Timeliness, events: Vec<FeedEvent>) -> Self {
        Self {
            name: name.to_string(),
            tier,
            plans: PlanSet::new(CHAIN),
            events,
            valid: true,
            resumable: true,
            honor_after: true,
            interval: None,
            reads: Arc::new(Mutex::new(Vec::new())),
            broken: Vec::new(),
        }
    }

    fn with_undecodable(mut self, stream: StreamKey, at: OrderKey) -> Self {
        self.broken.push((stream, at));
        self
    }

    fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    fn not_resumable(mut self) -> Self {
        self.resumable = false;
        self
    }

    /// Replay everything regardless of the cursor.
    fn ignoring_cursor(mut self) -> Self {
        self.honor_after = false;
        self
    }

    fn polling(mut self, every: Duration) -> Self {
        self.interval = Some(every);
        self
    }

    fn reads(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.reads)
    }
}

impl Plannable for Scripted {
    fn plan(&mut self, stream: &StreamKey) -> Result<(), ClientError> {
        self.plans.insert(stream)
    }

    fn planned(&self) -> Vec<StreamKey> {
        self.plans.keys()
    }
}

#[async_trait]
impl FeedClient for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeliness(&self) -> Timeliness {
        self.tier
    }

    async fn is_valid(&self) -> bool {
        self.valid
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.interval
    }

    async fn read(&self, after: u64) -> Result<ItemStream, ClientError> {
        self.reads.lock().unwrap().push(after);
        if !self.resumable && after > 0 {
            return Err(ClientError::UnsupportedCursor { client: self.name.clone(), after });
        }
        let planned = self.plans.keys();
        let mut seen = HashSet::new();
        let mut items: Vec<(OrderKey, Result<FeedItem, ClientError>)> = self
            .events
            .iter()
            .filter(|e| !self.honor_after || e.block_number() > after)
            .filter(|e| planned.contains(&e.stream_key()))
            .map(|e| {
                let stream_key = e.stream_key();
                let is_first_in_stream = seen.insert(stream_key.clone());
                (e.order_key(), Ok(FeedItem { event: e.clone(), stream_key, is_first_in_stream }))
            })
            .collect();
        items.extend(
            self.broken
                .iter()
                .filter(|(_, at)| !self.honor_after || at.block_number > after)
                .map(|(stream, at)| {
                    let err = ClientError::Undecodable {
                        stream: stream.clone(),
                        at: Some(*at),
                        reason: "invalid meta column".to_string(),
                    };
                    (*at, Err(err))
                }),
        );
        items.sort_by_key(|(key, _)| *key);
        Ok(Box::pin(futures::stream::iter(items.into_iter().map(|(_, item)| item))))
    }
}

#[derive(Default)]
struct Counter(AtomicUsize);

impl BatchHook for Counter {
    fn after_batch(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    feed: EventFeed,
    balances: Arc<RwLock<Balances>>,
    proposals: Arc<RwLock<Proposals>>,
    hook: Arc<Counter>,
}

fn fixture() -> Fixture {
    let balances = share(Balances::new(TokenKind::Erc20));
    let proposals = share(Proposals::new(Default::default(), Default::default()));
    let mut table = DispatchTable::new();
    table.register(transfers(), balances.clone());
    table.register(StreamKey::blocks(CHAIN), proposals.clone());
    table.register(executions(), proposals.clone());

    let hook = Arc::new(Counter::default());
    let mut feed = EventFeed::new(table);
    feed.add_hook(hook.clone()).unwrap();
    Fixture { feed, balances, proposals, hook }
}

impl Fixture {
    fn supply(&self) -> U256 {
        self.balances.read().unwrap().total_supply()
    }

    fn add(&mut self, client: Scripted) {
        self.feed.add_client(Box::new(client), CHAIN).unwrap();
    }
}

// ─── Boot ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_archive_clients_apply_each_event_once() {
    let mut fx = fixture();
    fx.add(Scripted::new("csv", Timeliness::Archive, vec![mint(1, 1), mint(2, 2), mint(3, 3)]).not_resumable());
    fx.add(
        Scripted::new("rpc", Timeliness::Archive, vec![mint(2, 2), mint(3, 3), mint(4, 4)]).ignoring_cursor(),
    );

    let status = fx.feed.boot().await.unwrap();

    assert_eq!(status.phase, Phase::Booted);
    assert_eq!(fx.supply(), U256::from(10));
    assert_eq!(fx.feed.watermark(&transfers()), Some(4));
    assert_eq!(status.streams[&transfers().to_string()].events, 4);
    assert_eq!(fx.hook.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalid_client_is_skipped() {
    let mut fx = fixture();
    fx.add(Scripted::new("dead", Timeliness::Archive, vec![mint(1, 100)]).invalid());
    fx.add(Scripted::new("live", Timeliness::Archive, vec![mint(5, 7)]));

    let status = fx.feed.boot().await.unwrap();

    assert_eq!(fx.supply(), U256::from(7));
    let dead = status.clients.iter().find(|c| c.name == "dead").unwrap();
    assert!(!dead.valid);
    assert!(status.clients.iter().any(|c| c.name == "live" && c.valid));
}

#[tokio::test]
async fn product_error_freezes_only_its_stream() {
    let mut fx = fixture();
    let bad = FeedEvent::Log(LogEvent::new(CHAIN, TOKEN, Signature::Transfer, 2, 0, 0));
    fx.add(Scripted::new(
        "csv",
        Timeliness::Archive,
        vec![block(1), mint(1, 1), block(2), bad, block(3), mint(3, 5)],
    ));

    let status = fx.feed.boot().await.unwrap();

    assert_eq!(fx.feed.watermark(&transfers()), Some(1));
    assert_eq!(fx.feed.watermark(&StreamKey::blocks(CHAIN)), Some(3));
    assert_eq!(fx.supply(), U256::from(1));
    assert_eq!(fx.proposals.read().unwrap().current_block(), 3);

    let failed: Vec<_> = status.failed_streams().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, transfers().to_string());
}

#[tokio::test]
async fn non_resumable_client_reads_from_the_start() {
    let mut fx = fixture();
    fx.add(Scripted::new("db", Timeliness::Archive, vec![block(1), mint(1, 1), block(2), mint(2, 2)]));
    let csv = Scripted::new(
        "csv",
        Timeliness::Archive,
        (1..=4).flat_map(|n| [block(n), mint(n, n)]).collect(),
    )
    .not_resumable();
    let reads = csv.reads();
    fx.add(csv);

    fx.feed.boot().await.unwrap();

    assert_eq!(reads.lock().unwrap().len(), 2);
    assert_eq!(fx.supply(), U256::from(10));
    assert_eq!(fx.feed.watermark(&StreamKey::blocks(CHAIN)), Some(4));
}

#[tokio::test]
async fn undecodable_record_fails_only_its_stream() {
    let mut fx = fixture();
    fx.add(
        Scripted::new(
            "csv",
            Timeliness::Archive,
            vec![block(1), mint(1, 1), block(2), block(3), mint(3, 5)],
        )
        .with_undecodable(transfers(), OrderKey::log(2, 0, 0)),
    );
    // Re-serves a record the blocks stream is already past; that is no failure.
    fx.add(
        Scripted::new("rpc", Timeliness::Archive, vec![block(1), block(4)])
            .with_undecodable(StreamKey::blocks(CHAIN), OrderKey::block(1))
            .ignoring_cursor(),
    );

    let status = fx.feed.boot().await.unwrap();

    assert_eq!(fx.feed.watermark(&transfers()), Some(1));
    assert_eq!(fx.supply(), U256::from(1));
    assert_eq!(fx.feed.watermark(&StreamKey::blocks(CHAIN)), Some(4));
    assert_eq!(fx.proposals.read().unwrap().current_block(), 4);

    let failed: Vec<_> = status.failed_streams().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, transfers().to_string());
    assert!(failed[0].1.contains("undecodable"));
    assert!(status.clients.iter().all(|c| c.valid && c.error.is_none()));
}

#[tokio::test]
async fn boot_twice_is_rejected() {
    let mut fx = fixture();
    fx.feed.boot().await.unwrap();
    assert!(matches!(fx.feed.boot().await, Err(FeedError::Config(_))));
    assert!(fx.feed.add_hook(Arc::new(Counter::default())).is_err());
}

// ─── Run ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn polling_client_runs_until_shutdown() {
    let mut fx = fixture();
    fx.add(Scripted::new("csv", Timeliness::Archive, vec![mint(1, 1)]));
    let poller = Scripted::new(
        "db",
        Timeliness::Polling,
        vec![block(5), mint(5, 5), block(6), mint(6, 6)],
    )
    .polling(Duration::from_millis(10));
    let reads = poller.reads();
    fx.add(poller);

    let shutdown = fx.feed.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
    });

    let status = fx.feed.run().await.unwrap();

    assert_eq!(status.phase, Phase::Stopped);
    assert!(fx.feed.shutdown_handle().is_triggered());
    assert!(reads.lock().unwrap().len() >= 2);
    assert_eq!(fx.supply(), U256::from(12));
    assert_eq!(fx.feed.watermark(&transfers()), Some(6));
    // one after the boot client, then one per live item
    assert_eq!(fx.hook.0.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn run_ends_when_every_realtime_stream_ends() {
    let mut fx = fixture();
    fx.add(Scripted::new("ws", Timeliness::Realtime, vec![block(8), mint(8, 3)]));

    let status = fx.feed.run().await.unwrap();

    assert_eq!(status.phase, Phase::Stopped);
    assert_eq!(fx.supply(), U256::from(3));
    assert_eq!(fx.proposals.read().unwrap().current_block(), 8);
}

#[tokio::test]
async fn quiet_stream_does_not_pin_the_cursor() {
    let mut fx = fixture();
    fx.add(Scripted::new(
        "csv",
        Timeliness::Archive,
        (1..=3).flat_map(|n| [block(n), mint(n, n)]).collect(),
    ));
    let poller = Scripted::new(
        "db",
        Timeliness::Polling,
        (1..=6).flat_map(|n| [block(n), mint(n, n)]).collect(),
    )
    .polling(Duration::from_millis(10));
    let reads = poller.reads();
    fx.add(poller);

    let shutdown = fx.feed.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
    });
    let status = fx.feed.run().await.unwrap();

    // Boot covered every planned stream through block 3, the first poll
    // through block 6; neither read restarts from 0.
    let afters = reads.lock().unwrap().clone();
    assert!(afters.len() >= 2, "{afters:?}");
    assert_eq!(afters[0], 3);
    assert!(afters[1..].iter().all(|a| *a == 6), "{afters:?}");

    assert_eq!(fx.supply(), U256::from(21));
    assert_eq!(fx.feed.watermark(&executions()), None);
    let quiet = &status.streams[&executions().to_string()];
    assert_eq!((quiet.events, quiet.read_through), (0, Some(6)));
}

#[tokio::test]
async fn replayed_poll_leaves_state_and_watermarks_unchanged() {
    let mut fx = fixture();
    let history: Vec<FeedEvent> = (1..=4).flat_map(|n| [block(n), mint(n, n)]).collect();
    fx.add(Scripted::new("csv", Timeliness::Archive, history.clone()));
    let poller = Scripted::new("db", Timeliness::Polling, history)
        .ignoring_cursor()
        .polling(Duration::from_millis(10));
    let reads = poller.reads();
    fx.add(poller);

    let booted = fx.feed.boot().await.unwrap();
    let balances = fx.balances.read().unwrap().clone();
    let proposals = fx.proposals.read().unwrap().clone();
    let summary = fx.balances.read().unwrap().summary();
    assert_eq!(fx.supply(), U256::from(10));

    let shutdown = fx.feed.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown.trigger();
    });
    let stopped = fx.feed.run().await.unwrap();

    assert!(reads.lock().unwrap().len() >= 2);
    assert_eq!(*fx.balances.read().unwrap(), balances);
    assert_eq!(*fx.proposals.read().unwrap(), proposals);
    assert_eq!(fx.balances.read().unwrap().summary(), summary);
    assert_eq!(fx.proposals.read().unwrap().summary(), proposals.summary());
    for stream in [transfers(), StreamKey::blocks(CHAIN)] {
        let key = stream.to_string();
        assert_eq!(stopped.streams[&key].watermark, booted.streams[&key].watermark);
        assert_eq!(stopped.streams[&key].events, booted.streams[&key].events);
    }
    assert_eq!(stopped.failed_streams().count(), 0);
}
