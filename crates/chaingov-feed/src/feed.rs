//! The event feed: boots every archive-tier client in order, then runs one
//! task per polling or realtime client.
//!
//! # Boot
//! Clients are checked once; a client failing `is_valid` is skipped for the
//! whole life of the feed. Valid archive-tier clients are drained one after
//! another, each resuming from the lowest progress among its streams.
//!
//! # Progress
//! A stream's progress is its watermark, or the height an archive or
//! polling read was known to cover when it finished, whichever is higher.
//! Quiet streams therefore never pin a client's cursor to 0. A record a
//! client could not decode fails its own stream only; the client and its
//! other streams carry on.
//!
//! # Handoff
//! Before a client starts reading, the watermarks of its streams are
//! snapshotted. Events at or below that boundary, and anything not strictly
//! after the last applied event of a stream, are dropped. This is what makes
//! archive → historical → realtime overlap safe.
//!
//! # Run
//! Starts only after boot has applied everything. Polling clients re-read
//! every poll interval; realtime clients are drained as they push. Shutdown
//! is cooperative and checked between items, never inside one.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use chaingov_core::{OrderKey, StreamKey};
use chaingov_sources::{ClientError, FeedClient, FeedItem, Timeliness};

use crate::dispatch::DispatchTable;
use crate::error::FeedError;
use crate::status::{client_status, FeedStatus, Phase, Skip, Watermarks};

/// Called after each applied batch (a drained boot client, or each live
/// item). Used for derived models that recompute lazily.
pub trait BatchHook: Send + Sync {
    fn after_batch(&self);
}

/// Requests a cooperative stop of a running feed.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

// ─── Shared core ──────────────────────────────────────────────────────────────

struct Core {
    table: DispatchTable,
    marks: Mutex<Watermarks>,
    hooks: Vec<Arc<dyn BatchHook>>,
    client_errors: Mutex<HashMap<String, String>>,
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied,
    Skipped(Skip),
    Unrouted,
    Failed,
}

/// Counters for one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub unrouted: u64,
    /// Highest block among the items read, applied or not.
    pub read_through: Option<u64>,
}

impl DrainStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Unrouted => self.unrouted += 1,
        }
    }

    fn saw(&mut self, block: u64) {
        self.read_through = Some(self.read_through.map_or(block, |b| b.max(block)));
    }
}

impl Core {
    fn marks(&self) -> std::sync::MutexGuard<'_, Watermarks> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check, dispatch and advance under one lock so two clients can never
    /// apply the same event.
    fn apply(&self, item: FeedItem, boundary: &HashMap<StreamKey, u64>) -> Outcome {
        if !self.table.contains(&item.stream_key) {
            return Outcome::Unrouted;
        }
        let key = item.event.order_key();
        let mut marks = self.marks();
        if let Err(skip) = marks.admit(&item.stream_key, key, boundary) {
            return Outcome::Skipped(skip);
        }
        if item.is_first_in_stream {
            debug!(stream = %item.stream_key, block = key.block_number, "first event on stream");
        }
        match self.table.dispatch(&item.stream_key, &item.event) {
            Ok(_) => {
                marks.advance(&item.stream_key, key);
                Outcome::Applied
            }
            Err(e) => {
                error!(
                    stream = %item.stream_key,
                    block = key.block_number,
                    error = %e,
                    "stream failed; watermark frozen"
                );
                marks.fail(&item.stream_key, e.to_string());
                Outcome::Failed
            }
        }
    }

    /// A record the client could not decode. Fails `stream` unless the
    /// record sits where the stream has already been applied.
    fn reject(
        &self,
        stream: &StreamKey,
        at: Option<OrderKey>,
        reason: &str,
        boundary: &HashMap<StreamKey, u64>,
    ) -> Outcome {
        if !self.table.contains(stream) {
            return Outcome::Unrouted;
        }
        let mut marks = self.marks();
        let admitted = match at {
            Some(key) => marks.admit(stream, key, boundary),
            None if marks.get(stream).is_some_and(|s| s.failed.is_some()) => Err(Skip::Failed),
            None => Ok(()),
        };
        if let Err(skip) = admitted {
            debug!(%stream, ?skip, "undecodable record already behind the stream");
            return Outcome::Skipped(skip);
        }
        error!(
            %stream,
            block = at.map(|k| k.block_number),
            error = %reason,
            "undecodable record; stream failed"
        );
        marks.fail(stream, format!("undecodable record: {reason}"));
        Outcome::Failed
    }

    fn after_batch(&self) {
        for hook in &self.hooks {
            hook.after_batch();
        }
    }

    fn record_error(&self, client: &str, error: String) {
        self.client_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.to_string(), error);
    }
}

/// Resolves once shutdown has been requested.
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Read `client` from its resume point and apply everything it yields.
async fn drain(
    core: &Core,
    client: &dyn FeedClient,
    shutdown: &mut watch::Receiver<bool>,
    live: bool,
) -> Result<DrainStats, FeedError> {
    let planned = client.planned();
    let (after, boundary) = {
        let marks = core.marks();
        (marks.resume_point(&planned), marks.boundary(&planned))
    };
    let name = client.name().to_string();
    let wrap = |source: ClientError| FeedError::Client { client: name.clone(), source };

    let mut stream = match client.read(after).await {
        Err(ClientError::UnsupportedCursor { .. }) => {
            debug!(client = %name, after, "client cannot resume; reading from the start");
            client.read(0).await.map_err(wrap)?
        }
        other => other.map_err(wrap)?,
    };

    let mut stats = DrainStats::default();
    loop {
        let next = tokio::select! {
            _ = wait_shutdown(shutdown) => {
                info!(client = %name, "shutdown requested; stopping between items");
                break;
            }
            next = stream.next() => next,
        };
        let Some(item) = next else {
            if client.timeliness() != Timeliness::Realtime {
                if let Some(height) = stats.read_through {
                    core.marks().cover(&planned, height);
                }
            }
            break;
        };
        let outcome = match item {
            Ok(item) => {
                stats.saw(item.event.block_number());
                core.apply(item, &boundary)
            }
            Err(ClientError::Undecodable { stream, at, reason }) => {
                if let Some(key) = at {
                    stats.saw(key.block_number);
                }
                core.reject(&stream, at, &reason, &boundary)
            }
            Err(e) => return Err(wrap(e)),
        };
        stats.record(outcome);
        if live {
            core.after_batch();
        }
    }
    Ok(stats)
}

async fn client_task(core: Arc<Core>, client: Arc<dyn FeedClient>, mut shutdown: watch::Receiver<bool>) {
    let name = client.name().to_string();
    let tier = client.timeliness();
    info!(client = %name, %tier, "client started");
    loop {
        match drain(&core, client.as_ref(), &mut shutdown, true).await {
            Ok(stats) => debug!(client = %name, ?stats, "read drained"),
            Err(e) => {
                error!(client = %name, error = %e, "client stopped");
                core.record_error(&name, e.to_string());
                return;
            }
        }
        if *shutdown.borrow() {
            break;
        }
        let interval = match (tier, client.poll_interval()) {
            (Timeliness::Polling, Some(interval)) => interval,
            _ => {
                warn!(client = %name, "stream ended");
                break;
            }
        };
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!(client = %name, "client finished");
}

// ─── EventFeed ────────────────────────────────────────────────────────────────

struct Slot {
    client: Arc<dyn FeedClient>,
    valid: Option<bool>,
}

pub struct EventFeed {
    core: Arc<Core>,
    slots: Vec<Slot>,
    phase: Phase,
    shutdown: Arc<watch::Sender<bool>>,
}

impl EventFeed {
    pub fn new(table: DispatchTable) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                table,
                marks: Mutex::new(Watermarks::new()),
                hooks: Vec::new(),
                client_errors: Mutex::new(HashMap::new()),
            }),
            slots: Vec::new(),
            phase: Phase::Idle,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Register a hook. Must be called before the feed is booted.
    pub fn add_hook(&mut self, hook: Arc<dyn BatchHook>) -> Result<(), FeedError> {
        if self.phase != Phase::Idle {
            return Err(FeedError::Config(format!("cannot add a hook to a feed that is {}", self.phase)));
        }
        Arc::get_mut(&mut self.core)
            .map(|core| core.hooks.push(hook))
            .ok_or_else(|| FeedError::Config("hooks must be added before boot".into()))
    }

    /// Plan every dispatched stream of `chain_id` on `client` and add it.
    pub fn add_client(&mut self, mut client: Box<dyn FeedClient>, chain_id: u64) -> Result<(), FeedError> {
        let streams = self.core.table.streams_for_chain(chain_id);
        if streams.is_empty() {
            warn!(client = %client.name(), chain_id, "no streams to plan");
        }
        for stream in &streams {
            client.plan(stream).map_err(|source| FeedError::Plan {
                stream: stream.to_string(),
                client: client.name().to_string(),
                source,
            })?;
        }
        debug!(client = %client.name(), streams = streams.len(), "client planned");
        self.slots.push(Slot { client: Arc::from(client), valid: None });
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn watermark(&self, stream: &StreamKey) -> Option<u64> {
        self.core.marks().watermark(stream)
    }

    pub fn status(&self) -> FeedStatus {
        let errors = self
            .core
            .client_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let clients = self
            .slots
            .iter()
            .map(|s| {
                let name = s.client.name();
                client_status(name, s.client.timeliness(), s.valid.unwrap_or(false), errors.get(name).cloned())
            })
            .collect();
        let planned: Vec<StreamKey> = self.core.table.streams().cloned().collect();
        FeedStatus::build(self.phase, clients, &planned, &self.core.marks())
    }

    /// Check every client, then drain the archive tier in order.
    pub async fn boot(&mut self) -> Result<FeedStatus, FeedError> {
        if self.phase != Phase::Idle {
            return Err(FeedError::Config(format!("cannot boot a feed that is {}", self.phase)));
        }
        self.phase = Phase::Booting;

        for slot in &mut self.slots {
            let valid = slot.client.is_valid().await;
            if !valid {
                warn!(client = %slot.client.name(), "client failed its validity check; skipped");
            }
            slot.valid = Some(valid);
        }
        self.slots.sort_by_key(|s| s.client.timeliness());

        let mut shutdown = self.shutdown.subscribe();
        for slot in &self.slots {
            if slot.valid != Some(true) || slot.client.timeliness() != Timeliness::Archive {
                continue;
            }
            if *shutdown.borrow() {
                break;
            }
            let name = slot.client.name();
            info!(client = %name, "boot read started");
            match drain(&self.core, slot.client.as_ref(), &mut shutdown, false).await {
                Ok(stats) => info!(
                    client = %name,
                    applied = stats.applied,
                    skipped = stats.skipped,
                    failed = stats.failed,
                    "boot read finished"
                ),
                Err(e) => {
                    error!(client = %name, error = %e, "boot client stopped");
                    self.core.record_error(name, e.to_string());
                }
            }
            self.core.after_batch();
        }

        self.phase = Phase::Booted;
        Ok(self.status())
    }

    /// Boot if needed, then run every live client until shutdown or until
    /// all of them have stopped.
    pub async fn run(&mut self) -> Result<FeedStatus, FeedError> {
        if self.phase == Phase::Idle {
            self.boot().await?;
        }
        if self.phase != Phase::Booted {
            return Err(FeedError::Config(format!("cannot run a feed that is {}", self.phase)));
        }
        self.phase = Phase::Running;

        let mut tasks = JoinSet::new();
        for slot in &self.slots {
            if slot.valid != Some(true) || slot.client.timeliness() == Timeliness::Archive {
                continue;
            }
            tasks.spawn(client_task(
                Arc::clone(&self.core),
                Arc::clone(&slot.client),
                self.shutdown.subscribe(),
            ));
        }
        if tasks.is_empty() {
            info!("no live clients; nothing to run");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "client task panicked");
                return Err(FeedError::Task(e.to_string()));
            }
        }

        self.phase = Phase::Stopped;
        Ok(self.status())
    }
}
