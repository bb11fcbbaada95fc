//! Postgres poller.
//!
//! Event tables are named after the signature (`vote_cast`, `transfer`, ...)
//! and carry `chain_id`, `address`, the meta columns and one column per ABI
//! field. Block headers live in `blocks`. Every column is read back as text
//! so large integers survive intact.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chaingov_codec::{Normalizer, TextRow};
use chaingov_core::config::{DatabaseConfig, DatabaseTier};
use chaingov_core::{FeedEvent, OrderKey, Signature, StreamKey};

use crate::client::{
    channel_stream, FeedClient, FeedItem, FirstSeen, ItemStream, PlanSet, Plannable, Timeliness,
    CHANNEL_DEPTH,
};
use crate::error::ClientError;

const MAX_CONNECTIONS: u32 = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Batch and range tunables.
#[derive(Debug, Clone, Copy)]
pub struct Batching {
    pub batch_size: u64,
    pub max_block: Option<u64>,
}

impl Batching {
    /// The next `(last, end]` window, or `None` once `upper` is reached.
    pub fn next_window(&self, last: u64, upper: u64) -> Option<(u64, u64)> {
        let upper = self.max_block.map_or(upper, |cap| upper.min(cap));
        if last >= upper {
            return None;
        }
        Some((last, last.saturating_add(self.batch_size.max(1)).min(upper)))
    }
}

pub struct DatabaseClient {
    name: String,
    pool: PgPool,
    normalizer: Normalizer,
    plans: PlanSet,
    batching: Batching,
    poll_interval: Duration,
    tier: DatabaseTier,
    /// Highest block every planned table has been read through. Survives
    /// across reads so quiet tables are not rescanned from the caller's
    /// cursor on every poll.
    last_seen: Arc<AtomicU64>,
}

impl DatabaseClient {
    /// Build a lazily-connecting pool; nothing touches the network until
    /// the first validity check or read.
    pub fn new(config: &DatabaseConfig, normalizer: Normalizer) -> Result<Self, ClientError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(&config.url)?;
        Ok(Self {
            name: format!("postgres:chain-{}", normalizer.chain_id),
            pool,
            plans: PlanSet::new(normalizer.chain_id),
            normalizer,
            batching: Batching { batch_size: config.batch_size, max_block: config.max_block },
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            tier: config.tier,
            last_seen: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Where a read asked to start after `after` actually starts.
    fn start_after(&self, after: u64) -> u64 {
        after.max(self.last_seen.load(Ordering::Acquire))
    }
}

impl Plannable for DatabaseClient {
    fn plan(&mut self, stream: &StreamKey) -> Result<(), ClientError> {
        self.plans.insert(stream)
    }

    fn planned(&self) -> Vec<StreamKey> {
        self.plans.keys()
    }
}

#[async_trait]
impl FeedClient for DatabaseClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeliness(&self) -> Timeliness {
        match self.tier {
            DatabaseTier::Archive => Timeliness::Archive,
            DatabaseTier::Polling => Timeliness::Polling,
        }
    }

    async fn is_valid(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!(client = %self.name, error = %e, "database validity check failed");
                false
            }
        }
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }

    async fn read(&self, after: u64) -> Result<ItemStream, ClientError> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let poller = Poller {
            pool: self.pool.clone(),
            normalizer: self.normalizer,
            queries: Query::for_plans(&self.plans),
            batching: self.batching,
            last_seen: Arc::clone(&self.last_seen),
        };
        let start = self.start_after(after);
        if start > after {
            debug!(client = %self.name, after, start, "resuming from read-through height");
        }
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = poller.run(start, &tx).await {
                warn!(client = %name, error = %e, "database read failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(channel_stream(rx))
    }
}

// ─── Queries ──────────────────────────────────────────────────────────────────

/// One planned table read.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Query {
    Blocks,
    Log { table: &'static str, address: String, signature: Signature },
}

impl Query {
    fn for_plans(plans: &PlanSet) -> Vec<Query> {
        let mut out = Vec::new();
        if plans.has_blocks() {
            out.push(Query::Blocks);
        }
        for (address, signature) in plans.logs() {
            out.push(Query::Log { table: signature.table_name(), address: address.to_string(), signature });
        }
        out
    }

    /// Rows past the watermark, as a JSON object of text values.
    fn rows_sql(&self) -> String {
        let (table, filter, next) = self.table_and_filter();
        format!(
            "SELECT (SELECT json_object_agg(e.key, e.value) FROM json_each_text(row_to_json(t)) e)::text AS row \
             FROM {table} t WHERE {filter} AND t.block_number > ${next} AND t.block_number <= ${} \
             ORDER BY t.block_number",
            next + 1
        )
    }

    fn max_sql(&self) -> String {
        let (table, filter, _) = self.table_and_filter();
        format!("SELECT MAX(t.block_number)::bigint FROM {table} t WHERE {filter}")
    }

    /// Table, stream filter and the next free placeholder index.
    fn table_and_filter(&self) -> (&'static str, &'static str, usize) {
        match self {
            Query::Blocks => ("blocks", "t.chain_id = $1", 2),
            Query::Log { table, .. } => (*table, "t.chain_id = $1 AND lower(t.address) = $2", 3),
        }
    }

    fn stream(&self, chain_id: u64) -> StreamKey {
        match self {
            Query::Blocks => StreamKey::blocks(chain_id),
            Query::Log { address, signature, .. } => StreamKey::log(chain_id, address, *signature),
        }
    }

    fn address(&self) -> Option<&str> {
        match self {
            Query::Blocks => None,
            Query::Log { address, .. } => Some(address),
        }
    }
}

/// Turn a `json_object_agg` row into a text row; nulls are dropped.
fn row_from_json(text: &str) -> Result<TextRow, serde_json::Error> {
    let map: serde_json::Map<String, Value> = serde_json::from_str(text)?;
    Ok(TextRow::from_pairs(map.into_iter().filter_map(|(k, v)| match v {
        Value::Null => None,
        Value::String(s) => Some((k, s.into_bytes())),
        other => Some((k, other.to_string().into_bytes())),
    })))
}

/// A normalized row and where it sorts in its batch.
type Entry = (OrderKey, Result<FeedEvent, ClientError>);

/// Normalize one fetched row. A row that fails becomes an `Undecodable`
/// entry for its own stream, sorted at its position, or at `fallback`
/// when even its meta columns are unreadable.
fn normalize_row(normalizer: &Normalizer, query: &Query, text: &str, fallback: OrderKey) -> Entry {
    let stream = query.stream(normalizer.chain_id);
    let cells = match row_from_json(text) {
        Ok(cells) => cells,
        Err(e) => return (fallback, Err(ClientError::undecodable(stream, None, e))),
    };
    let normalized = match query {
        Query::Blocks => normalizer.block_from_row(&cells).map(FeedEvent::Block),
        Query::Log { address, signature, .. } => {
            normalizer.log_from_row(*signature, address, &cells).map(FeedEvent::Log)
        }
    };
    match normalized {
        Ok(event) => (event.order_key(), Ok(event)),
        Err(e) => {
            let at = match query {
                Query::Blocks => cells.quantity("block_number").ok().map(OrderKey::block),
                Query::Log { .. } => cells.log_position(),
            };
            warn!(%stream, error = %e, "undecodable database row");
            (at.unwrap_or(fallback), Err(ClientError::undecodable(stream, at, e)))
        }
    }
}

// ─── Poller ───────────────────────────────────────────────────────────────────

struct Poller {
    pool: PgPool,
    normalizer: Normalizer,
    queries: Vec<Query>,
    batching: Batching,
    last_seen: Arc<AtomicU64>,
}

impl Poller {
    async fn run(&self, after: u64, tx: &mpsc::Sender<Result<FeedItem, ClientError>>) -> Result<(), ClientError> {
        let upper = self.upper_bound().await?;
        let mut last_seen = after;
        let mut seen = FirstSeen::default();
        let mut total = 0usize;

        while let Some((lo, hi)) = self.batching.next_window(last_seen, upper) {
            let mut batch = Vec::new();
            for query in &self.queries {
                batch.extend(self.fetch(query, lo, hi).await?);
            }
            batch.sort_by_key(|(key, _)| *key);
            debug!(from = lo + 1, to = hi, events = batch.len(), "database batch");

            for (_, entry) in batch {
                if tx.send(entry.map(|event| seen.item(event))).await.is_err() {
                    return Ok(());
                }
                total += 1;
            }
            last_seen = hi;
            self.last_seen.fetch_max(hi, Ordering::AcqRel);
        }
        info!(after, last_seen, events = total, "database read finished");
        Ok(())
    }

    async fn upper_bound(&self) -> Result<u64, ClientError> {
        let mut upper = 0u64;
        for query in &self.queries {
            let sql = query.max_sql();
            let mut q = sqlx::query_scalar::<_, Option<i64>>(&sql).bind(self.chain_id());
            if let Some(address) = query.address() {
                q = q.bind(address.to_string());
            }
            let max = q.fetch_one(&self.pool).await?;
            upper = upper.max(max.map_or(0, |m| u64::try_from(m).unwrap_or(0)));
        }
        Ok(upper)
    }

    async fn fetch(&self, query: &Query, lo: u64, hi: u64) -> Result<Vec<Entry>, ClientError> {
        let sql = query.rows_sql();
        let mut q = sqlx::query(&sql).bind(self.chain_id());
        if let Some(address) = query.address() {
            q = q.bind(address.to_string());
        }
        let rows = q.bind(to_i64(lo)).bind(to_i64(hi)).fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.try_get("row")?;
            out.push(normalize_row(&self.normalizer, query, &text, OrderKey::block(lo + 1)));
        }
        Ok(out)
    }

    fn chain_id(&self) -> i64 {
        to_i64(self.normalizer.chain_id)
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaingov_core::{GovernorFamily, TokenKind};

    #[test]
    fn windows_advance_and_cap() {
        let b = Batching { batch_size: 100, max_block: None };
        assert_eq!(b.next_window(0, 250), Some((0, 100)));
        assert_eq!(b.next_window(200, 250), Some((200, 250)));
        assert_eq!(b.next_window(250, 250), None);

        let capped = Batching { batch_size: 100, max_block: Some(120) };
        assert_eq!(capped.next_window(100, 250), Some((100, 120)));
        assert_eq!(capped.next_window(120, 250), None);
    }

    #[test]
    fn never_redelivers_at_or_below_watermark() {
        let b = Batching { batch_size: 10, max_block: None };
        let mut last = 5;
        let mut windows = Vec::new();
        while let Some((lo, hi)) = b.next_window(last, 30) {
            windows.push((lo, hi));
            last = hi;
        }
        assert_eq!(windows, vec![(5, 15), (15, 25), (25, 30)]);
        assert!(windows.windows(2).all(|w| w[0].1 == w[1].0));
    }

    #[test]
    fn queries_follow_plans() {
        let mut plans = PlanSet::new(10);
        plans.insert(&StreamKey::blocks(10)).unwrap();
        plans
            .insert(&StreamKey::log(10, "0xCDF27F107725988F2261CE2256BDFCDE8B382B10", Signature::VoteCast))
            .unwrap();
        let queries = Query::for_plans(&plans);
        assert_eq!(queries[0], Query::Blocks);
        assert_eq!(queries[1].address(), Some("0xcdf27f107725988f2261ce2256bdfcde8b382b10"));

        let sql = queries[1].rows_sql();
        assert!(sql.contains("FROM vote_cast t"));
        assert!(sql.contains("lower(t.address) = $2"));
        assert!(sql.contains("t.block_number > $3 AND t.block_number <= $4"));
        assert!(queries[0].rows_sql().contains("t.block_number > $2 AND t.block_number <= $3"));
        assert!(!queries[0].max_sql().contains("$2"));
    }

    fn vote_query() -> Query {
        Query::Log {
            table: "vote_cast",
            address: "0xcdf27f107725988f2261ce2256bdfcde8b382b10".to_string(),
            signature: Signature::VoteCast,
        }
    }

    #[test]
    fn bad_rows_become_undecodable_entries() {
        let n = Normalizer::new(10, GovernorFamily::Agora, TokenKind::Erc20);

        let (key, entry) = normalize_row(&n, &Query::Blocks, r#"{"block_number":"17","timestamp":"soon"}"#, OrderKey::block(11));
        assert_eq!(key, OrderKey::block(17));
        assert!(matches!(
            entry,
            Err(ClientError::Undecodable { stream, at: Some(at), .. }) if stream.is_blocks() && at == OrderKey::block(17)
        ));

        let (key, entry) = normalize_row(&n, &vote_query(), r#"{"block_number":"17","transaction_index":"x"}"#, OrderKey::block(11));
        assert_eq!(key, OrderKey::block(11));
        match entry {
            Err(ClientError::Undecodable { stream, at, .. }) => {
                assert_eq!(stream, vote_query().stream(10));
                assert_eq!(at, None);
            }
            other => panic!("expected an undecodable row, got {other:?}"),
        }

        let (_, entry) = normalize_row(&n, &vote_query(), "not json", OrderKey::block(11));
        assert!(matches!(entry, Err(ClientError::Undecodable { at: None, .. })));

        let (key, entry) = normalize_row(&n, &Query::Blocks, r#"{"block_number":"18","timestamp":"1700000000"}"#, OrderKey::block(11));
        assert_eq!(key, OrderKey::block(18));
        assert!(entry.is_ok());
    }

    #[tokio::test]
    async fn reads_resume_from_read_through_height() {
        let config = DatabaseConfig {
            url: "postgres://chaingov@localhost/chaingov".to_string(),
            batch_size: 100,
            max_block: None,
            poll_interval_ms: 10,
            tier: DatabaseTier::Polling,
        };
        let client = DatabaseClient::new(&config, Normalizer::new(10, GovernorFamily::Agora, TokenKind::Erc20)).unwrap();
        assert_eq!(client.start_after(12), 12);

        client.last_seen.fetch_max(40, Ordering::AcqRel);
        assert_eq!(client.start_after(12), 40);
        assert_eq!(client.start_after(55), 55);

        // A later, shorter window never moves it back.
        client.last_seen.fetch_max(30, Ordering::AcqRel);
        assert_eq!(client.start_after(0), 40);
    }

    #[test]
    fn json_rows_become_text_rows() {
        let row = row_from_json(
            r#"{"block_number":"17","transaction_index":"0","log_index":"2","weight":"123456789012345678901234567890","reason":null,"params":"[1,2]"}"#,
        )
        .unwrap();
        assert_eq!(row.quantity("block_number").unwrap(), 17);
        assert_eq!(row.text("weight").unwrap(), "123456789012345678901234567890");
        assert!(!row.contains("reason"));
        assert_eq!(row.text("params").unwrap(), "[1,2]");
    }
}
