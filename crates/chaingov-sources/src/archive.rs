//! Flat-file archive reader.
//!
//! Layout, one CSV with a header row per stream:
//!
//! ```text
//! <dir>/<chain_id>/blocks.csv
//! <dir>/<chain_id>/<address>/<Signature>.csv
//! ```
//!
//! Files are append-only and sorted, so a read always restates from the
//! start and merges the planned files by order key.

use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chaingov_codec::{Normalizer, TextRow};
use chaingov_core::{FeedEvent, OrderKey, Signature, StreamKey};

use crate::client::{
    channel_stream, FeedClient, FeedItem, FirstSeen, ItemStream, PlanSet, Plannable, Timeliness,
    CHANNEL_DEPTH,
};
use crate::error::ClientError;

pub struct ArchiveClient {
    name: String,
    dir: PathBuf,
    normalizer: Normalizer,
    plans: PlanSet,
}

impl ArchiveClient {
    pub fn new(dir: impl Into<PathBuf>, normalizer: Normalizer) -> Self {
        let dir = dir.into();
        Self {
            name: format!("archive:{}", dir.display()),
            plans: PlanSet::new(normalizer.chain_id),
            dir,
            normalizer,
        }
    }

    fn chain_dir(&self) -> PathBuf {
        self.dir.join(self.normalizer.chain_id.to_string())
    }

    /// Path of the file backing `stream`.
    pub fn path_for(&self, stream: &StreamKey) -> PathBuf {
        match stream {
            StreamKey::Blocks { .. } => self.chain_dir().join("blocks.csv"),
            StreamKey::Log { address, signature, .. } => self
                .chain_dir()
                .join(address)
                .join(format!("{}.csv", signature.as_str())),
        }
    }
}

impl Plannable for ArchiveClient {
    fn plan(&mut self, stream: &StreamKey) -> Result<(), ClientError> {
        self.plans.insert(stream)
    }

    fn planned(&self) -> Vec<StreamKey> {
        self.plans.keys()
    }
}

#[async_trait]
impl FeedClient for ArchiveClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeliness(&self) -> Timeliness {
        Timeliness::Archive
    }

    async fn is_valid(&self) -> bool {
        tokio::fs::metadata(self.chain_dir())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn read(&self, after: u64) -> Result<ItemStream, ClientError> {
        if after > 0 {
            return Err(ClientError::UnsupportedCursor { client: self.name.clone(), after });
        }

        let mut files = Vec::new();
        for stream in self.plans.keys() {
            let signature = match &stream {
                StreamKey::Log { signature, .. } => Some(*signature),
                StreamKey::Blocks { .. } => None,
            };
            let address = match &stream {
                StreamKey::Log { address, .. } => address.clone(),
                StreamKey::Blocks { .. } => String::new(),
            };
            files.push((self.path_for(&stream), signature, address));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let normalizer = self.normalizer;
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            info!(client = %name, files = files.len(), "archive read started");
            match merge(files, normalizer, &tx) {
                Ok(count) => info!(client = %name, events = count, "archive read finished"),
                Err(e) => {
                    warn!(client = %name, error = %e, "archive read failed");
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });
        Ok(channel_stream(rx))
    }
}

// ─── K-way merge ──────────────────────────────────────────────────────────────

struct Source {
    path: PathBuf,
    signature: Option<Signature>,
    address: String,
    reader: csv::Reader<File>,
    headers: csv::ByteRecord,
    record: csv::ByteRecord,
    last: Option<OrderKey>,
}

impl Source {
    fn open(path: PathBuf, signature: Option<Signature>, address: String) -> Result<Option<Self>, ClientError> {
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| csv_error(&path, e))?;
        let headers = reader.byte_headers().map_err(|e| csv_error(&path, e))?.clone();
        Ok(Some(Self { path, signature, address, reader, headers, record: csv::ByteRecord::new(), last: None }))
    }

    fn stream(&self, chain_id: u64) -> StreamKey {
        match self.signature {
            Some(sig) => StreamKey::log(chain_id, &self.address, sig),
            None => StreamKey::blocks(chain_id),
        }
    }

    /// The next row, normalized. A row that fails to normalize comes back
    /// as an `Undecodable` entry placed at its own position (or just after
    /// the previous row when its meta columns are unreadable too).
    fn next_entry(&mut self, normalizer: &Normalizer) -> Result<Option<Entry>, ClientError> {
        let more = self
            .reader
            .read_byte_record(&mut self.record)
            .map_err(|e| csv_error(&self.path, e))?;
        if !more {
            return Ok(None);
        }
        let row = TextRow::from_pairs(
            self.headers
                .iter()
                .zip(self.record.iter())
                .map(|(h, v)| (String::from_utf8_lossy(h), v.to_vec())),
        );
        let normalized = match self.signature {
            Some(sig) => normalizer.log_from_row(sig, &self.address, &row).map(FeedEvent::Log),
            None => normalizer.block_from_row(&row).map(FeedEvent::Block),
        };
        let entry = match normalized {
            Ok(event) => (event.order_key(), Ok(event)),
            Err(e) => {
                let at = match self.signature {
                    Some(_) => row.log_position(),
                    None => row.quantity("block_number").ok().map(OrderKey::block),
                };
                let key = at.or(self.last).unwrap_or(OrderKey::block(0));
                warn!(path = %self.path.display(), block = key.block_number, error = %e, "undecodable archive row");
                (key, Err(ClientError::undecodable(self.stream(normalizer.chain_id), at, e)))
            }
        };
        self.last = Some(entry.0);
        Ok(Some(entry))
    }
}

/// A row and where it sorts.
type Entry = (OrderKey, Result<FeedEvent, ClientError>);

fn csv_error(path: &Path, source: csv::Error) -> ClientError {
    ClientError::Csv { path: path.display().to_string(), source }
}

/// Merge every file by order key into `tx`. Returns the number of events sent.
fn merge(
    files: Vec<(PathBuf, Option<Signature>, String)>,
    normalizer: Normalizer,
    tx: &mpsc::Sender<Result<FeedItem, ClientError>>,
) -> Result<usize, ClientError> {
    let mut sources = Vec::new();
    for (path, signature, address) in files {
        match Source::open(path.clone(), signature, address)? {
            Some(source) => sources.push(source),
            None => debug!(path = %path.display(), "archive file absent; stream has no history"),
        }
    }

    let mut heads: Vec<Option<Result<FeedEvent, ClientError>>> = Vec::with_capacity(sources.len());
    let mut heap = BinaryHeap::new();
    for (i, source) in sources.iter_mut().enumerate() {
        match source.next_entry(&normalizer)? {
            Some((key, entry)) => {
                heap.push(Reverse((key, i)));
                heads.push(Some(entry));
            }
            None => heads.push(None),
        }
    }

    let mut seen = FirstSeen::default();
    let mut sent = 0usize;
    let mut last: Option<OrderKey> = None;
    while let Some(Reverse((key, i))) = heap.pop() {
        let Some(entry) = heads[i].take() else {
            continue;
        };
        if last.is_some_and(|prev| key < prev) {
            warn!(path = %sources[i].path.display(), block = key.block_number, "archive file out of order");
        }
        last = Some(key);

        if tx.blocking_send(entry.map(|event| seen.item(event))).is_err() {
            debug!("archive consumer dropped; stopping");
            return Ok(sent);
        }
        sent += 1;

        if let Some((next_key, next)) = sources[i].next_entry(&normalizer)? {
            heap.push(Reverse((next_key, i)));
            heads[i] = Some(next);
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaingov_core::{GovernorFamily, TokenKind};
    use futures::StreamExt;
    use std::io::Write;

    const TOKEN: &str = "0x4200000000000000000000000000000000000042";

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn client(dir: &Path) -> ArchiveClient {
        let mut c = ArchiveClient::new(dir, Normalizer::new(10, GovernorFamily::Agora, TokenKind::Erc20));
        c.plan(&StreamKey::blocks(10)).unwrap();
        c.plan(&StreamKey::log(10, TOKEN, Signature::Transfer)).unwrap();
        c
    }

    #[tokio::test]
    async fn merges_blocks_and_logs_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let c = client(tmp.path());
        write(
            &c.path_for(&StreamKey::blocks(10)),
            "block_number,timestamp\n100,1700000000\n101,1700000002\n102,1700000004\n",
        );
        write(
            &c.path_for(&StreamKey::log(10, TOKEN, Signature::Transfer)),
            "block_number,transaction_index,log_index,from,to,value\n\
             100,0,3,0x0000000000000000000000000000000000000000,0x00000000000000000000000000000000000000AA,1000\n\
             102,1,0,0x00000000000000000000000000000000000000aa,0x00000000000000000000000000000000000000bb,10\n",
        );
        assert!(c.is_valid().await);

        let items: Vec<FeedItem> = c.read(0).await.unwrap().map(|r| r.unwrap()).collect().await;
        let order: Vec<(u64, bool)> = items
            .iter()
            .map(|i| (i.event.block_number(), i.stream_key.is_blocks()))
            .collect();
        assert_eq!(
            order,
            vec![(100, true), (100, false), (101, true), (102, true), (102, false)]
        );
        let firsts = items.iter().filter(|i| i.is_first_in_stream).count();
        assert_eq!(firsts, 2);

        let FeedEvent::Log(first_log) = &items[1].event else { panic!("expected a log") };
        assert_eq!(
            first_log.address("to"),
            Some("0x00000000000000000000000000000000000000aa")
        );
    }

    #[tokio::test]
    async fn missing_files_yield_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let c = client(tmp.path());
        assert!(!c.is_valid().await);
        let items: Vec<_> = c.read(0).await.unwrap().collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn nonzero_cursor_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let c = client(tmp.path());
        assert!(matches!(
            c.read(5).await,
            Err(ClientError::UnsupportedCursor { after: 5, .. })
        ));
    }

    #[tokio::test]
    async fn unreadable_block_row_is_undecodable() {
        let tmp = tempfile::tempdir().unwrap();
        let c = client(tmp.path());
        write(&c.path_for(&StreamKey::blocks(10)), "block_number,timestamp\nnot-a-number,1\n");
        let items: Vec<_> = c.read(0).await.unwrap().collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0],
            Err(ClientError::Undecodable { stream, at: None, .. }) if stream.is_blocks()
        ));
    }

    #[tokio::test]
    async fn bad_rows_fail_only_their_records() {
        let tmp = tempfile::tempdir().unwrap();
        let c = client(tmp.path());
        write(
            &c.path_for(&StreamKey::blocks(10)),
            "block_number,timestamp\n100,1700000000\n101,soon\n102,1700000004\n",
        );
        write(
            &c.path_for(&StreamKey::log(10, TOKEN, Signature::Transfer)),
            "block_number,transaction_index,log_index,from,to,value\n\
             100,0,3,0x0000000000000000000000000000000000000000,0x00000000000000000000000000000000000000AA,1000\n\
             101,x,0,0x00000000000000000000000000000000000000aa,0x00000000000000000000000000000000000000bb,5\n\
             102,1,0,0x00000000000000000000000000000000000000aa,0x00000000000000000000000000000000000000bb,10\n",
        );
        let items: Vec<_> = c.read(0).await.unwrap().collect().await;
        assert_eq!(items.len(), 6);

        // Unreadable meta: placed right after the previous row of its file.
        match &items[2] {
            Err(ClientError::Undecodable { stream, at, .. }) => {
                assert_eq!(stream, &StreamKey::log(10, TOKEN, Signature::Transfer));
                assert_eq!(*at, None);
            }
            other => panic!("expected an undecodable log row, got {other:?}"),
        }
        match &items[3] {
            Err(ClientError::Undecodable { stream, at, .. }) => {
                assert!(stream.is_blocks());
                assert_eq!(*at, Some(OrderKey::block(101)));
            }
            other => panic!("expected an undecodable block row, got {other:?}"),
        }
        let tail: Vec<OrderKey> = items[4..]
            .iter()
            .map(|i| i.as_ref().unwrap().event.order_key())
            .collect();
        assert_eq!(tail, vec![OrderKey::block(102), OrderKey::log(102, 1, 0)]);
    }
}
