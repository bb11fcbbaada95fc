//! Historical JSON-RPC reader: paginated `eth_getLogs` with range splitting.
//!
//! Pages cover `span` blocks. A page the provider rejects as too large is
//! split in halves on an explicit worklist, down to `max_split_depth`. The
//! span halves after a split and grows back (capped at the configured span)
//! after clean pages.
//!
//! When blocks are planned, each page also carries sampled headers: every
//! `block_stride`-th block plus the page end. Block-time bookkeeping in the
//! products is hour-bucketed, so the default stride is about an hour.
//!
//! A log that fails to normalize is yielded in order as an
//! `Undecodable` item for its stream; the read goes on.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chaingov_codec::rpc::to_quantity;
use chaingov_codec::{Normalizer, RpcBlockHeader, RpcLog};
use chaingov_core::config::RpcConfig;
use chaingov_core::{FeedEvent, OrderKey, Signature, StreamKey};

use crate::client::{
    channel_stream, FeedClient, FeedItem, FirstSeen, ItemStream, PlanSet, Plannable, Timeliness,
    CHANNEL_DEPTH,
};
use crate::error::{ClientError, TransportError};
use crate::rpc::RpcTransport;

/// Pagination tunables, resolved for one chain.
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub span: u64,
    pub max_split_depth: u32,
    pub start_block: u64,
    pub block_stride: u64,
}

impl Paging {
    pub fn for_chain(config: &RpcConfig, chain_id: u64) -> Self {
        Self {
            span: config.span_for(chain_id).max(1),
            max_split_depth: config.max_split_depth,
            start_block: config.start_block,
            block_stride: config.stride_for(chain_id),
        }
    }
}

pub struct HistoricalClient<T: RpcTransport> {
    name: String,
    inner: Arc<Inner<T>>,
    plans: PlanSet,
}

struct Inner<T> {
    transport: T,
    normalizer: Normalizer,
    paging: Paging,
    next_id: AtomicU64,
}

impl<T: RpcTransport> HistoricalClient<T> {
    pub fn new(transport: T, normalizer: Normalizer, paging: Paging) -> Self {
        Self {
            name: format!("rpc:{}", transport.url()),
            inner: Arc::new(Inner { transport, normalizer, paging, next_id: AtomicU64::new(1) }),
            plans: PlanSet::new(normalizer.chain_id),
        }
    }
}

impl<T: RpcTransport> Plannable for HistoricalClient<T> {
    fn plan(&mut self, stream: &StreamKey) -> Result<(), ClientError> {
        self.plans.insert(stream)
    }

    fn planned(&self) -> Vec<StreamKey> {
        self.plans.keys()
    }
}

#[async_trait]
impl<T: RpcTransport> FeedClient for HistoricalClient<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeliness(&self) -> Timeliness {
        Timeliness::Archive
    }

    async fn is_valid(&self) -> bool {
        match self.inner.call::<String>("eth_chainId", vec![]).await {
            Ok(id) => {
                let got = chaingov_codec::rpc::parse_quantity(&id);
                let ok = got == Some(self.inner.normalizer.chain_id);
                if !ok {
                    warn!(client = %self.name, expected = self.inner.normalizer.chain_id, got = %id, "chain id mismatch");
                }
                ok
            }
            Err(e) => {
                warn!(client = %self.name, error = %e, "rpc validity check failed");
                false
            }
        }
    }

    async fn read(&self, after: u64) -> Result<ItemStream, ClientError> {
        let head = self.inner.head().await?;
        let from = (after + 1).max(self.inner.paging.start_block);
        let routes = Routes::new(&self.plans);
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let inner = Arc::clone(&self.inner);
        let name = self.name.clone();

        tokio::spawn(async move {
            info!(client = %name, from, head, "historical read started");
            if let Err(e) = inner.paginate(from, head, &routes, &tx).await {
                warn!(client = %name, error = %e, "historical read failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(channel_stream(rx))
    }
}

// ─── Routing ──────────────────────────────────────────────────────────────────

/// `(address, topic0)` → signature for every planned log stream.
#[derive(Debug, Clone, Default)]
struct Routes {
    by_topic: HashMap<(String, String), Signature>,
    addresses: Vec<String>,
    topics: Vec<String>,
    blocks: bool,
}

impl Routes {
    fn new(plans: &PlanSet) -> Self {
        let mut routes = Routes { blocks: plans.has_blocks(), ..Default::default() };
        for (address, signature) in plans.logs() {
            let topic = signature.sighash();
            if !routes.addresses.iter().any(|a| a == address) {
                routes.addresses.push(address.to_string());
            }
            if !routes.topics.contains(&topic) {
                routes.topics.push(topic.clone());
            }
            routes.by_topic.insert((address.to_string(), topic), signature);
        }
        routes
    }

    fn route(&self, log: &RpcLog) -> Option<Signature> {
        let topic = log.topic0()?.to_ascii_lowercase();
        self.by_topic
            .get(&(log.address.to_ascii_lowercase(), topic))
            .copied()
    }

    fn has_logs(&self) -> bool {
        !self.by_topic.is_empty()
    }
}

/// Headers fetched for `[from, to]`: every `stride`-th block plus `to`.
fn block_samples(from: u64, to: u64, stride: u64) -> Vec<u64> {
    let stride = stride.max(1);
    let first = from.div_ceil(stride).saturating_mul(stride);
    let mut out: Vec<u64> = (first..=to).step_by(usize::try_from(stride).unwrap_or(usize::MAX)).collect();
    if out.last() != Some(&to) {
        out.push(to);
    }
    out
}

// ─── Pagination ───────────────────────────────────────────────────────────────

impl<T: RpcTransport> Inner<T> {
    async fn call<R: serde::de::DeserializeOwned + Send>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.transport.call(id, method, params).await
    }

    async fn head(&self) -> Result<u64, ClientError> {
        let raw: String = self.call("eth_blockNumber", vec![]).await?;
        chaingov_codec::rpc::parse_quantity(&raw)
            .ok_or_else(|| TransportError::Other(format!("bad block number '{raw}'")).into())
    }

    async fn paginate(
        &self,
        from: u64,
        to: u64,
        routes: &Routes,
        tx: &mpsc::Sender<Result<FeedItem, ClientError>>,
    ) -> Result<(), ClientError> {
        let max_span = self.paging.span;
        let mut span = max_span;
        let mut cursor = from;
        let mut seen = FirstSeen::default();

        while cursor <= to {
            let end = cursor.saturating_add(span - 1).min(to);
            let (logs, split) = if routes.has_logs() {
                self.logs_in(cursor, end, routes).await?
            } else {
                (Vec::new(), false)
            };

            let mut page: Vec<(OrderKey, Result<FeedEvent, ClientError>)> = Vec::with_capacity(logs.len() + 1);
            for log in logs {
                if log.removed {
                    continue;
                }
                let Some(signature) = routes.route(&log) else {
                    debug!(address = %log.address, "unplanned log in page");
                    continue;
                };
                match self.normalizer.log_from_rpc_as(signature, &log) {
                    Ok(event) => {
                        let event = FeedEvent::Log(event);
                        page.push((event.order_key(), Ok(event)))
                    }
                    Err(e) => {
                        let stream = StreamKey::log(self.normalizer.chain_id, &log.address, signature);
                        let at = log.position().unwrap_or_else(|| OrderKey::block(cursor));
                        warn!(%stream, block = at.block_number, error = %e, "undecodable log");
                        page.push((at, Err(ClientError::undecodable(stream, Some(at), e))));
                    }
                }
            }
            if routes.blocks {
                for number in block_samples(cursor, end, self.paging.block_stride) {
                    match self.block(number).await {
                        Ok(Some(block)) => page.push((OrderKey::block(number), Ok(FeedEvent::Block(block)))),
                        Ok(None) => warn!(block = number, "block header missing"),
                        Err(ClientError::Normalize(e)) => {
                            let stream = StreamKey::blocks(self.normalizer.chain_id);
                            let at = OrderKey::block(number);
                            page.push((at, Err(ClientError::undecodable(stream, Some(at), e))));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            page.sort_by_key(|(key, _)| *key);

            debug!(from = cursor, to = end, events = page.len(), span, "page read");
            for (_, entry) in page {
                if tx.send(entry.map(|event| seen.item(event))).await.is_err() {
                    return Ok(());
                }
            }

            span = if split { (span / 2).max(1) } else { span.saturating_mul(2).min(max_span) };
            cursor = end + 1;
        }
        info!(to, "historical read finished");
        Ok(())
    }

    /// Logs in `[from, to]`, splitting rejected ranges. Returns whether any
    /// split happened.
    async fn logs_in(&self, from: u64, to: u64, routes: &Routes) -> Result<(Vec<RpcLog>, bool), ClientError> {
        let mut out = Vec::new();
        let mut split = false;
        // Right half pushed first so ranges pop in ascending order.
        let mut work = vec![(from, to, 0u32)];
        while let Some((lo, hi, depth)) = work.pop() {
            match self.get_logs(lo, hi, routes).await {
                Ok(logs) => out.extend(logs),
                Err(e) if e.is_range_too_large() => {
                    if lo >= hi || depth >= self.paging.max_split_depth {
                        return Err(ClientError::SplitDepthExceeded { from: lo, to: hi, depth });
                    }
                    let mid = lo + (hi - lo) / 2;
                    warn!(from = lo, to = hi, depth, error = %e, "range rejected; splitting");
                    work.push((mid + 1, hi, depth + 1));
                    work.push((lo, mid, depth + 1));
                    split = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok((out, split))
    }

    async fn get_logs(&self, from: u64, to: u64, routes: &Routes) -> Result<Vec<RpcLog>, TransportError> {
        let filter = json!({
            "fromBlock": to_quantity(from),
            "toBlock": to_quantity(to),
            "address": routes.addresses,
            "topics": [routes.topics],
        });
        self.call("eth_getLogs", vec![filter]).await
    }

    async fn block(&self, number: u64) -> Result<Option<chaingov_core::BlockEvent>, ClientError> {
        let header: Option<RpcBlockHeader> = self
            .call("eth_getBlockByNumber", vec![json!(to_quantity(number)), json!(false)])
            .await?;
        header
            .map(|h| self.normalizer.block_from_header(&h))
            .transpose()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{JsonRpcRequest, JsonRpcResponse};
    use chaingov_core::{GovernorFamily, TokenKind};
    use futures::StreamExt;
    use std::sync::Mutex;

    const TOKEN: &str = "0x4200000000000000000000000000000000000042";

    /// Serves `eth_getLogs` from a fixed log set, rejecting spans wider than `limit`.
    struct MockNode {
        chain_id: u64,
        head: u64,
        limit: u64,
        logs: Vec<RpcLog>,
        ranges: Mutex<Vec<(u64, u64)>>,
    }

    fn word(n: u64) -> String {
        format!("0x{n:064x}")
    }

    fn transfer_log(block: u64, log_index: u64, value: u64) -> RpcLog {
        RpcLog {
            address: TOKEN.into(),
            topics: vec![
                Signature::Transfer.sighash(),
                word(0),
                format!("0x{:0>64}", "00000000000000000000000000000000000000aa"),
            ],
            data: word(value),
            block_number: Some(to_quantity(block)),
            transaction_index: Some("0x0".into()),
            log_index: Some(to_quantity(log_index)),
            transaction_hash: None,
            removed: false,
        }
    }

    fn param_u64(v: &Value, key: &str) -> u64 {
        chaingov_codec::rpc::parse_quantity(v[key].as_str().unwrap()).unwrap()
    }

    #[async_trait]
    impl RpcTransport for MockNode {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            let id = req.id;
            let resp = match req.method.as_str() {
                "eth_chainId" => JsonRpcResponse::success(id, json!(to_quantity(self.chain_id))),
                "eth_blockNumber" => JsonRpcResponse::success(id, json!(to_quantity(self.head))),
                "eth_getBlockByNumber" => {
                    let n = chaingov_codec::rpc::parse_quantity(req.params[0].as_str().unwrap()).unwrap();
                    JsonRpcResponse::success(
                        id,
                        json!({"number": to_quantity(n), "timestamp": to_quantity(1_000 + n), "hash": "0x00"}),
                    )
                }
                "eth_getLogs" => {
                    let (from, to) = (param_u64(&req.params[0], "fromBlock"), param_u64(&req.params[0], "toBlock"));
                    self.ranges.lock().unwrap().push((from, to));
                    if to - from + 1 > self.limit {
                        JsonRpcResponse::failure(id, -32005, "query returned more than 10000 results")
                    } else {
                        let logs: Vec<_> = self
                            .logs
                            .iter()
                            .filter(|l| (from..=to).contains(&l.block().unwrap()))
                            .cloned()
                            .collect();
                        JsonRpcResponse::success(id, serde_json::to_value(logs).unwrap())
                    }
                }
                other => JsonRpcResponse::failure(id, -32601, format!("method {other} not found")),
            };
            Ok(resp)
        }

        fn url(&self) -> &str {
            "mock"
        }
    }

    fn client(node: MockNode, span: u64, depth: u32) -> HistoricalClient<MockNode> {
        let normalizer = Normalizer::new(node.chain_id, GovernorFamily::Oz, TokenKind::Erc20);
        let paging = Paging { span, max_split_depth: depth, start_block: 0, block_stride: 1_000 };
        let mut c = HistoricalClient::new(node, normalizer, paging);
        c.plan(&StreamKey::log(10, TOKEN, Signature::Transfer)).unwrap();
        c
    }

    fn node(limit: u64) -> MockNode {
        MockNode {
            chain_id: 10,
            head: 40,
            limit,
            logs: vec![transfer_log(3, 0, 5), transfer_log(17, 2, 6), transfer_log(17, 1, 7), transfer_log(39, 0, 8)],
            ranges: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn split_ranges_merge_in_order() {
        let c = client(node(4), 16, 12);
        assert!(c.is_valid().await);
        let items: Vec<FeedItem> = c.read(0).await.unwrap().map(|r| r.unwrap()).collect().await;
        let keys: Vec<(u64, u64)> = items
            .iter()
            .map(|i| match &i.event {
                FeedEvent::Log(l) => (l.block_number, l.log_index),
                FeedEvent::Block(_) => panic!("no block stream planned"),
            })
            .collect();
        assert_eq!(keys, vec![(3, 0), (17, 1), (17, 2), (39, 0)]);
        assert!(items[0].is_first_in_stream);
        assert!(!items[1].is_first_in_stream);

        let ranges = c.inner.transport.ranges.lock().unwrap().clone();
        assert!(ranges.iter().any(|(f, t)| t - f + 1 > 4), "first page should be rejected");
        let accepted: Vec<_> = ranges.iter().filter(|(f, t)| t - f + 1 <= 4).collect();
        assert_eq!(accepted.first().map(|r| r.0), Some(1));
        assert!(accepted.windows(2).all(|w| w[0].1 + 1 == w[1].0), "pages must tile the range");
    }

    #[tokio::test]
    async fn depth_ceiling_is_fatal() {
        let c = client(node(1), 16, 2);
        let items: Vec<_> = c.read(0).await.unwrap().collect().await;
        assert!(matches!(
            items.last(),
            Some(Err(ClientError::SplitDepthExceeded { depth: 2, .. }))
        ));
    }

    #[tokio::test]
    async fn resumes_after_cursor_with_block_events() {
        let mut c = client(node(100), 100, 12);
        c.plan(&StreamKey::blocks(10)).unwrap();
        let items: Vec<FeedItem> = c.read(17).await.unwrap().map(|r| r.unwrap()).collect().await;
        // One page 18..=40: the log at 39 then the page-end block 40.
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].event.block_number(), 39);
        assert!(items[1].stream_key.is_blocks());
        assert_eq!(items[1].event.block_number(), 40);
    }

    #[test]
    fn headers_sampled_per_stride_and_at_page_end() {
        assert_eq!(block_samples(18, 40, 10), vec![20, 30, 40]);
        assert_eq!(block_samples(18, 45, 10), vec![20, 30, 40, 45]);
        assert_eq!(block_samples(0, 5, 1_000), vec![0, 5]);
        assert_eq!(block_samples(7, 7, 3), vec![7]);
    }

    #[tokio::test]
    async fn page_carries_sampled_headers() {
        let normalizer = Normalizer::new(10, GovernorFamily::Oz, TokenKind::Erc20);
        let paging = Paging { span: 100, max_split_depth: 4, start_block: 0, block_stride: 10 };
        let mut c = HistoricalClient::new(node(100), normalizer, paging);
        c.plan(&StreamKey::blocks(10)).unwrap();
        let blocks: Vec<u64> = c
            .read(0)
            .await
            .unwrap()
            .map(|r| r.unwrap().event.block_number())
            .collect()
            .await;
        assert_eq!(blocks, vec![10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn undecodable_log_fails_only_its_record() {
        let mut n = node(100);
        n.logs[1].data = "0xzz".into();
        let c = client(n, 100, 4);
        let items: Vec<_> = c.read(0).await.unwrap().collect().await;

        assert_eq!(items.len(), 4, "the read continues past the bad log");
        match &items[2] {
            Err(ClientError::Undecodable { stream, at, .. }) => {
                assert_eq!(*stream, StreamKey::log(10, TOKEN, Signature::Transfer));
                assert_eq!(*at, Some(OrderKey::log(17, 0, 2)));
            }
            other => panic!("expected an undecodable record, got {other:?}"),
        }
        let good: Vec<u64> = items.iter().filter_map(|r| r.as_ref().ok()).map(|i| i.event.block_number()).collect();
        assert_eq!(good, vec![3, 17, 39]);
    }

    #[tokio::test]
    async fn wrong_chain_is_invalid() {
        let mut n = node(100);
        n.chain_id = 1;
        let normalizer = Normalizer::new(10, GovernorFamily::Oz, TokenKind::Erc20);
        let c = HistoricalClient::new(n, normalizer, Paging { span: 10, max_split_depth: 3, start_block: 0, block_stride: 1_000 });
        assert!(!c.is_valid().await);
    }
}
