//! Realtime websocket client.
//!
//! One background task owns the socket. On connect it subscribes to
//! `newHeads` (when blocks are planned) and to `logs` per planned
//! `(address, topic)`. Any socket error or rejected subscription tears the
//! connection down and restarts the whole connect-and-subscribe cycle with
//! doubling backoff; the backoff resets once every subscription is live.
//! The task runs until the consumer drops the stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use chaingov_codec::rpc::parse_quantity;
use chaingov_codec::{Normalizer, RpcBlockHeader, RpcLog};
use chaingov_core::config::WsConfig;
use chaingov_core::{FeedEvent, OrderKey, StreamKey};

use crate::client::{
    channel_stream, FeedClient, FeedItem, FirstSeen, ItemStream, PlanSet, Plannable, Timeliness,
    CHANNEL_DEPTH,
};
use crate::error::{ClientError, TransportError};
use crate::subscriptions::{parse_frame, Confirmation, Frame, SubscriptionKind, SubscriptionTable};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect backoff bounds.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &WsConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.reconnect_initial_ms),
            max: Duration::from_millis(config.reconnect_max_ms),
        }
    }

    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

pub struct RealtimeClient {
    name: String,
    url: String,
    normalizer: Normalizer,
    plans: PlanSet,
    backoff: Backoff,
}

impl RealtimeClient {
    pub fn new(config: &WsConfig, normalizer: Normalizer) -> Self {
        Self {
            name: format!("ws:{}", config.url),
            url: config.url.clone(),
            plans: PlanSet::new(normalizer.chain_id),
            normalizer,
            backoff: Backoff::from_config(config),
        }
    }

    fn kinds(&self) -> Vec<SubscriptionKind> {
        let mut kinds = Vec::new();
        if self.plans.has_blocks() {
            kinds.push(SubscriptionKind::NewHeads);
        }
        for (address, signature) in self.plans.logs() {
            kinds.push(SubscriptionKind::Logs {
                stream: StreamKey::log(self.plans.chain_id(), address, signature),
                signature,
            });
        }
        kinds
    }
}

impl Plannable for RealtimeClient {
    fn plan(&mut self, stream: &StreamKey) -> Result<(), ClientError> {
        self.plans.insert(stream)
    }

    fn planned(&self) -> Vec<StreamKey> {
        self.plans.keys()
    }
}

#[async_trait]
impl FeedClient for RealtimeClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeliness(&self) -> Timeliness {
        Timeliness::Realtime
    }

    async fn is_valid(&self) -> bool {
        match time::timeout(CHECK_TIMEOUT, tokio_tungstenite::connect_async(self.url.as_str())).await {
            Ok(Ok((mut ws, _))) => {
                let _ = ws.close(None).await;
                true
            }
            Ok(Err(e)) => {
                warn!(client = %self.name, error = %e, "websocket validity check failed");
                false
            }
            Err(_) => {
                warn!(client = %self.name, "websocket validity check timed out");
                false
            }
        }
    }

    async fn read(&self, after: u64) -> Result<ItemStream, ClientError> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let task = WsTask {
            name: self.name.clone(),
            url: self.url.clone(),
            normalizer: self.normalizer,
            kinds: self.kinds(),
            backoff: self.backoff,
            delivery: Delivery::new(after),
            tx,
        };
        tokio::spawn(task.run());
        Ok(channel_stream(rx))
    }
}

// ─── Delivery filter ──────────────────────────────────────────────────────────

/// Drops events at or below the read cursor and anything a stream has
/// already delivered (reconnects may replay the head).
#[derive(Debug)]
pub(crate) struct Delivery {
    after: u64,
    last: HashMap<StreamKey, OrderKey>,
    seen: FirstSeen,
}

impl Delivery {
    pub(crate) fn new(after: u64) -> Self {
        Self { after, last: HashMap::new(), seen: FirstSeen::default() }
    }

    pub(crate) fn admit(&mut self, event: FeedEvent) -> Option<FeedItem> {
        if event.block_number() <= self.after {
            return None;
        }
        let key = event.order_key();
        let stream = event.stream_key();
        if self.last.get(&stream).is_some_and(|prev| key <= *prev) {
            return None;
        }
        self.last.insert(stream, key);
        Some(self.seen.item(event))
    }

    /// Whether a decode failure is for a record already behind the cursor
    /// (a head replayed after reconnect). Otherwise it is recorded as the
    /// stream's last position so a replay of it is not reported twice.
    pub(crate) fn is_replay(&mut self, error: &ClientError) -> bool {
        let ClientError::Undecodable { stream, at: Some(key), .. } = error else {
            return false;
        };
        if key.block_number <= self.after || self.last.get(stream).is_some_and(|prev| key <= prev) {
            return true;
        }
        self.last.insert(stream.clone(), *key);
        false
    }
}

// ─── Background task ──────────────────────────────────────────────────────────

enum SessionEnd {
    ConsumerGone,
    Disconnected,
}

struct WsTask {
    name: String,
    url: String,
    normalizer: Normalizer,
    kinds: Vec<SubscriptionKind>,
    backoff: Backoff,
    delivery: Delivery,
    tx: mpsc::Sender<Result<FeedItem, ClientError>>,
}

impl WsTask {
    async fn run(mut self) {
        let mut delay = self.backoff.initial;
        loop {
            if self.tx.is_closed() {
                return;
            }
            info!(client = %self.name, "connecting via WebSocket");
            match self.session(&mut delay).await {
                Ok(SessionEnd::ConsumerGone) => {
                    debug!(client = %self.name, "consumer dropped; closing");
                    return;
                }
                Ok(SessionEnd::Disconnected) => {
                    warn!(client = %self.name, "WS disconnected, reconnecting in {delay:?}");
                }
                Err(e) => {
                    warn!(client = %self.name, error = %e, "WS session failed, retrying in {delay:?}");
                }
            }
            time::sleep(delay).await;
            delay = self.backoff.next(delay);
        }
    }

    async fn session(&mut self, delay: &mut Duration) -> Result<SessionEnd, ClientError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let mut table = SubscriptionTable::new();
        for (i, kind) in self.kinds.iter().enumerate() {
            let req = table.request(i as u64 + 1, kind.clone());
            let text = serde_json::to_string(&req).map_err(TransportError::from)?;
            sink.send(Message::Text(text.into()))
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        }

        let mut ready = false;
        loop {
            let msg = tokio::select! {
                _ = self.tx.closed() => return Ok(SessionEnd::ConsumerGone),
                msg = stream.next() => msg,
            };
            let text = match msg {
                None | Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Disconnected),
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string()).into()),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(_)) => continue,
            };

            match parse_frame(text.as_str()) {
                Ok(Frame::Response(resp)) => match table.confirm(resp) {
                    Confirmation::Confirmed(sub) => {
                        debug!(client = %self.name, subscription = %sub, "subscribed");
                        if !ready && table.is_ready() {
                            ready = true;
                            *delay = self.backoff.initial;
                            info!(client = %self.name, subscriptions = table.len(), "subscriptions live");
                        }
                    }
                    Confirmation::Rejected { code, message } => {
                        return Err(ClientError::Subscription(format!("{code}: {message}")));
                    }
                    Confirmation::Unrelated => {}
                },
                Ok(Frame::Notification { subscription, result }) => {
                    let Some(kind) = table.route(&subscription) else {
                        debug!(client = %self.name, %subscription, "push for unknown subscription");
                        continue;
                    };
                    let out = match decode_push(&self.normalizer, kind, result) {
                        Ok(Some(event)) => self.delivery.admit(event).map(Ok),
                        Ok(None) => None,
                        Err(e) if self.delivery.is_replay(&e) => None,
                        Err(e) => {
                            error!(client = %self.name, error = %e, "undecodable push; failing its stream");
                            Some(Err(e))
                        }
                    };
                    if let Some(out) = out {
                        if self.tx.send(out).await.is_err() {
                            return Ok(SessionEnd::ConsumerGone);
                        }
                    }
                }
                Ok(Frame::Other) => {}
                Err(e) => debug!(client = %self.name, error = %e, "unparseable WS frame"),
            }
        }
    }
}

/// Normalize one subscription push. Reorged logs yield `None`. Failures
/// are reported against the subscription's stream only.
fn decode_push(
    normalizer: &Normalizer,
    kind: &SubscriptionKind,
    result: Value,
) -> Result<Option<FeedEvent>, ClientError> {
    match kind {
        SubscriptionKind::NewHeads => {
            let stream = StreamKey::blocks(normalizer.chain_id);
            let at = result
                .get("number")
                .and_then(Value::as_str)
                .and_then(parse_quantity)
                .map(OrderKey::block);
            let header: RpcBlockHeader = serde_json::from_value(result)
                .map_err(|e| ClientError::undecodable(stream.clone(), at, e))?;
            let block = normalizer
                .block_from_header(&header)
                .map_err(|e| ClientError::undecodable(stream, at, e))?;
            Ok(Some(FeedEvent::Block(block)))
        }
        SubscriptionKind::Logs { stream, signature } => {
            let log: RpcLog = serde_json::from_value(result)
                .map_err(|e| ClientError::undecodable(stream.clone(), None, e))?;
            if log.removed {
                warn!(address = %log.address, block = ?log.block(), "removed log ignored");
                return Ok(None);
            }
            let event = normalizer
                .log_from_rpc_as(*signature, &log)
                .map_err(|e| ClientError::undecodable(stream.clone(), log.position(), e))?;
            Ok(Some(FeedEvent::Log(event)))
        }
    }
}
