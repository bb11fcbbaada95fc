//! WebSocket subscription bookkeeping.
//!
//! Each connection cycle builds a fresh table: `eth_subscribe` requests are
//! registered by request id, confirmed into subscription ids as responses
//! arrive, and pushes are routed by subscription id.

use serde_json::{json, Value};
use std::collections::HashMap;

use chaingov_core::{Signature, StreamKey};

use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

/// A unique subscription ID returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a subscription delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    NewHeads,
    Logs { stream: StreamKey, signature: Signature },
}

impl SubscriptionKind {
    /// `eth_subscribe` params for this kind.
    pub fn params(&self) -> Vec<Value> {
        match self {
            Self::NewHeads => vec![json!("newHeads")],
            Self::Logs { stream: StreamKey::Log { address, .. }, signature } => vec![
                json!("logs"),
                json!({ "address": address, "topics": [signature.sighash()] }),
            ],
            Self::Logs { signature, .. } => {
                vec![json!("logs"), json!({ "topics": [signature.sighash()] })]
            }
        }
    }
}

/// Subscriptions for one connection.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    pending: HashMap<u64, SubscriptionKind>,
    active: HashMap<SubscriptionId, SubscriptionKind>,
}

/// Outcome of feeding a response frame to the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(SubscriptionId),
    Rejected { code: i64, message: String },
    /// Not a response to a pending subscribe.
    Unrelated,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscribe request and build its frame.
    pub fn request(&mut self, id: u64, kind: SubscriptionKind) -> JsonRpcRequest {
        let req = JsonRpcRequest::new(id, "eth_subscribe", kind.params());
        self.pending.insert(id, kind);
        req
    }

    pub fn confirm(&mut self, resp: JsonRpcResponse) -> Confirmation {
        let Some(id) = resp.id.as_number() else {
            return Confirmation::Unrelated;
        };
        let Some(kind) = self.pending.remove(&id) else {
            return Confirmation::Unrelated;
        };
        match resp.into_result() {
            Ok(Value::String(sub)) => {
                let sub = SubscriptionId(sub);
                self.active.insert(sub.clone(), kind);
                Confirmation::Confirmed(sub)
            }
            Ok(other) => Confirmation::Rejected {
                code: 0,
                message: format!("unexpected subscription id {other}"),
            },
            Err(e) => Confirmation::Rejected { code: e.code, message: e.message },
        }
    }

    pub fn route(&self, id: &SubscriptionId) -> Option<&SubscriptionKind> {
        self.active.get(id)
    }

    /// Every requested subscription has been confirmed.
    pub fn is_ready(&self) -> bool {
        self.pending.is_empty() && !self.active.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

// ─── Frames ───────────────────────────────────────────────────────────────────

/// A parsed text frame from the node.
#[derive(Debug)]
pub enum Frame {
    Notification { subscription: SubscriptionId, result: Value },
    Response(JsonRpcResponse),
    Other,
}

pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let val: Value = serde_json::from_str(text)?;
    if val.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        let params = &val["params"];
        return Ok(match params["subscription"].as_str() {
            Some(id) => Frame::Notification {
                subscription: SubscriptionId(id.to_string()),
                result: params["result"].clone(),
            },
            None => Frame::Other,
        });
    }
    if val.get("id").is_some() && (val.get("result").is_some() || val.get("error").is_some()) {
        return Ok(Frame::Response(serde_json::from_value(val)?));
    }
    Ok(Frame::Other)
}
