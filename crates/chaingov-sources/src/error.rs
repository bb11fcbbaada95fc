//! Source-side error types.

use chaingov_codec::NormalizeError;
use chaingov_core::{OrderKey, StreamKey};
use thiserror::Error;

use crate::rpc::JsonRpcError;

/// Errors from a single JSON-RPC exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

const RANGE_CODES: &[i64] = &[-32005, -32602, -32614];

const RANGE_PHRASES: &[&str] = &[
    "query returned more than",
    "block range",
    "range too large",
    "range is too large",
    "limit exceeded",
    "too many results",
    "exceed maximum block range",
];

impl TransportError {
    /// Transient failures worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::WebSocket(_) | Self::Timeout { .. })
    }

    /// The provider rejected an `eth_getLogs` range as too large or too busy.
    pub fn is_range_too_large(&self) -> bool {
        let Self::Rpc(err) = self else {
            return false;
        };
        if RANGE_CODES.contains(&err.code) {
            return true;
        }
        let message = err.message.to_ascii_lowercase();
        if RANGE_PHRASES.iter().any(|p| message.contains(p)) {
            return true;
        }
        err.code == -32000 && (message.contains("range") || message.contains("limit"))
    }
}

/// Errors that stop a client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Normalize error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{client} cannot resume after block {after}; it always reads from the start")]
    UnsupportedCursor { client: String, after: u64 },

    #[error("Range {from}..={to} still rejected after {depth} splits")]
    SplitDepthExceeded { from: u64, to: u64, depth: u32 },

    #[error("Stream for chain {got} planned on a client for chain {expected}")]
    WrongChain { expected: u64, got: u64 },

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Background reader stopped: {0}")]
    Closed(String),

    /// One record could not be normalized. It concerns `stream` only; the
    /// client keeps reading its other streams.
    #[error("Undecodable record on {stream}: {reason}")]
    Undecodable {
        stream: StreamKey,
        /// Position of the record, when its meta fields parse.
        at: Option<OrderKey>,
        reason: String,
    },
}

impl ClientError {
    pub(crate) fn undecodable(stream: StreamKey, at: Option<OrderKey>, reason: impl std::fmt::Display) -> Self {
        Self::Undecodable { stream, at, reason: reason.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(code: i64, message: &str) -> TransportError {
        TransportError::Rpc(JsonRpcError { code, message: message.into(), data: None })
    }

    #[test]
    fn range_errors_detected() {
        assert!(rpc(-32005, "anything").is_range_too_large());
        assert!(rpc(-32602, "invalid params").is_range_too_large());
        assert!(rpc(-32000, "block range is too wide").is_range_too_large());
        assert!(rpc(-32603, "query returned more than 10000 results").is_range_too_large());
        assert!(!rpc(-32000, "execution reverted").is_range_too_large());
        assert!(!TransportError::Http("reset".into()).is_range_too_large());
    }

    #[test]
    fn retryable_classes() {
        assert!(TransportError::Timeout { ms: 5 }.is_retryable());
        assert!(!rpc(-32005, "x").is_retryable());
    }
}
