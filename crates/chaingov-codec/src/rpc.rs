//! JSON-RPC log and block-header shapes, as returned by `eth_getLogs`,
//! `eth_getBlockByNumber` and websocket `logs` / `newHeads` pushes.

use chaingov_core::OrderKey;
use serde::{Deserialize, Serialize};

/// A raw log object. Hex quantities are kept as strings until normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub transaction_index: Option<String>,
    #[serde(default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    /// Set on websocket pushes for logs dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }

    pub fn block(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(parse_quantity)
    }

    /// `(block, tx, log)` of the log, if all three are present and parse.
    pub fn position(&self) -> Option<OrderKey> {
        let q = |v: &Option<String>| v.as_deref().and_then(parse_quantity);
        Some(OrderKey::log(self.block()?, q(&self.transaction_index)?, q(&self.log_index)?))
    }
}

/// The subset of a block header ChainGov needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcBlockHeader {
    pub number: String,
    pub timestamp: String,
    #[serde(default)]
    pub hash: Option<String>,
}

/// Parse an Ethereum quantity: `0x`-hex or plain decimal.
pub fn parse_quantity(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some("") => Some(0),
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Render a block number as an Ethereum quantity.
pub fn to_quantity(n: u64) -> String {
    format!("0x{n:x}")
}
