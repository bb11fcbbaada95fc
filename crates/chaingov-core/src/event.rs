//! The canonical event model every source is normalized into.

use alloy_primitives::{I256, U256};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::signature::Signature;
use crate::stream::StreamKey;

// ─── FieldValue ───────────────────────────────────────────────────────────────

/// A decoded, normalized event field.
///
/// Addresses and byte strings are always lowercase and `0x`-prefixed, whatever
/// the source, so downstream comparisons can use plain string equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Uint(U256),
    Int(I256),
    Bool(bool),
    Address(String),
    Bytes(String),
    /// UTF-8 string, or a raw value that failed coercion.
    Str(String),
    Array(Vec<FieldValue>),
    Tuple(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_uint(&self) -> Option<U256> {
        match self {
            FieldValue::Uint(u) => Some(*u),
            FieldValue::Int(i) if !i.is_negative() => Some(i.into_raw()),
            _ => None,
        }
    }

    /// Address or bytes rendered as lowercase hex.
    pub fn as_hex(&self) -> Option<&str> {
        match self {
            FieldValue::Address(s) | FieldValue::Bytes(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(v) | FieldValue::Tuple(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Small unsigned values (support codes, type ids, quorum numbers).
    pub fn as_u64(&self) -> Option<u64> {
        self.as_uint().and_then(|u| u64::try_from(u).ok())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Uint(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Address(s) | FieldValue::Bytes(s) | FieldValue::Str(s) => {
                write!(f, "{s}")
            }
            FieldValue::Array(v) | FieldValue::Tuple(v) => {
                let parts: Vec<_> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// A block header event: the clock every time-aware product runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub chain_id: u64,
    pub block_number: u64,
    /// Unix seconds.
    pub timestamp: u64,
}

/// snake_cased field name → value, in ABI order.
pub type FieldMap = IndexMap<String, FieldValue>;

/// A decoded contract log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub chain_id: u64,
    /// Emitting contract, lowercase `0x…`.
    pub address: String,
    pub signature: Signature,
    /// topic0, lowercase `0x…`.
    pub sighash: String,
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub fields: FieldMap,
}

impl LogEvent {
    /// An event with no fields yet; the sighash is derived from `signature`.
    pub fn new(
        chain_id: u64,
        address: &str,
        signature: Signature,
        block_number: u64,
        transaction_index: u64,
        log_index: u64,
    ) -> Self {
        Self {
            chain_id,
            address: address.to_ascii_lowercase(),
            signature,
            sighash: signature.sighash(),
            block_number,
            transaction_index,
            log_index,
            fields: FieldMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn uint(&self, name: &str) -> Option<U256> {
        self.field(name).and_then(FieldValue::as_uint)
    }

    pub fn address(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_hex)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_str)
    }

    /// `(block_number, transaction_index)`, the registration point of a relation.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.transaction_index)
    }
}

/// Everything a data product can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FeedEvent {
    Block(BlockEvent),
    Log(LogEvent),
}

impl FeedEvent {
    pub fn chain_id(&self) -> u64 {
        match self {
            FeedEvent::Block(b) => b.chain_id,
            FeedEvent::Log(l) => l.chain_id,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            FeedEvent::Block(b) => b.block_number,
            FeedEvent::Log(l) => l.block_number,
        }
    }

    pub fn signature(&self) -> Option<Signature> {
        match self {
            FeedEvent::Block(_) => None,
            FeedEvent::Log(l) => Some(l.signature),
        }
    }

    pub fn order_key(&self) -> OrderKey {
        match self {
            FeedEvent::Block(b) => OrderKey::block(b.block_number),
            FeedEvent::Log(l) => OrderKey::log(l.block_number, l.transaction_index, l.log_index),
        }
    }

    /// The stream this event belongs to.
    pub fn stream_key(&self) -> StreamKey {
        match self {
            FeedEvent::Block(b) => StreamKey::blocks(b.chain_id),
            FeedEvent::Log(l) => StreamKey::log(l.chain_id, &l.address, l.signature),
        }
    }
}

// ─── Ordering ─────────────────────────────────────────────────────────────────

/// Total order of events within one chain.
///
/// A block event sorts before every log of the same block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub block_number: u64,
    kind: u8,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl OrderKey {
    pub fn block(block_number: u64) -> Self {
        Self { block_number, kind: 0, transaction_index: 0, log_index: 0 }
    }

    pub fn log(block_number: u64, transaction_index: u64, log_index: u64) -> Self {
        Self { block_number, kind: 1, transaction_index, log_index }
    }
}

/// `proposalId` → `proposal_id`, `newBalance` → `new_balance`, `_delegatee` → `delegatee`.
pub fn snake_case(name: &str) -> String {
    let trimmed = name.trim_start_matches('_');
    let mut out = String::with_capacity(trimmed.len() + 4);
    let mut prev_lower = false;
    for c in trimmed.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_names() {
        assert_eq!(snake_case("proposalId"), "proposal_id");
        assert_eq!(snake_case("fromDelegate"), "from_delegate");
        assert_eq!(snake_case("voter"), "voter");
        assert_eq!(snake_case("_numerator"), "numerator");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert_eq!(snake_case("proposalTypeId"), "proposal_type_id");
    }

    #[test]
    fn block_sorts_before_logs_of_same_block() {
        let block = OrderKey::block(100);
        let first_log = OrderKey::log(100, 0, 0);
        let prev_log = OrderKey::log(99, 7, 3);
        assert!(prev_log < block);
        assert!(block < first_log);
        assert!(OrderKey::log(100, 0, 1) < OrderKey::log(100, 1, 0));
    }

    #[test]
    fn field_value_accessors() {
        let v = FieldValue::Uint(U256::from(42u64));
        assert_eq!(v.as_u64(), Some(42));
        assert_eq!(v.to_string(), "42");
        let a = FieldValue::Address("0xabc".into());
        assert_eq!(a.as_hex(), Some("0xabc"));
        assert!(a.as_uint().is_none());
    }
}
