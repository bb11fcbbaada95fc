//! Votes and per-proposal vote aggregation.

use alloy_primitives::U256;
use chaingov_codec::params::PARAMS_DECODED;
use chaingov_core::{FeedEvent, FieldValue, LogEvent, Signature};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{require_address, require_uint, unexpected, DataProduct, ProductError};

/// Aggregation key: one decoded vote param, or the sentinel for plain votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamKey {
    NoParam,
    Option(U256),
}

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamKey::NoParam => f.write_str("no-param"),
            ParamKey::Option(v) => write!(f, "{v}"),
        }
    }
}

/// param key → support code → cumulative weight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteAggregation {
    tallies: BTreeMap<ParamKey, BTreeMap<u8, U256>>,
}

impl VoteAggregation {
    pub fn credit(&mut self, key: ParamKey, support: u8, weight: U256) {
        let slot = self
            .tallies
            .entry(key)
            .or_default()
            .entry(support)
            .or_insert(U256::ZERO);
        *slot = slot.saturating_add(weight);
    }

    pub fn weight(&self, key: ParamKey, support: u8) -> U256 {
        self.tallies
            .get(&key)
            .and_then(|m| m.get(&support))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    /// Number of `(key, support)` cells.
    pub fn cells(&self) -> usize {
        self.tallies.values().map(BTreeMap::len).sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = ParamKey> + '_ {
        self.tallies.keys().copied()
    }

    /// JSON map with string keys: `{"no-param": {"1": "100"}}`.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<_, _> = self
            .tallies
            .iter()
            .map(|(k, by_support)| {
                let inner: serde_json::Map<_, _> = by_support
                    .iter()
                    .map(|(s, w)| (s.to_string(), json!(w.to_string())))
                    .collect();
                (k.to_string(), serde_json::Value::Object(inner))
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Compact vote record. Stored per voter and per proposal; never carries the voter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    #[serde(rename = "pid")]
    pub proposal_id: U256,
    #[serde(rename = "s")]
    pub support: u8,
    #[serde(rename = "w")]
    pub weight: U256,
    #[serde(rename = "b")]
    pub block_number: u64,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "p", default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<U256>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Votes {
    by_voter: HashMap<String, Vec<VoteRecord>>,
    by_proposal: HashMap<U256, Vec<VoteRecord>>,
    participated: HashMap<String, HashSet<U256>>,
    latest_block: HashMap<String, u64>,
    aggregations: HashMap<U256, VoteAggregation>,
    total: usize,
}

impl Votes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn votes_by_voter(&self, voter: &str) -> &[VoteRecord] {
        self.by_voter
            .get(&voter.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn votes_for_proposal(&self, proposal_id: U256) -> &[VoteRecord] {
        self.by_proposal
            .get(&proposal_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn aggregation(&self, proposal_id: U256) -> Option<&VoteAggregation> {
        self.aggregations.get(&proposal_id)
    }

    pub fn has_voted(&self, voter: &str, proposal_id: U256) -> bool {
        self.participated
            .get(&voter.to_ascii_lowercase())
            .is_some_and(|s| s.contains(&proposal_id))
    }

    pub fn latest_vote_block(&self, voter: &str) -> Option<u64> {
        self.latest_block.get(&voter.to_ascii_lowercase()).copied()
    }

    pub fn voter_count(&self) -> usize {
        self.by_voter.len()
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn apply(&mut self, log: &LogEvent) -> Result<(), ProductError> {
        let voter = require_address(log, "voter")?.to_string();
        let proposal_id = require_uint(log, &["proposal_id", "id"])?;
        let support = log
            .field("support")
            .and_then(FieldValue::as_u64)
            .and_then(|s| u8::try_from(s).ok())
            .ok_or_else(|| ProductError::missing(log, "support"))?;
        let weight = require_uint(log, &["weight", "votes"])?;

        let params: Vec<U256> = log
            .field(PARAMS_DECODED)
            .and_then(FieldValue::as_array)
            .map(|items| items.iter().filter_map(FieldValue::as_uint).collect())
            .unwrap_or_default();

        let aggregation = self.aggregations.entry(proposal_id).or_default();
        if params.is_empty() {
            aggregation.credit(ParamKey::NoParam, support, weight);
        } else {
            for p in &params {
                aggregation.credit(ParamKey::Option(*p), support, weight);
            }
        }

        let record = VoteRecord {
            proposal_id,
            support,
            weight,
            block_number: log.block_number,
            reason: log.string("reason").filter(|r| !r.is_empty()).map(str::to_string),
            params,
        };
        self.by_proposal.entry(proposal_id).or_default().push(record.clone());
        self.by_voter.entry(voter.clone()).or_default().push(record);
        self.participated.entry(voter.clone()).or_default().insert(proposal_id);

        let latest = self.latest_block.entry(voter).or_insert(log.block_number);
        *latest = (*latest).max(log.block_number);
        self.total += 1;
        Ok(())
    }
}

impl DataProduct for Votes {
    fn name(&self) -> &'static str {
        "votes"
    }

    fn handle(&mut self, event: &FeedEvent) -> Result<(), ProductError> {
        match event {
            FeedEvent::Block(_) => Ok(()),
            FeedEvent::Log(log)
                if matches!(log.signature, Signature::VoteCast | Signature::VoteCastWithParams) =>
            {
                self.apply(log)
            }
            FeedEvent::Log(log) => Err(unexpected(self.name(), log.signature)),
        }
    }

    fn summary(&self) -> serde_json::Value {
        json!({
            "votes": self.total,
            "voters": self.voter_count(),
            "proposals": self.by_proposal.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOV: &str = "0xcdf27f107725988f2261ce2256bdfcde8b382b10";
    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";

    fn vote(sig: Signature, block: u64, proposal: u64, support: u64, weight: u64) -> LogEvent {
        LogEvent::new(10, GOV, sig, block, 0, 0)
            .with_field("voter", FieldValue::Address(ALICE.into()))
            .with_field("proposal_id", FieldValue::Uint(U256::from(proposal)))
            .with_field("support", FieldValue::Uint(U256::from(support)))
            .with_field("weight", FieldValue::Uint(U256::from(weight)))
            .with_field("reason", FieldValue::Str(String::new()))
    }

    #[test]
    fn plain_vote_credits_no_param() {
        let mut v = Votes::new();
        v.handle(&FeedEvent::Log(vote(Signature::VoteCast, 10, 1, 1, 500))).unwrap();
        let agg = v.aggregation(U256::from(1u64)).unwrap();
        assert_eq!(agg.weight(ParamKey::NoParam, 1), U256::from(500u64));
        assert_eq!(agg.cells(), 1);
        assert!(v.has_voted(ALICE, U256::from(1u64)));
        assert!(!v.has_voted(ALICE, U256::from(2u64)));
        assert_eq!(v.votes_by_voter(ALICE)[0].reason, None);
    }

    #[test]
    fn params_fan_out_to_every_option() {
        let mut v = Votes::new();
        let params = vec![
            FieldValue::Uint(U256::from(0u64)),
            FieldValue::Uint(U256::from(2u64)),
            FieldValue::Uint(U256::from(5u64)),
        ];
        let ev = vote(Signature::VoteCastWithParams, 10, 7, 1, 40)
            .with_field(PARAMS_DECODED, FieldValue::Array(params));
        v.handle(&FeedEvent::Log(ev)).unwrap();

        let agg = v.aggregation(U256::from(7u64)).unwrap();
        assert_eq!(agg.cells(), 3);
        for k in [0u64, 2, 5] {
            assert_eq!(agg.weight(ParamKey::Option(U256::from(k)), 1), U256::from(40u64));
        }
        assert_eq!(agg.weight(ParamKey::NoParam, 1), U256::ZERO);
        assert_eq!(
            agg.to_json(),
            json!({"0": {"1": "40"}, "2": {"1": "40"}, "5": {"1": "40"}})
        );
    }

    #[test]
    fn compound_votes_field_and_latest_block() {
        let mut v = Votes::new();
        let mut ev = vote(Signature::VoteCast, 30, 1, 0, 0);
        ev.fields.shift_remove("weight");
        ev.fields.insert("votes".into(), FieldValue::Uint(U256::from(9u64)));
        v.handle(&FeedEvent::Log(ev)).unwrap();
        v.handle(&FeedEvent::Log(vote(Signature::VoteCast, 20, 2, 2, 1))).unwrap();

        assert_eq!(v.latest_vote_block(ALICE), Some(30));
        assert_eq!(v.votes_for_proposal(U256::from(1u64))[0].weight, U256::from(9u64));
        assert_eq!(v.votes_by_voter(ALICE).len(), 2);
        assert_eq!(v.voter_count(), 1);
    }

    #[test]
    fn compact_record_serialization() {
        let r = VoteRecord {
            proposal_id: U256::from(3u64),
            support: 1,
            weight: U256::from(10u64),
            block_number: 99,
            reason: None,
            params: vec![],
        };
        let s = serde_json::to_value(&r).unwrap();
        assert_eq!(s["s"], 1);
        assert_eq!(s["b"], 99);
        assert!(s.get("r").is_none());
        assert!(s.get("voter").is_none());
    }

    #[test]
    fn wrong_signature_rejected() {
        let mut v = Votes::new();
        let ev = LogEvent::new(10, GOV, Signature::ProposalExecuted, 1, 0, 0);
        assert!(matches!(
            v.handle(&FeedEvent::Log(ev)),
            Err(ProductError::UnexpectedSignature { .. })
        ));
    }
}
