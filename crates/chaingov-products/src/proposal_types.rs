//! Proposal-type configuration and its scopes.

use alloy_primitives::U256;
use chaingov_core::{FeedEvent, FieldValue, LogEvent, Signature};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::{require_uint, unexpected, DataProduct, ProductError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scope {
    /// `bytes24` scope key, lowercase hex.
    pub key: String,
    pub encoded_limit: Option<String>,
    pub description: Option<String>,
    pub created_block: u64,
    pub disabled: bool,
    pub deleted: bool,
}

impl Scope {
    pub fn is_active(&self) -> bool {
        !self.disabled && !self.deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProposalType {
    pub id: u64,
    pub quorum: U256,
    pub approval_threshold: U256,
    pub name: String,
    pub description: Option<String>,
    pub module: Option<String>,
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProposalTypes {
    types: BTreeMap<u64, ProposalType>,
    /// type id → `(block, snapshot)` per type-set event, ascending.
    history: HashMap<u64, Vec<(u64, ProposalType)>>,
}

impl ProposalTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64) -> Option<&ProposalType> {
        self.types.get(&id)
    }

    /// All types, by id.
    pub fn all(&self) -> impl Iterator<Item = &ProposalType> {
        self.types.values()
    }

    /// The type as last set at or before `block`.
    pub fn type_at_block(&self, id: u64, block: u64) -> Option<&ProposalType> {
        let h = self.history.get(&id)?;
        let idx = h.partition_point(|(b, _)| *b <= block);
        idx.checked_sub(1).and_then(|i| h.get(i)).map(|(_, t)| t)
    }

    pub fn active_scopes(&self, id: u64) -> Vec<&Scope> {
        self.types
            .get(&id)
            .map(|t| t.scopes.iter().filter(|s| s.is_active()).collect())
            .unwrap_or_default()
    }

    fn type_id(log: &LogEvent) -> Result<u64, ProductError> {
        let id = require_uint(log, &["proposal_type_id", "proposal_type"])?;
        u64::try_from(id).map_err(|_| ProductError::missing(log, "proposal_type_id"))
    }

    fn on_type_set(&mut self, log: &LogEvent) -> Result<(), ProductError> {
        let id = Self::type_id(log)?;
        let quorum = require_uint(log, &["quorum"])?;
        let approval_threshold = require_uint(log, &["approval_threshold"])?;
        let name = log.string("name").unwrap_or_default().to_string();

        let scopes = self.types.get(&id).map(|t| t.scopes.clone()).unwrap_or_default();
        let updated = ProposalType {
            id,
            quorum,
            approval_threshold,
            name,
            description: log.string("description").map(str::to_string),
            module: log.address("module").map(str::to_string),
            scopes,
        };
        let history = self.history.entry(id).or_default();
        let same_block = history.last().is_some_and(|(b, _)| *b == log.block_number);
        if same_block {
            history.pop();
        }
        history.push((log.block_number, updated.clone()));
        self.types.insert(id, updated);
        Ok(())
    }

    fn on_scope(&mut self, log: &LogEvent) -> Result<(), ProductError> {
        let id = Self::type_id(log)?;
        let key = log
            .field("scope_key")
            .and_then(FieldValue::as_hex)
            .ok_or_else(|| ProductError::missing(log, "scope_key"))?
            .to_string();
        let ty = self
            .types
            .get_mut(&id)
            .ok_or_else(|| ProductError::UnknownProposalType {
                signature: log.signature.to_string(),
                id,
                block: log.block_number,
            })?;

        if log.signature == Signature::ScopeCreated {
            ty.scopes.push(Scope {
                key,
                encoded_limit: log.field("encoded_limit").and_then(FieldValue::as_hex).map(str::to_string),
                description: log.string("description").map(str::to_string),
                created_block: log.block_number,
                disabled: false,
                deleted: false,
            });
            return Ok(());
        }

        let deleting = log.signature == Signature::ScopeDeleted;
        let mut matched = 0usize;
        for scope in ty.scopes.iter_mut().filter(|s| s.key == key) {
            if deleting {
                scope.deleted = true;
            } else {
                scope.disabled = true;
            }
            matched += 1;
        }
        if matched == 0 {
            warn!(type_id = id, scope = %key, signature = %log.signature, "no scope with this key");
        }
        Ok(())
    }
}

impl DataProduct for ProposalTypes {
    fn name(&self) -> &'static str {
        "proposal_types"
    }

    fn handle(&mut self, event: &FeedEvent) -> Result<(), ProductError> {
        let log = match event {
            FeedEvent::Block(_) => return Ok(()),
            FeedEvent::Log(log) => log,
        };
        match log.signature {
            Signature::ProposalTypeSet | Signature::ProposalTypeSetWithModule => {
                self.on_type_set(log)
            }
            Signature::ScopeCreated | Signature::ScopeDisabled | Signature::ScopeDeleted => {
                self.on_scope(log)
            }
            other => Err(unexpected(self.name(), other)),
        }
    }

    fn summary(&self) -> serde_json::Value {
        json!({
            "types": self.types.len(),
            "scopes": self.types.values().map(|t| t.scopes.len()).sum::<usize>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PTC: &str = "0x67ecA7B65Baf0342CE7fBf0AA15921524414C09f";
    const KEY: &str = "0x00000000000000000000000000000000000000000000abcd";

    fn uint(n: u64) -> FieldValue {
        FieldValue::Uint(U256::from(n))
    }

    fn type_set(block: u64, id: u64, quorum: u64, name: &str) -> FeedEvent {
        FeedEvent::Log(
            LogEvent::new(10, PTC, Signature::ProposalTypeSetWithModule, block, 0, 0)
                .with_field("proposal_type_id", uint(id))
                .with_field("quorum", uint(quorum))
                .with_field("approval_threshold", uint(5_100))
                .with_field("name", FieldValue::Str(name.into()))
                .with_field("description", FieldValue::Str(String::new()))
                .with_field("module", FieldValue::Address("0x0000000000000000000000000000000000000000".into())),
        )
    }

    fn scope(sig: Signature, block: u64, id: u64) -> FeedEvent {
        let mut ev = LogEvent::new(10, PTC, sig, block, 0, 0)
            .with_field("proposal_type_id", uint(id))
            .with_field("scope_key", FieldValue::Bytes(KEY.into()));
        if sig == Signature::ScopeCreated {
            ev = ev
                .with_field("encoded_limit", FieldValue::Bytes("0x01".into()))
                .with_field("description", FieldValue::Str("limit".into()));
        }
        FeedEvent::Log(ev)
    }

    #[test]
    fn upsert_preserves_scopes_and_keeps_history() {
        let mut t = ProposalTypes::new();
        t.handle(&type_set(10, 0, 3_000, "Default")).unwrap();
        t.handle(&scope(Signature::ScopeCreated, 11, 0)).unwrap();
        t.handle(&type_set(20, 0, 4_000, "Default v2")).unwrap();

        let current = t.get(0).unwrap();
        assert_eq!(current.quorum, U256::from(4_000u64));
        assert_eq!(current.scopes.len(), 1);
        assert_eq!(t.type_at_block(0, 15).unwrap().name, "Default");
        assert_eq!(t.type_at_block(0, 20).unwrap().name, "Default v2");
        assert!(t.type_at_block(0, 9).is_none());
    }

    #[test]
    fn scope_lifecycle_updates_all_matching() {
        let mut t = ProposalTypes::new();
        t.handle(&type_set(1, 2, 1, "Tiered")).unwrap();
        t.handle(&scope(Signature::ScopeCreated, 2, 2)).unwrap();
        t.handle(&scope(Signature::ScopeCreated, 3, 2)).unwrap();
        assert_eq!(t.active_scopes(2).len(), 2);

        t.handle(&scope(Signature::ScopeDisabled, 4, 2)).unwrap();
        assert!(t.active_scopes(2).is_empty());
        assert!(t.get(2).unwrap().scopes.iter().all(|s| s.disabled && !s.deleted));

        t.handle(&scope(Signature::ScopeDeleted, 5, 2)).unwrap();
        assert!(t.get(2).unwrap().scopes.iter().all(|s| s.deleted));
    }

    #[test]
    fn scope_on_unknown_type_is_fatal() {
        let mut t = ProposalTypes::new();
        let err = t.handle(&scope(Signature::ScopeCreated, 2, 9)).unwrap_err();
        assert!(matches!(err, ProductError::UnknownProposalType { id: 9, .. }));
    }
}
