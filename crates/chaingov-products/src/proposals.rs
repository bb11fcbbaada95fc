//! Proposal lifecycle, voting-module resolution and the participation tracker.

use alloy_primitives::U256;
use chaingov_codec::module::{decode_payload, infer_module};
use chaingov_codec::value::decode_hex;
use chaingov_codec::ModulePayload;
use chaingov_core::{FeedEvent, GovernorFamily, LogEvent, Signature, VotingModuleKind};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::tracker::ParticipationRateStateTracker;
use crate::{require_uint, unexpected, DataProduct, ProductError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Active,
    Ended,
    Canceled,
    Queued,
    Executed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalFilter {
    All,
    Active,
    Ended,
    Canceled,
    Queued,
    Executed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Proposal {
    pub id: U256,
    pub proposer: Option<String>,
    pub start_block: u64,
    pub end_block: u64,
    pub proposal_type: Option<u64>,
    /// Module contract address, module-based proposals only.
    pub voting_module: Option<String>,
    pub voting_module_name: &'static str,
    pub decoded_proposal_data: Option<ModulePayload>,
    pub canceled: bool,
    pub queued: bool,
    pub executed: bool,
    pub eta: Option<U256>,
    #[serde(skip)]
    pub create_event: LogEvent,
}

impl Proposal {
    pub fn description(&self) -> Option<&str> {
        self.create_event.string("description")
    }

    pub fn is_optimistic(&self) -> bool {
        self.voting_module_name == VotingModuleKind::Optimistic.name()
    }

    /// Derived from lifecycle flags, then from the block cursor.
    pub fn status(&self, current_block: u64) -> ProposalStatus {
        if self.canceled {
            ProposalStatus::Canceled
        } else if self.executed {
            ProposalStatus::Executed
        } else if self.queued {
            ProposalStatus::Queued
        } else if current_block < self.start_block {
            ProposalStatus::Pending
        } else if current_block <= self.end_block {
            ProposalStatus::Active
        } else {
            ProposalStatus::Ended
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposals {
    family: GovernorFamily,
    modules: BTreeMap<String, VotingModuleKind>,
    proposals: HashMap<U256, Proposal>,
    /// Creation order.
    order: Vec<U256>,
    current_block: u64,
    tracker: ParticipationRateStateTracker,
}

impl Proposals {
    pub fn new(family: GovernorFamily, modules: BTreeMap<String, VotingModuleKind>) -> Self {
        let modules = modules
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            family,
            modules,
            proposals: HashMap::new(),
            order: Vec::new(),
            current_block: 0,
            tracker: ParticipationRateStateTracker::new(),
        }
    }

    // ─── Queries ──────────────────────────────────────────────────────────────

    pub fn get(&self, id: U256) -> Option<&Proposal> {
        self.proposals.get(&id)
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    pub fn status(&self, id: U256) -> Option<ProposalStatus> {
        self.get(id).map(|p| p.status(self.current_block))
    }

    /// Proposals in creation order, filtered.
    pub fn list(&self, filter: ProposalFilter) -> Vec<&Proposal> {
        self.order
            .iter()
            .filter_map(|id| self.proposals.get(id))
            .filter(|p| {
                let status = p.status(self.current_block);
                match filter {
                    ProposalFilter::All => true,
                    ProposalFilter::Active => status == ProposalStatus::Active,
                    ProposalFilter::Ended => status == ProposalStatus::Ended,
                    ProposalFilter::Canceled => p.canceled,
                    ProposalFilter::Queued => p.queued,
                    ProposalFilter::Executed => p.executed,
                }
            })
            .collect()
    }

    pub fn current_block(&self) -> u64 {
        self.current_block
    }

    pub fn tracker(&self) -> &ParticipationRateStateTracker {
        &self.tracker
    }

    /// Clear and return the tracker's change flags.
    pub fn take_tracker_changes(&mut self) -> (bool, bool) {
        self.tracker.take_changes()
    }

    // ─── Handlers ─────────────────────────────────────────────────────────────

    fn id_of(&self, log: &LogEvent) -> Result<U256, ProductError> {
        let preferred = self.family.proposal_id_field();
        require_uint(log, &[preferred, "proposal_id", "id"])
    }

    fn window_of(&self, log: &LogEvent) -> Result<(u64, u64), ProductError> {
        let (start, end) = self.family.window_fields();
        let start = require_uint(log, &[start, "start_block", "vote_start"])?;
        let end = require_uint(log, &[end, "end_block", "vote_end"])?;
        Ok((saturate(start), saturate(end)))
    }

    fn on_created(&mut self, log: &LogEvent) -> Result<(), ProductError> {
        let id = self.id_of(log)?;
        let (start_block, end_block) = self.window_of(log)?;

        let (voting_module, kind, decoded) = match log.address("voting_module") {
            Some(module) => {
                let data = log
                    .field("proposal_data")
                    .and_then(|f| f.as_hex())
                    .and_then(|h| decode_hex(h).ok())
                    .unwrap_or_default();
                let kind = self.resolve_module(module, &data, log);
                let decoded = match decode_payload(kind, &data) {
                    Ok(d) => d,
                    Err(reason) => {
                        warn!(%id, module = kind.name(), %reason, "could not decode proposal data");
                        None
                    }
                };
                (Some(module.to_string()), kind, decoded)
            }
            None => (None, VotingModuleKind::Standard, None),
        };

        if self.proposals.contains_key(&id) {
            warn!(%id, block = log.block_number, "proposal created twice; replacing");
        } else {
            self.order.push(id);
        }
        let proposal = Proposal {
            id,
            proposer: log.address("proposer").map(str::to_string),
            start_block,
            end_block,
            proposal_type: log.field("proposal_type").and_then(|f| f.as_u64()),
            voting_module,
            voting_module_name: kind.name(),
            decoded_proposal_data: decoded,
            canceled: false,
            queued: false,
            executed: false,
            eta: None,
            create_event: log.clone(),
        };
        debug!(%id, start_block, end_block, module = kind.name(), "proposal created");
        self.proposals.insert(id, proposal);

        if kind != VotingModuleKind::Optimistic {
            self.tracker.track(id, end_block);
            self.tracker.advance(self.current_block);
        }
        Ok(())
    }

    fn resolve_module(&self, module: &str, data: &[u8], log: &LogEvent) -> VotingModuleKind {
        if let Some(kind) = self.modules.get(module) {
            return *kind;
        }
        if self.family.infers_modules() {
            if let Some(kind) = infer_module(data) {
                return kind;
            }
        }
        warn!(module, block = log.block_number, "unknown voting module; treating as standard");
        VotingModuleKind::Standard
    }

    fn lifecycle(&mut self, log: &LogEvent) -> Result<&mut Proposal, ProductError> {
        let id = self.id_of(log)?;
        self.proposals
            .get_mut(&id)
            .ok_or_else(|| ProductError::UnknownProposal {
                signature: log.signature.to_string(),
                id,
                block: log.block_number,
            })
    }

    fn on_canceled(&mut self, log: &LogEvent) -> Result<(), ProductError> {
        let proposal = self.lifecycle(log)?;
        proposal.canceled = true;
        let id = proposal.id;
        self.tracker.cancel(id);

        // Cancellation can change which proposals count as recently completed.
        let eligible: Vec<(U256, u64)> = self
            .proposals
            .values()
            .filter(|p| !p.canceled && !p.is_optimistic())
            .map(|p| (p.id, p.end_block))
            .collect();
        self.tracker.rebuild(eligible, self.current_block);
        self.tracker.check_integrity()
    }
}

fn saturate(v: U256) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

impl DataProduct for Proposals {
    fn name(&self) -> &'static str {
        "proposals"
    }

    fn handle(&mut self, event: &FeedEvent) -> Result<(), ProductError> {
        let log = match event {
            FeedEvent::Block(b) => {
                self.current_block = b.block_number;
                self.tracker.advance(b.block_number);
                return Ok(());
            }
            FeedEvent::Log(log) => log,
        };
        match log.signature {
            s if s.is_proposal_created() => self.on_created(log),
            Signature::ProposalQueued => {
                let eta = log.uint("eta");
                let p = self.lifecycle(log)?;
                p.queued = true;
                p.eta = eta;
                Ok(())
            }
            Signature::ProposalExecuted => {
                self.lifecycle(log)?.executed = true;
                Ok(())
            }
            Signature::ProposalCanceled => self.on_canceled(log),
            other => Err(unexpected(self.name(), other)),
        }
    }

    fn summary(&self) -> serde_json::Value {
        json!({
            "proposals": self.len(),
            "active": self.list(ProposalFilter::Active).len(),
            "ending_in_future": self.tracker.future_len(),
            "recently_completed": self.tracker.completed_len(),
            "current_block": self.current_block,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaingov_core::{BlockEvent, FieldValue};

    const GOV: &str = "0xcdf27f107725988f2261ce2256bdfcde8b382b10";
    const OPTIMISTIC: &str = "0x27964c5f4f389b8399036e1076d84c6984576c33";

    fn block(n: u64) -> FeedEvent {
        FeedEvent::Block(BlockEvent { chain_id: 10, block_number: n, timestamp: n * 2 })
    }

    fn uint(n: u64) -> FieldValue {
        FieldValue::Uint(U256::from(n))
    }

    fn created(id: u64, start: u64, end: u64) -> FeedEvent {
        FeedEvent::Log(
            LogEvent::new(10, GOV, Signature::ProposalCreated, start.saturating_sub(1), 0, 0)
                .with_field("proposal_id", uint(id))
                .with_field("proposer", FieldValue::Address("0x01".into()))
                .with_field("vote_start", uint(start))
                .with_field("vote_end", uint(end))
                .with_field("description", FieldValue::Str(format!("P{id}"))),
        )
    }

    fn simple(sig: Signature, id: u64, at: u64) -> FeedEvent {
        FeedEvent::Log(LogEvent::new(10, GOV, sig, at, 0, 0).with_field("proposal_id", uint(id)))
    }

    fn oz() -> Proposals {
        Proposals::new(GovernorFamily::Oz, BTreeMap::new())
    }

    #[test]
    fn lifecycle_and_status() {
        let mut p = oz();
        p.handle(&block(10)).unwrap();
        p.handle(&created(1, 20, 30)).unwrap();
        assert_eq!(p.status(U256::from(1u64)), Some(ProposalStatus::Pending));
        p.handle(&block(25)).unwrap();
        assert_eq!(p.status(U256::from(1u64)), Some(ProposalStatus::Active));
        p.handle(&block(31)).unwrap();
        assert_eq!(p.status(U256::from(1u64)), Some(ProposalStatus::Ended));
        p.handle(&simple(Signature::ProposalQueued, 1, 32)).unwrap();
        assert_eq!(p.status(U256::from(1u64)), Some(ProposalStatus::Queued));
        p.handle(&simple(Signature::ProposalExecuted, 1, 40)).unwrap();
        assert_eq!(p.list(ProposalFilter::Executed).len(), 1);
        assert_eq!(p.get(U256::from(1u64)).unwrap().description(), Some("P1"));
    }

    #[test]
    fn unknown_id_is_fatal() {
        let mut p = oz();
        let err = p.handle(&simple(Signature::ProposalExecuted, 9, 5)).unwrap_err();
        assert!(matches!(err, ProductError::UnknownProposal { .. }));
    }

    #[test]
    fn compound_naming() {
        let mut p = Proposals::new(GovernorFamily::Compound, BTreeMap::new());
        let ev = LogEvent::new(1, GOV, Signature::ProposalCreated, 5, 0, 0)
            .with_field("id", uint(3))
            .with_field("start_block", uint(6))
            .with_field("end_block", uint(9));
        p.handle(&FeedEvent::Log(ev)).unwrap();
        p.handle(&FeedEvent::Log(
            LogEvent::new(1, GOV, Signature::ProposalCanceled, 7, 0, 0).with_field("id", uint(3)),
        ))
        .unwrap();
        assert_eq!(p.list(ProposalFilter::Canceled).len(), 1);
    }

    #[test]
    fn cancel_recomputes_completed_set() {
        let mut p = oz();
        for n in 1..=12u64 {
            p.handle(&created(n, n * 10, n * 10 + 5)).unwrap();
        }
        p.handle(&block(1_000)).unwrap();
        let completed: Vec<_> = p.tracker().recently_completed().collect();
        assert_eq!(completed.len(), 10);
        assert_eq!(completed[0], U256::from(3u64));

        // Canceling a counted proposal lets an older one back in.
        p.handle(&simple(Signature::ProposalCanceled, 7, 1_001)).unwrap();
        let completed: Vec<_> = p.tracker().recently_completed().collect();
        assert_eq!(completed.len(), 10);
        assert_eq!(completed[0], U256::from(2u64));
        assert!(!completed.contains(&U256::from(7u64)));
    }

    #[test]
    fn optimistic_module_not_tracked() {
        let mut modules = BTreeMap::new();
        modules.insert(OPTIMISTIC.to_string(), VotingModuleKind::Optimistic);
        let mut p = Proposals::new(GovernorFamily::Agora, modules);
        let ev = LogEvent::new(10, GOV, Signature::ProposalCreatedModule, 5, 0, 0)
            .with_field("proposal_id", uint(77))
            .with_field("proposer", FieldValue::Address("0x01".into()))
            .with_field("voting_module", FieldValue::Address(OPTIMISTIC.into()))
            .with_field("proposal_data", FieldValue::Bytes(format!("0x{:064x}{:064x}", 5000, 1)))
            .with_field("start_block", uint(10))
            .with_field("end_block", uint(20))
            .with_field("description", FieldValue::Str("opt".into()))
            .with_field("proposal_type", uint(2));
        p.handle(&FeedEvent::Log(ev)).unwrap();
        let proposal = p.get(U256::from(77u64)).unwrap();
        assert!(proposal.is_optimistic());
        assert_eq!(proposal.proposal_type, Some(2));
        assert!(proposal.decoded_proposal_data.is_some());
        assert_eq!(p.tracker().future_len(), 0);
    }

    #[test]
    fn module_inferred_for_agora() {
        let mut p = Proposals::new(GovernorFamily::Agora, BTreeMap::new());
        let ev = LogEvent::new(10, GOV, Signature::ProposalCreatedModuleNoType, 5, 0, 0)
            .with_field("proposal_id", uint(78))
            .with_field("voting_module", FieldValue::Address("0x00000000000000000000000000000000000000ff".into()))
            .with_field("proposal_data", FieldValue::Bytes(format!("0x{:064x}{:064x}", 100, 0)))
            .with_field("start_block", uint(10))
            .with_field("end_block", uint(20));
        p.handle(&FeedEvent::Log(ev)).unwrap();
        assert_eq!(p.get(U256::from(78u64)).unwrap().voting_module_name, "optimistic");
    }
}
