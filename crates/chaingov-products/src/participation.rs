//! Delegate participation rate, derived from Proposals, Delegations and Votes.

use alloy_primitives::U256;
use std::collections::HashMap;
use tracing::debug;

use crate::{Delegations, Proposals, Votes};

/// `(voted, eligible)` proposal counts.
pub type Tally = (u64, u64);

/// Per-delegatee participation over the tracked proposals.
///
/// The completed and future parts are tallied separately and only recomputed
/// when the tracker reports a change to the matching list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipationRate {
    completed: HashMap<String, Tally>,
    future: HashMap<String, Tally>,
    refreshes: u64,
}

impl ParticipationRate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute whichever part changed since the last call. Returns `true`
    /// if anything was recomputed.
    pub fn refresh(&mut self, proposals: &mut Proposals, delegations: &Delegations, votes: &Votes) -> bool {
        let (future_changed, completed_changed) = proposals.take_tracker_changes();
        if completed_changed {
            let ids: Vec<U256> = proposals.tracker().recently_completed().collect();
            self.completed = tally(&ids, proposals, delegations, votes);
        }
        if future_changed {
            let ids: Vec<U256> = proposals.tracker().ending_in_future().collect();
            self.future = tally(&ids, proposals, delegations, votes);
        }
        let changed = future_changed || completed_changed;
        if changed {
            self.refreshes += 1;
            debug!(
                completed = self.completed.len(),
                future = self.future.len(),
                "participation recomputed"
            );
        }
        changed
    }

    /// Summed over both parts.
    pub fn fraction(&self, delegatee: &str) -> Tally {
        let key = delegatee.to_ascii_lowercase();
        let (cv, ce) = self.completed.get(&key).copied().unwrap_or_default();
        let (fv, fe) = self.future.get(&key).copied().unwrap_or_default();
        (cv + fv, ce + fe)
    }

    /// `voted / eligible`, zero when never eligible.
    pub fn rate(&self, delegatee: &str) -> f64 {
        match self.fraction(delegatee) {
            (_, 0) => 0.0,
            (voted, eligible) => voted as f64 / eligible as f64,
        }
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes
    }
}

fn tally(
    ids: &[U256],
    proposals: &Proposals,
    delegations: &Delegations,
    votes: &Votes,
) -> HashMap<String, Tally> {
    let mut out: HashMap<String, Tally> = HashMap::new();
    for id in ids {
        let Some(proposal) = proposals.get(*id) else {
            continue;
        };
        for (delegatee, _) in delegations.delegatees_with_vp_at(proposal.start_block) {
            let entry = out.entry(delegatee.to_string()).or_default();
            if votes.has_voted(delegatee, *id) {
                entry.0 += 1;
            }
            entry.1 += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataProduct;
    use chaingov_core::{BlockEvent, FeedEvent, FieldValue, GovernorFamily, LogEvent, Signature};
    use std::collections::BTreeMap;

    const TOKEN: &str = "0x4200000000000000000000000000000000000042";
    const GOV: &str = "0xcdf27f107725988f2261ce2256bdfcde8b382b10";
    const A: &str = "0x000000000000000000000000000000000000000a";
    const B: &str = "0x000000000000000000000000000000000000000b";

    fn uint(n: u64) -> FieldValue {
        FieldValue::Uint(U256::from(n))
    }

    fn vp(block: u64, delegate: &str, v: u64) -> FeedEvent {
        FeedEvent::Log(
            LogEvent::new(10, TOKEN, Signature::DelegateVotesChanged, block, 0, 0)
                .with_field("delegate", FieldValue::Address(delegate.into()))
                .with_field("previous_balance", uint(0))
                .with_field("new_balance", uint(v)),
        )
    }

    fn created(id: u64, start: u64, end: u64) -> FeedEvent {
        FeedEvent::Log(
            LogEvent::new(10, GOV, Signature::ProposalCreated, start - 1, 0, 0)
                .with_field("proposal_id", uint(id))
                .with_field("vote_start", uint(start))
                .with_field("vote_end", uint(end)),
        )
    }

    fn vote(block: u64, voter: &str, id: u64) -> FeedEvent {
        FeedEvent::Log(
            LogEvent::new(10, GOV, Signature::VoteCast, block, 0, 0)
                .with_field("voter", FieldValue::Address(voter.into()))
                .with_field("proposal_id", uint(id))
                .with_field("support", uint(1))
                .with_field("weight", uint(1)),
        )
    }

    fn block(n: u64) -> FeedEvent {
        FeedEvent::Block(BlockEvent { chain_id: 10, block_number: n, timestamp: 1_700_000_000 + n })
    }

    #[test]
    fn lazy_recompute_over_both_lists() {
        let mut delegations = Delegations::new(false);
        let mut proposals = Proposals::new(GovernorFamily::Oz, BTreeMap::new());
        let mut votes = Votes::new();
        let mut rate = ParticipationRate::new();

        delegations.handle(&vp(5, A, 100)).unwrap();
        delegations.handle(&vp(5, B, 50)).unwrap();
        proposals.handle(&created(1, 10, 20)).unwrap();
        proposals.handle(&created(2, 30, 40)).unwrap();
        votes.handle(&vote(15, A, 1)).unwrap();

        assert!(rate.refresh(&mut proposals, &delegations, &votes));
        assert_eq!(rate.fraction(A), (1, 2));
        assert_eq!(rate.fraction(B), (0, 2));

        // Nothing changed in the tracker: no recompute, even though a vote landed.
        votes.handle(&vote(35, A, 2)).unwrap();
        assert!(!rate.refresh(&mut proposals, &delegations, &votes));
        assert_eq!(rate.fraction(A), (1, 2));

        // Proposal 1 completes: both lists change.
        proposals.handle(&block(21)).unwrap();
        assert!(rate.refresh(&mut proposals, &delegations, &votes));
        assert_eq!(rate.fraction(A), (2, 2));
        assert_eq!(rate.rate(A), 1.0);
        assert_eq!(rate.rate(B), 0.0);
        assert_eq!(rate.refreshes(), 2);
    }

    #[test]
    fn delegatee_without_vp_at_start_is_not_eligible() {
        let mut delegations = Delegations::new(false);
        let mut proposals = Proposals::new(GovernorFamily::Oz, BTreeMap::new());
        let votes = Votes::new();
        let mut rate = ParticipationRate::new();

        proposals.handle(&created(1, 10, 20)).unwrap();
        delegations.handle(&vp(11, A, 100)).unwrap();
        rate.refresh(&mut proposals, &delegations, &votes);
        assert_eq!(rate.fraction(A), (0, 0));
        assert_eq!(rate.rate(A), 0.0);
    }
}
