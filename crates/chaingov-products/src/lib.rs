//! # chaingov-products
//!
//! The data products: incremental state machines that fold canonical events
//! into queryable governance state.
//!
//! | Product | Folds |
//! |---|---|
//! | [`Balances`] | `Transfer` |
//! | [`Delegations`] | blocks, `DelegateChanged` (both shapes), `DelegateVotesChanged` |
//! | [`Proposals`] | blocks, `ProposalCreated` (all shapes), queued / executed / canceled |
//! | [`Votes`] | `VoteCast`, `VoteCastWithParams` |
//! | [`ProposalTypes`] | `ProposalTypeSet` (both shapes), scope events |
//!
//! [`ParticipationRate`] is derived from Proposals, Delegations and Votes and
//! recomputed lazily.
//!
//! Each product has exactly one writer, the dispatch path, which reaches it
//! through a [`SharedProduct`] write lock. Readers take the read lock; every
//! `handle` call mutates under one lock acquisition, so a reader never sees a
//! half-applied event.

pub mod balances;
pub mod delegations;
pub mod error;
pub mod participation;
pub mod proposal_types;
pub mod proposals;
pub mod tracker;
pub mod votes;

use chaingov_core::{FeedEvent, LogEvent, Signature};
use std::sync::{Arc, RwLock};

pub use balances::Balances;
pub use delegations::Delegations;
pub use error::ProductError;
pub use participation::ParticipationRate;
pub use proposal_types::{ProposalType, ProposalTypes, Scope};
pub use proposals::{Proposal, ProposalFilter, ProposalStatus, Proposals};
pub use tracker::ParticipationRateStateTracker;
pub use votes::{ParamKey, VoteAggregation, VoteRecord, Votes};

/// An incremental state machine over canonical events.
pub trait DataProduct: Send + Sync {
    /// Stable product name, used in logs and status output.
    fn name(&self) -> &'static str;

    /// Apply one event. An error is fatal for the stream that produced it.
    fn handle(&mut self, event: &FeedEvent) -> Result<(), ProductError>;

    /// Small JSON summary for status output.
    fn summary(&self) -> serde_json::Value;
}

/// A product shared between its single writer and any number of readers.
pub type SharedProduct = Arc<RwLock<dyn DataProduct>>;

/// Wrap a product for sharing; keep the typed handle for reads.
pub fn share<P: DataProduct + 'static>(product: P) -> Arc<RwLock<P>> {
    Arc::new(RwLock::new(product))
}

/// Lookup helpers shared by products.
pub(crate) fn require_address<'a>(
    log: &'a LogEvent,
    field: &str,
) -> Result<&'a str, ProductError> {
    log.address(field).ok_or_else(|| ProductError::missing(log, field))
}

pub(crate) fn require_uint(
    log: &LogEvent,
    fields: &[&str],
) -> Result<alloy_primitives::U256, ProductError> {
    fields
        .iter()
        .find_map(|f| log.uint(f))
        .ok_or_else(|| ProductError::missing(log, &fields.join("|")))
}

pub(crate) fn unexpected(product: &'static str, signature: Signature) -> ProductError {
    ProductError::UnexpectedSignature {
        product,
        signature: signature.to_string(),
    }
}
