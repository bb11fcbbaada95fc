//! Product errors. All of them are fatal for the stream that produced the
//! event: they mean a dispatch misconfiguration or an ordering violation.

use alloy_primitives::U256;
use chaingov_core::LogEvent;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProductError {
    #[error("{signature} at block {block} is missing field '{field}'")]
    MissingField {
        signature: String,
        field: String,
        block: u64,
    },

    #[error("{signature} at block {block} references unknown proposal {id}")]
    UnknownProposal {
        signature: String,
        id: U256,
        block: u64,
    },

    #[error("{signature} at block {block} references unknown proposal type {id}")]
    UnknownProposalType {
        signature: String,
        id: u64,
        block: u64,
    },

    #[error("{product} does not handle {signature}")]
    UnexpectedSignature {
        product: &'static str,
        signature: String,
    },

    #[error("Participation tracker integrity violated: {0}")]
    Integrity(String),
}

impl ProductError {
    pub(crate) fn missing(log: &LogEvent, field: &str) -> Self {
        ProductError::MissingField {
            signature: log.signature.to_string(),
            field: field.to_string(),
            block: log.block_number,
        }
    }
}
