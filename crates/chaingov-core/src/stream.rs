//! Stream keys: the unit of subscription and watermarking.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::signature::Signature;

/// `chain.address.signature` for contract logs, `chain.blocks` for headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKey {
    Log {
        chain_id: u64,
        address: String,
        signature: Signature,
    },
    Blocks {
        chain_id: u64,
    },
}

impl StreamKey {
    /// Build a log stream key; the address is lowercased.
    pub fn log(chain_id: u64, address: &str, signature: Signature) -> Self {
        Self::Log {
            chain_id,
            address: address.to_ascii_lowercase(),
            signature,
        }
    }

    pub fn blocks(chain_id: u64) -> Self {
        Self::Blocks { chain_id }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Self::Log { chain_id, .. } | Self::Blocks { chain_id } => *chain_id,
        }
    }

    pub fn is_blocks(&self) -> bool {
        matches!(self, Self::Blocks { .. })
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log { chain_id, address, signature } => {
                write!(f, "{chain_id}.{address}.{signature}")
            }
            Self::Blocks { chain_id } => write!(f, "{chain_id}.blocks"),
        }
    }
}
