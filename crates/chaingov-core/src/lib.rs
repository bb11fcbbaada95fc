//! chaingov-core: shared foundation for the ChainGov governance engine.
//!
//! # Architecture
//!
//! ```text
//! FeedClient (archive / historical RPC / websocket / database)
//!      │  raw rows, logs, frames
//!      ▼
//! Normalizer ──► FeedEvent (Block | Log)      ← this crate defines the model
//!      │
//!      ▼
//! DispatchTable[StreamKey] ──► DataProducts (balances, delegations, proposals, votes, types)
//! ```
//!
//! This crate owns the canonical event model, stream keys, the signature
//! registry, and the deployment descriptor every other crate is configured from.

pub mod config;
pub mod error;
pub mod event;
pub mod signature;
pub mod stream;

pub use config::{
    ChainDeployment, DeploymentConfig, FeedConfig, GovernorFamily, LogConfig, TokenKind,
    VotingModuleKind,
};
pub use error::{ConfigError, SignatureError};
pub use event::{BlockEvent, FeedEvent, FieldMap, FieldValue, LogEvent, OrderKey};
pub use signature::{AbiVariant, Signature};
pub use stream::StreamKey;

/// The zero address, used as the "no delegate" / mint / burn sentinel.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";
