//! # chaingov-codec
//!
//! Event normalizer: turns a raw source record into a canonical
//! [`FeedEvent`](chaingov_core::FeedEvent).
//!
//! ## Sources
//! - archive CSV rows and database rows (`::text` columns) → [`row`]
//! - JSON-RPC `eth_getLogs` results and websocket `logs` pushes → [`rpc`]
//! - block rows and `newHeads` headers → block events
//!
//! Every path coerces fields by their ABI type and holds one convention:
//! addresses and bytes are lowercase, `0x`-prefixed hex. A field that fails
//! coercion is logged and kept as a raw string; it never drops the event.

pub mod error;
pub mod module;
pub mod normalizer;
pub mod params;
pub mod repair;
pub mod row;
pub mod rpc;
pub mod text;
pub mod value;

pub use error::NormalizeError;
pub use module::{ApprovalOption, ApprovalSettings, ModulePayload, OptimisticSettings};
pub use normalizer::Normalizer;
pub use row::TextRow;
pub use rpc::{RpcBlockHeader, RpcLog};
