//! # chaingov-feed
//!
//! Sequencing and fan-out: takes a set of planned [`FeedClient`]s, drains them
//! in timeliness order and applies every event exactly once to the data
//! products subscribed to its stream.
//!
//! ```text
//! clients ──► EventFeed ──► Watermarks (per stream) ──► DispatchTable ──► products
//!              boot: archive tier, one after another
//!              run:  one task per polling / realtime client
//! ```
//!
//! [`build`] wires everything from a [`chaingov_core::DeploymentConfig`].
//!
//! [`FeedClient`]: chaingov_sources::FeedClient

pub mod dispatch;
pub mod error;
pub mod feed;
pub mod status;
pub mod wiring;

pub use dispatch::DispatchTable;
pub use error::FeedError;
pub use feed::{BatchHook, DrainStats, EventFeed, ShutdownHandle};
pub use status::{ClientStatus, FeedStatus, Phase, StreamState, StreamStatus, Watermarks};
pub use wiring::{build, clients_for, Deployment, Governance};
