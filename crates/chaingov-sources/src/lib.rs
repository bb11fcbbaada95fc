//! # chaingov-sources
//!
//! Every way ChainGov reads governance events, behind one [`FeedClient`] trait.
//!
//! | Client | Tier | Backing |
//! |---|---|---|
//! | [`ArchiveClient`] | archive | append-only CSV files, read from the start |
//! | [`HistoricalClient`] | archive | paginated `eth_getLogs` with range splitting |
//! | [`DatabaseClient`] | archive or polling | batched Postgres range queries |
//! | [`RealtimeClient`] | realtime | websocket `eth_subscribe` pushes |
//!
//! Clients are planned with stream keys, then `read(after)` yields
//! [`FeedItem`]s in non-decreasing order key for their chain.

pub mod archive;
pub mod client;
pub mod database;
pub mod error;
pub mod historical;
pub mod realtime;
pub mod rpc;
pub mod subscriptions;

pub use archive::ArchiveClient;
pub use client::{FeedClient, FeedItem, ItemStream, PlanSet, Plannable, Timeliness};
pub use database::DatabaseClient;
pub use error::{ClientError, TransportError};
pub use historical::{HistoricalClient, Paging};
pub use realtime::RealtimeClient;
