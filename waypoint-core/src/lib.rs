//! # waypoint-core
//!
//! Subscription engine for the waypoint gateway.
//!
//! This crate provides:
//! - Connection registry with delivery metadata
//! - Time-boxed, single-use access grant stores
//! - The authoritative character/map subscription state machine
//! - Subscription statistics and the per-system view formatter
//!
//! Everything here is plain in-memory state owned by one
//! [`SubscriptionEngine`] value; transports live in `waypoint-server`.

pub mod access;
pub mod engine;
pub mod registry;
pub mod stats;
pub mod time;

pub use access::AccessTokenStore;
pub use engine::{EventLog, SubscribeOutcome, SubscriptionEngine, TracingEventLog};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use stats::SubscriptionStats;

/// Expiry window for freshly issued access grants, in seconds.
pub const GRANT_TTL_SECS: i64 = 30;
