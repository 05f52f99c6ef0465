//! # Broker Overlay
//!
//! The application-layer routing core of the broker: a per-endpoint routing
//! table, branching source routes (multipaths), and the `Peer` state machine
//! implementing subscription flooding, loop avoidance, TTL tracking, and the
//! bucketed shortest-path forwarding decision.
//!
//! Everything in this crate is synchronous and deterministic; the owning
//! runtime drives it through [`peer::PeerActions`].

#![warn(clippy::all)]

pub mod multipath;
pub mod peer;
pub mod routing;

pub use multipath::Multipath;
pub use peer::{Peer, PeerActions, MAX_PATH_LENGTH};
pub use routing::{RoutingTable, RoutingTableEntry};
