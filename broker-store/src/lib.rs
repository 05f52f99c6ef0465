//! # Broker Store
//!
//! Replicated key-value stores on top of the broker overlay. A *master* owns
//! the authoritative contents of a named store and interprets every command
//! published on its topic; *clones* mirror the master, stay eventually
//! consistent through the master's broadcast order, and resync with full
//! snapshots when they boot or go stale.
//!
//! Each store is one tokio task. Stores talk to the overlay exclusively
//! through a [`StoreRelay`]; the endpoint wires the channels.

#![warn(clippy::all)]

mod clone;
mod frontend;
mod master;
mod mutation;
mod relay;

pub use clone::{spawn_clone, CloneIntervals, CloneStatus};
pub use frontend::Store;
pub use master::spawn_master;
pub use relay::{StoreEvent, StoreRelay};
