//! # Broker Core
//!
//! Data model and wire protocol for the broker overlay:
//! - Peer ids, topics, and canonical subscription filters
//! - Polymorphic `Data` values with a total order
//! - Store commands and the message envelopes exchanged between endpoints
//! - The little-endian binary wire codec and frame helpers
//! - Configuration loading and the tracing bootstrap

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod config;
pub mod data;
pub mod error;
pub mod message;
pub mod telemetry;
pub mod topic;
pub mod types;
pub mod wire;

pub use command::Command;
pub use config::Config;
pub use data::{Data, DataKind, Port, Protocol, Subnet};
pub use error::{Error, Result};
pub use message::{
    CommandMessage, DataMessage, NodeContent, NodeMessage, PeerMessage, SubscriptionUpdate,
};
pub use topic::{Filter, Topic};
pub use types::{LogicalTime, PeerId, Timespan};
