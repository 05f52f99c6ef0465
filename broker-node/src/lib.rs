//! # Broker Node
//!
//! The runtime crate of the broker: it turns the pure overlay state machine
//! from `broker-overlay` into a running endpoint with a TCP transport,
//! wires in replicated stores from `broker-store`, and exposes the
//! publish/subscribe/attach façade applications program against.
//!
//! ```no_run
//! use broker_core::{Config, Filter, Topic};
//! use broker_node::Endpoint;
//!
//! #[tokio::main]
//! async fn main() -> broker_core::Result<()> {
//!     let endpoint = Endpoint::new(Config::default())?;
//!     endpoint.listen("", 9999).await?;
//!     let mut events = endpoint
//!         .make_subscriber(Filter::from_topics([Topic::new("events")?]))
//!         .await?;
//!     while let Some(msg) = events.recv().await {
//!         println!("{}: {}", msg.topic, msg.data);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

mod endpoint;
mod hub;
mod network;
mod status;
mod subscriber;

pub use endpoint::Endpoint;
pub use status::{Status, StatusCode};
pub use subscriber::Subscriber;

pub use broker_core::{Config, Data, Filter, Topic};
pub use broker_store::{CloneIntervals, Store};
