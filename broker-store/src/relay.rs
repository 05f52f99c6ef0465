//! The one-way channel from store actors into the overlay.

use broker_core::{CommandMessage, PeerId};
use tokio::sync::mpsc;

/// An outbound store-to-overlay event.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Publish a command to every matching subscriber (and local stores).
    Publish(CommandMessage),
    /// Ship a command to exactly one endpoint.
    Direct(PeerId, CommandMessage),
}

/// Cloneable sender stores use to reach the overlay. Stores never hold the
/// peer itself; dropping the hub simply disconnects them.
#[derive(Debug, Clone)]
pub struct StoreRelay {
    tx: mpsc::UnboundedSender<StoreEvent>,
}

impl StoreRelay {
    /// Wrap the hub-side sender.
    pub fn new(tx: mpsc::UnboundedSender<StoreEvent>) -> Self {
        Self { tx }
    }

    /// Create a relay plus the receiving end, for tests and hub setup.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish a command on its topic.
    pub fn publish(&self, msg: CommandMessage) {
        let _ = self.tx.send(StoreEvent::Publish(msg));
    }

    /// Ship a command directly to one endpoint.
    pub fn direct(&self, to: PeerId, msg: CommandMessage) {
        let _ = self.tx.send(StoreEvent::Direct(to, msg));
    }
}
