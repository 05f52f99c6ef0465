//! Queue of publications delivered to a local subscriber.

use broker_core::DataMessage;
use tokio::sync::mpsc;

/// Receiving side of a subscription created with
/// [`Endpoint::make_subscriber`](crate::Endpoint::make_subscriber).
///
/// The endpoint pushes every matching `(topic, data)` publication into this
/// queue. A subscriber that falls too far behind loses newer messages rather
/// than stalling the hub.
#[derive(Debug)]
pub struct Subscriber {
    rx: mpsc::Receiver<DataMessage>,
}

impl Subscriber {
    pub(crate) fn new(rx: mpsc::Receiver<DataMessage>) -> Self {
        Self { rx }
    }

    /// Wait for the next publication. Returns `None` once the endpoint has
    /// shut down and the queue is drained.
    pub async fn recv(&mut self) -> Option<DataMessage> {
        self.rx.recv().await
    }

    /// Take the next publication if one is already queued.
    pub fn try_recv(&mut self) -> Option<DataMessage> {
        self.rx.try_recv().ok()
    }
}
