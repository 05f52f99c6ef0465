//! Status and error events published on the internal topics.
//!
//! Peer lifecycle events surface as data messages on `broker/statuses`;
//! transport and protocol errors land on `broker/errors`. Both encode as a
//! small vector so plain subscribers can consume them.

use broker_core::{Data, PeerId};
use std::fmt;

/// Classification of a peer lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// A peering was established.
    PeerAdded,
    /// A peering was removed deliberately.
    PeerRemoved,
    /// A peering was lost to a transport failure.
    PeerLost,
}

impl StatusCode {
    /// Stable name used in the encoded event.
    pub const fn name(self) -> &'static str {
        match self {
            Self::PeerAdded => "peer_added",
            Self::PeerRemoved => "peer_removed",
            Self::PeerLost => "peer_lost",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One endpoint-local status event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Event classification
    pub code: StatusCode,
    /// The peer the event concerns
    pub peer: PeerId,
    /// Human-readable context
    pub message: String,
}

impl Status {
    /// Create a new status event.
    pub fn new(code: StatusCode, peer: PeerId, message: impl Into<String>) -> Self {
        Self { code, peer, message: message.into() }
    }

    /// Encode as a data value for publication.
    pub fn to_data(&self) -> Data {
        Data::Vector(vec![
            Data::Enum(self.code.name().to_string()),
            Data::Str(self.peer.as_str().to_string()),
            Data::Str(self.message.clone()),
        ])
    }

    /// Decode an event previously produced by [`Status::to_data`].
    pub fn from_data(data: &Data) -> Option<Self> {
        let Data::Vector(fields) = data else { return None };
        match &fields[..] {
            [Data::Enum(code), Data::Str(peer), Data::Str(message)] => {
                let code = match code.as_str() {
                    "peer_added" => StatusCode::PeerAdded,
                    "peer_removed" => StatusCode::PeerRemoved,
                    "peer_lost" => StatusCode::PeerLost,
                    _ => return None,
                };
                Some(Self::new(code, PeerId::from(peer.as_str()), message.clone()))
            },
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.peer, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_data_roundtrip() {
        let status = Status::new(StatusCode::PeerLost, PeerId::from("b"), "lost remote peer");
        assert_eq!(Status::from_data(&status.to_data()), Some(status));
        assert_eq!(Status::from_data(&Data::Nil), None);
    }
}
