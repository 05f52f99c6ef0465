//! Message envelopes exchanged between endpoints.

use crate::{
    command::Command,
    data::Data,
    topic::{Filter, Topic},
    types::{LogicalTime, PeerId},
};
use serde::{Deserialize, Serialize};

/// A published `(topic, data)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    /// Routing topic
    pub topic: Topic,
    /// Payload value
    pub data: Data,
}

impl DataMessage {
    /// Create a new data message.
    pub fn new(topic: Topic, data: impl Into<Data>) -> Self {
        Self { topic, data: data.into() }
    }
}

/// A store command traveling on the store's topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Routing topic (the store name or its clone channel)
    pub topic: Topic,
    /// Command payload
    pub command: Command,
}

impl CommandMessage {
    /// Create a new command message.
    pub fn new(topic: Topic, command: Command) -> Self {
        Self { topic, command }
    }
}

/// Content of a node message: either user data or a store command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeContent {
    /// User publication
    Data(DataMessage),
    /// Store command
    Command(CommandMessage),
}

impl NodeContent {
    /// Routing topic of the content.
    pub fn topic(&self) -> &Topic {
        match self {
            Self::Data(m) => &m.topic,
            Self::Command(m) => &m.topic,
        }
    }

    /// Whether this is a user publication.
    pub const fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }
}

/// The on-wire envelope for publications: content plus a hop budget and the
/// explicit receiver set computed by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMessage {
    /// Data or command content
    pub content: NodeContent,
    /// Remaining hop budget; receivers decrement, zero discards
    pub ttl: u16,
    /// Endpoints that still need a copy
    pub receivers: Vec<PeerId>,
}

impl NodeMessage {
    /// Create a new node message.
    pub fn new(content: NodeContent, ttl: u16, receivers: Vec<PeerId>) -> Self {
        Self { content, ttl, receivers }
    }
}

/// A flooded subscription announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    /// Endpoints the announcement traversed, subscriber first
    pub path: Vec<PeerId>,
    /// The subscriber's full filter
    pub filter: Filter,
    /// The subscriber's logical timestamp for supersession
    pub ts: LogicalTime,
}

/// One unit of the per-link wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Handshake: announces the sender's endpoint id
    Hello(PeerId),
    /// Subscription flood
    Subscription(SubscriptionUpdate),
    /// Routed publication
    Publication(NodeMessage),
}

impl PeerMessage {
    /// Short name for diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Subscription(_) => "subscription",
            Self::Publication(_) => "publication",
        }
    }
}
