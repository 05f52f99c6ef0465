//! The overlay peer: subscription flood, routing state, and the forwarding
//! decision for flooded and source-routed delivery.
//!
//! `Peer` is a pure state machine. Everything that touches the outside world
//! (sending on links, delivering to local consumers, reacting to connection
//! churn) goes through the [`PeerActions`] trait, so the transport owns the
//! peer and no back-pointer ever exists. Handlers run to completion; the
//! owner serializes calls.

use crate::{multipath::Multipath, routing::RoutingTable};
use broker_core::{
    message::{CommandMessage, DataMessage, NodeContent, NodeMessage, PeerMessage, SubscriptionUpdate},
    topic::{Filter, Topic},
    types::{LogicalTime, PeerId},
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Longest admissible subscription path. Anything longer is a protocol
/// violation and gets dropped.
pub const MAX_PATH_LENGTH: usize = u16::MAX as usize;

/// Callbacks and side effects a [`Peer`] needs from its owner.
///
/// The owner (the hub actor in production, a mock in tests) implements
/// message transmission and local delivery. Connection callbacks default to
/// no-ops.
pub trait PeerActions {
    /// Communication handle for one direct link.
    type Handle: Clone;

    /// Transmit `msg` on the link behind `handle`.
    fn send(&mut self, handle: &Self::Handle, msg: PeerMessage);

    /// Hand a publication to local data consumers.
    fn deliver_data(&mut self, msg: DataMessage);

    /// Hand a command to local stores.
    fn deliver_command(&mut self, msg: CommandMessage);

    /// A new direct peer was inserted into the routing table.
    fn peer_connected(&mut self, _peer: &PeerId, _handle: &Self::Handle) {}

    /// A direct peer was removed from the routing table.
    fn peer_removed(&mut self, _peer: &PeerId) {}
}

/// Overlay state of one endpoint.
pub struct Peer<A: PeerActions> {
    /// Our own endpoint id.
    id: PeerId,

    /// Owner-provided side effects.
    actions: A,

    /// Routing information for reaching other peers. The transport inserts
    /// entries (via [`Peer::insert_peer`]) and disconnect handling removes
    /// them.
    tbl: RoutingTable<A::Handle>,

    /// Hop budget for outbound messages: the largest observed path distance,
    /// capped at 65535 and never below 1.
    ttl: u16,

    /// Logical clock, bumped on every local subscription change.
    timestamp: LogicalTime,

    /// Highest logical timestamp seen from each subscriber.
    peer_timestamps: HashMap<PeerId, LogicalTime>,

    /// Prefixes with local subscribers.
    filter: Filter,

    /// Last accepted filter of every known remote subscriber.
    peer_filters: HashMap<PeerId, Filter>,

    /// Whether residue of incoming publications is re-shipped.
    forward: bool,

    /// Merged tree of advertised subscription paths, rooted at this
    /// endpoint. Shared prefixes collapse, giving a branching map of the
    /// overlay as seen from here.
    routes: Multipath,
}

impl<A: PeerActions> Peer<A> {
    /// Create the overlay state for endpoint `id`.
    pub fn new(id: PeerId, initial_ttl: u16, forward: bool, actions: A) -> Self {
        let routes = Multipath::new(id.clone());
        Self {
            id,
            actions,
            tbl: RoutingTable::new(),
            ttl: initial_ttl.max(1),
            timestamp: 0,
            peer_timestamps: HashMap::new(),
            filter: Filter::new(),
            peer_filters: HashMap::new(),
            forward,
            routes,
        }
    }

    /// Our endpoint id.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Current hop budget.
    pub fn ttl(&self) -> u16 {
        self.ttl
    }

    /// Current logical timestamp.
    pub fn timestamp(&self) -> LogicalTime {
        self.timestamp
    }

    /// Our own subscription filter.
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// All known remote subscriber filters.
    pub fn peer_filters(&self) -> &HashMap<PeerId, Filter> {
        &self.peer_filters
    }

    /// Last accepted filter of one remote subscriber.
    pub fn peer_filter(&self, peer: &PeerId) -> Option<&Filter> {
        self.peer_filters.get(peer)
    }

    /// The routing table.
    pub fn tbl(&self) -> &RoutingTable<A::Handle> {
        &self.tbl
    }

    /// Mutable access to the routing table, for the owning transport.
    pub fn tbl_mut(&mut self) -> &mut RoutingTable<A::Handle> {
        &mut self.tbl
    }

    /// The owner's action sink.
    pub fn actions(&mut self) -> &mut A {
        &mut self.actions
    }

    /// Merged source-route map of advertised subscription paths.
    pub fn routes(&self) -> &Multipath {
        &self.routes
    }

    /// Best known hop count to `peer`.
    pub fn distance_to(&self, peer: &PeerId) -> Option<usize> {
        self.tbl.distance_to(peer)
    }

    /// Whether any remote subscriber matches `topic`.
    pub fn has_remote_subscriber(&self, topic: &Topic) -> bool {
        self.peer_filters.values().any(|filter| filter.matches(topic))
    }

    // -- publish and subscribe --------------------------------------------

    /// Extend the local filter and flood the change to all direct peers.
    /// Internal topics never leave the endpoint.
    pub fn subscribe(&mut self, what: &Filter) {
        if !self.filter.extend_filtered(what, |topic| !topic.is_internal()) {
            debug!("already subscribed to all given topics");
            return;
        }
        self.timestamp += 1;
        let update = SubscriptionUpdate {
            path: vec![self.id.clone()],
            filter: self.filter.clone(),
            ts: self.timestamp,
        };
        let links: Vec<A::Handle> =
            self.tbl.iter().map(|(_, entry)| entry.handle.clone()).collect();
        for handle in links {
            self.actions.send(&handle, PeerMessage::Subscription(update.clone()));
        }
    }

    /// Publish a data message to all matching remote subscribers.
    pub fn publish_data(&mut self, msg: DataMessage) {
        self.publish(NodeContent::Data(msg));
    }

    /// Publish a command message to all matching remote subscribers.
    pub fn publish_command(&mut self, msg: CommandMessage) {
        self.publish(NodeContent::Command(msg));
    }

    /// Wrap `content` into a node message addressed to every matching remote
    /// subscriber and ship it. Dropped silently when nobody subscribes.
    pub fn publish(&mut self, content: NodeContent) {
        let topic = content.topic();
        let mut receivers: Vec<PeerId> = self
            .peer_filters
            .iter()
            .filter(|(_, filter)| filter.matches(topic))
            .map(|(peer, _)| peer.clone())
            .collect();
        if receivers.is_empty() {
            debug!(topic = %topic, "no remote subscribers for topic");
            return;
        }
        receivers.sort_unstable();
        debug_assert!(self.ttl > 0);
        self.ship(NodeMessage::new(content, self.ttl, receivers));
    }

    // -- incoming handlers ------------------------------------------------

    /// Dispatch one message received on an established link.
    pub fn handle_peer_message(&mut self, msg: PeerMessage) {
        match msg {
            PeerMessage::Hello(id) => debug!(peer = %id, "ignore hello on established link"),
            PeerMessage::Subscription(update) => self.handle_filter_update(update),
            PeerMessage::Publication(msg) => self.handle_publication(msg),
        }
    }

    /// Process a flooded subscription update.
    pub fn handle_filter_update(&mut self, update: SubscriptionUpdate) {
        let SubscriptionUpdate { mut path, filter, ts } = update;
        if path.is_empty() || filter.is_empty() {
            warn!("drop nonsense subscription update");
            return;
        }
        let source = path[path.len() - 1].clone();
        if !self.tbl.contains(&source) {
            warn!(source = %source, "drop subscription from unrecognized connection");
            return;
        }
        if path.contains(&self.id) {
            debug!("drop subscription path containing a loop");
            return;
        }
        if (1..path.len()).any(|i| path[i..].contains(&path[i - 1])) {
            warn!("drop subscription path with repeated entries");
            return;
        }
        let distance = path.len();
        if distance > MAX_PATH_LENGTH {
            warn!(distance, "drop subscription path exceeding distance limit");
            return;
        }
        self.ttl = self.ttl.max(distance as u16);
        if distance > 1 {
            if let Some(entry) = self.tbl.get_mut(&source) {
                let known = entry.distances.entry(path[0].clone()).or_insert(distance);
                if *known > distance {
                    *known = distance;
                }
            }
        }
        // Merge the advertised route, reversed so it starts here and ends at
        // the subscriber.
        let mut route = Vec::with_capacity(distance + 1);
        route.push(self.id.clone());
        route.extend(path.iter().rev().cloned());
        self.routes.splice(&route);
        // Forward with ourselves appended to every direct peer not on the
        // path yet.
        path.push(self.id.clone());
        let links: Vec<A::Handle> = self
            .tbl
            .iter()
            .filter(|(peer, _)| !path.contains(peer))
            .map(|(_, entry)| entry.handle.clone())
            .collect();
        if !links.is_empty() {
            let forwarded =
                SubscriptionUpdate { path: path.clone(), filter: filter.clone(), ts };
            for handle in links {
                self.actions.send(&handle, PeerMessage::Subscription(forwarded.clone()));
            }
        }
        // Keep the newest filter per subscriber; older timestamps are
        // silently ignored.
        let subscriber = path[0].clone();
        let known = self.peer_timestamps.entry(subscriber.clone()).or_insert(0);
        if *known < ts {
            *known = ts;
            self.peer_filters.insert(subscriber, filter);
        }
    }

    /// Process a routed publication: decrement the hop budget, deliver
    /// locally when addressed to us, and ship the residue.
    pub fn handle_publication(&mut self, mut msg: NodeMessage) {
        msg.ttl = msg.ttl.saturating_sub(1);
        let addressed_to_us = msg.receivers.iter().any(|r| *r == self.id);
        if addressed_to_us {
            msg.receivers.retain(|r| *r != self.id);
            if msg.receivers.is_empty() {
                self.deliver_local(msg.content);
                return;
            }
            self.deliver_local(msg.content.clone());
        }
        if msg.receivers.is_empty() {
            return;
        }
        if msg.ttl == 0 {
            warn!(topic = %msg.content.topic(), "drop message: TTL expired");
            return;
        }
        if msg.content.topic().is_clone_traffic() {
            // Clone channels are single-hop by contract.
            debug!(topic = %msg.content.topic(), "refuse to forward clone traffic");
            return;
        }
        if !self.forward {
            debug!("forwarding disabled: drop residue");
            return;
        }
        self.ship(msg);
    }

    fn deliver_local(&mut self, content: NodeContent) {
        match content {
            NodeContent::Data(m) => self.actions.deliver_data(m),
            NodeContent::Command(m) => self.actions.deliver_command(m),
        }
    }

    // -- shipping ---------------------------------------------------------

    /// Forward `msg` to all its receivers: one bucket per direct connection,
    /// each receiver in the bucket with the shortest path to it, ties going
    /// to the lexicographically first hop. One copy goes out per non-empty
    /// bucket, carrying exactly that bucket's receivers.
    pub fn ship(&mut self, msg: NodeMessage) {
        let mut buckets: Vec<(PeerId, Vec<PeerId>)> = Vec::new();
        for receiver in &msg.receivers {
            let Some(hop) = self.first_hop_for(receiver) else {
                debug!(receiver = %receiver, "no path to receiver");
                continue;
            };
            match buckets.iter_mut().find(|(id, _)| *id == hop) {
                Some((_, bucket)) => bucket.push(receiver.clone()),
                None => buckets.push((hop, vec![receiver.clone()])),
            }
        }
        for (hop, receivers) in buckets {
            let Some(entry) = self.tbl.get(&hop) else { continue };
            let handle = entry.handle.clone();
            let mut copy = msg.clone();
            copy.receivers = receivers;
            self.actions.send(&handle, PeerMessage::Publication(copy));
        }
    }

    /// Forward `content` to a single receiver along the shortest known path.
    pub fn ship_to(&mut self, content: NodeContent, receiver: &PeerId) {
        let Some(hop) = self.first_hop_for(receiver) else {
            warn!(receiver = %receiver, "no path to receiver: drop message");
            return;
        };
        let Some(entry) = self.tbl.get(&hop) else { return };
        let handle = entry.handle.clone();
        let msg = NodeMessage::new(content, self.ttl, vec![receiver.clone()]);
        self.actions.send(&handle, PeerMessage::Publication(msg));
    }

    /// The direct peer to route through for `receiver`: the receiver itself
    /// when directly connected, otherwise the neighbor claiming the minimum
    /// distance, ties broken by the lexicographically smaller neighbor id.
    fn first_hop_for(&self, receiver: &PeerId) -> Option<PeerId> {
        if self.tbl.contains(receiver) {
            return Some(receiver.clone());
        }
        let mut best: Option<(usize, &PeerId)> = None;
        for (hop, entry) in self.tbl.iter() {
            if let Some(&distance) = entry.distances.get(receiver) {
                let better = match best {
                    Some((best_distance, best_hop)) => {
                        distance < best_distance
                            || (distance == best_distance && hop < best_hop)
                    },
                    None => true,
                };
                if better {
                    best = Some((distance, hop));
                }
            }
        }
        best.map(|(_, hop)| hop.clone())
    }

    // -- connection events ------------------------------------------------

    /// Register a freshly connected direct peer. The entry lands in the
    /// routing table before the `peer_connected` callback fires.
    pub fn insert_peer(&mut self, peer: PeerId, handle: A::Handle) {
        debug_assert_ne!(peer, self.id, "self-referential routing entry");
        self.tbl.insert(peer.clone(), handle.clone());
        self.actions.peer_connected(&peer, &handle);
    }

    /// Replay our current subscription state to one direct peer, e.g. right
    /// after the link came up. Does not bump the logical clock.
    pub fn announce_to(&mut self, peer: &PeerId) {
        if self.filter.is_empty() {
            return;
        }
        let Some(entry) = self.tbl.get(peer) else { return };
        let handle = entry.handle.clone();
        let update = SubscriptionUpdate {
            path: vec![self.id.clone()],
            filter: self.filter.clone(),
            ts: self.timestamp,
        };
        self.actions.send(&handle, PeerMessage::Subscription(update));
    }

    /// Remove a direct peer. If the peer becomes unreachable, its filter and
    /// timestamp are forgotten together, so a later reconnect can replay the
    /// same subscription state and have it accepted.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.tbl.erase(peer);
        if self.tbl.distance_to(peer).is_none() {
            self.peer_filters.remove(peer);
            self.peer_timestamps.remove(peer);
        }
        self.routes.remove_node(peer);
        self.actions.peer_removed(peer);
    }

    /// A link went away without an explicit unpeering. Same cleanup as
    /// [`Peer::remove_peer`]; the owner reports the different status class.
    pub fn handle_disconnect(&mut self, peer: &PeerId) {
        self.remove_peer(peer);
    }
}
