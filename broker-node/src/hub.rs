//! The hub: the single actor that owns the overlay peer state.
//!
//! Everything meets here. The transport feeds it connection events and
//! decoded frames, the façade feeds it publish/subscribe requests, store
//! actors feed it commands to route. Handling is strictly serial, so the
//! peer state needs no locking. Outbound links are bounded queues; when one
//! fills up the hub parks outbound traffic for that link and holds incoming
//! messages from the same peer in arrival order, replaying them through the
//! normal handlers once the link drains.

use crate::status::{Status, StatusCode};
use broker_core::{
    message::{CommandMessage, DataMessage, NodeContent, NodeMessage, PeerMessage},
    topic::{Filter, Topic, ERRORS_TOPIC, STATUSES_TOPIC},
    types::PeerId,
    wire, Config, Data,
};
use broker_overlay::{Peer, PeerActions};
use broker_store::StoreEvent;
use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Sender side of one outbound link (consumed by its writer task).
pub(crate) type LinkTx = mpsc::Sender<PeerMessage>;

/// Communication handle stored in the routing table.
#[derive(Debug, Clone)]
pub(crate) struct LinkHandle {
    pub peer: PeerId,
    pub tx: LinkTx,
}

/// Inbox of the hub actor.
#[derive(Debug)]
pub(crate) enum HubMsg {
    /// Extend the endpoint's own subscription filter.
    Subscribe(Filter),
    /// Publish user data locally and to the overlay.
    PublishData(DataMessage),
    /// Register a local subscriber queue.
    AddWorker { filter: Filter, tx: mpsc::Sender<DataMessage> },
    /// Register a local store inbox.
    AddStore { filter: Filter, tx: mpsc::Sender<CommandMessage> },
    /// A link finished its handshake. The transport inserts the peer only if
    /// the hub accepts it.
    PeerUp { peer: PeerId, tx: LinkTx, accepted: oneshot::Sender<bool> },
    /// A link went away.
    PeerDown { peer: PeerId, graceful: bool, reason: Option<String> },
    /// One decoded frame from an established link.
    FromPeer { peer: PeerId, msg: PeerMessage },
    /// A congested link has capacity again.
    LinkDrained(PeerId),
    /// List the direct peers.
    Peers { reply: oneshot::Sender<Vec<PeerId>> },
    /// Stop the hub.
    Shutdown,
}

struct LocalWorker {
    filter: Filter,
    tx: mpsc::Sender<DataMessage>,
}

struct LocalStore {
    filter: Filter,
    tx: mpsc::Sender<CommandMessage>,
}

/// Appends forwarded node messages to `messages.dat`, up to a cap.
struct Recorder {
    writer: BufWriter<File>,
    remaining: usize,
}

impl Recorder {
    fn open(directory: &str, cap: usize) -> Option<Self> {
        if directory.is_empty() {
            return None;
        }
        let path = Path::new(directory).join("messages.dat");
        match File::create(&path) {
            Ok(file) => {
                debug!(path = %path.display(), "opened file for recording");
                Some(Self { writer: BufWriter::new(file), remaining: cap })
            },
            Err(error) => {
                warn!(path = %path.display(), %error, "cannot open recording file");
                None
            },
        }
    }

    fn record(&mut self, msg: &NodeMessage) {
        if self.remaining == 0 {
            return;
        }
        let payload = wire::to_bytes(msg);
        let result = self
            .writer
            .write_all(&(payload.len() as u32).to_le_bytes())
            .and_then(|()| self.writer.write_all(&payload))
            .and_then(|()| self.writer.flush());
        match result {
            Ok(()) => self.remaining -= 1,
            Err(error) => {
                warn!(%error, "recording failed, disabling recorder");
                self.remaining = 0;
            },
        }
    }
}

/// Side effects of the peer, backed by the hub's channels.
pub(crate) struct HubActions {
    workers: Vec<LocalWorker>,
    stores: Vec<LocalStore>,
    /// Outbound overflow per congested link; presence of a key marks the
    /// link congested.
    congested: HashMap<PeerId, VecDeque<PeerMessage>>,
    /// Messages received from a congested peer, waiting for replay.
    held: HashMap<PeerId, Vec<PeerMessage>>,
    hub_tx: mpsc::Sender<HubMsg>,
    recorder: Option<Recorder>,
}

impl HubActions {
    fn spawn_drain_waiter(&self, peer: PeerId, tx: LinkTx) {
        let hub_tx = self.hub_tx.clone();
        tokio::spawn(async move {
            if tx.reserve().await.is_ok() {
                let _ = hub_tx.send(HubMsg::LinkDrained(peer)).await;
            }
        });
    }
}

impl PeerActions for HubActions {
    type Handle = LinkHandle;

    fn send(&mut self, handle: &LinkHandle, msg: PeerMessage) {
        if let PeerMessage::Publication(ref node_msg) = msg {
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.record(node_msg);
            }
        }
        if let Some(backlog) = self.congested.get_mut(&handle.peer) {
            backlog.push_back(msg);
            return;
        }
        match handle.tx.try_send(msg) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(msg)) => {
                debug!(peer = %handle.peer, "outbound link congested, parking traffic");
                self.congested.insert(handle.peer.clone(), VecDeque::from([msg]));
                self.spawn_drain_waiter(handle.peer.clone(), handle.tx.clone());
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer = %handle.peer, "link already closed, dropping message");
            },
        }
    }

    fn deliver_data(&mut self, msg: DataMessage) {
        self.workers.retain_mut(|worker| {
            if !worker.filter.matches(&msg.topic) {
                return true;
            }
            match worker.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic = %msg.topic, "subscriber queue full, dropping message");
                    true
                },
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn deliver_command(&mut self, msg: CommandMessage) {
        self.stores.retain_mut(|store| {
            if !store.filter.matches(&msg.topic) {
                return true;
            }
            match store.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic = %msg.topic, "store inbox full, dropping command");
                    true
                },
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

pub(crate) struct Hub {
    peer: Peer<HubActions>,
}

impl Hub {
    pub(crate) fn new(id: PeerId, config: &Config, hub_tx: mpsc::Sender<HubMsg>) -> Self {
        let actions = HubActions {
            workers: Vec::new(),
            stores: Vec::new(),
            congested: HashMap::new(),
            held: HashMap::new(),
            hub_tx,
            recorder: Recorder::open(
                &config.recording_directory,
                config.output_generator_file_cap,
            ),
        };
        let peer = Peer::new(id, config.initial_ttl(), config.forward, actions);
        Self { peer }
    }

    fn emit_status(&mut self, code: StatusCode, peer: PeerId, message: &str) {
        let status = Status::new(code, peer, message);
        debug!(status = %status, "status event");
        let topic = Topic::new(STATUSES_TOPIC).expect("statuses topic is valid");
        self.peer.actions().deliver_data(DataMessage::new(topic, status.to_data()));
    }

    fn emit_error(&mut self, code: &str, message: String) {
        let topic = Topic::new(ERRORS_TOPIC).expect("errors topic is valid");
        let data = Data::Vector(vec![Data::Enum(code.to_string()), Data::Str(message)]);
        self.peer.actions().deliver_data(DataMessage::new(topic, data));
    }

    fn handle(&mut self, msg: HubMsg) {
        match msg {
            HubMsg::Subscribe(filter) => self.peer.subscribe(&filter),
            HubMsg::PublishData(msg) => {
                self.peer.actions().deliver_data(msg.clone());
                self.peer.publish_data(msg);
            },
            HubMsg::AddWorker { filter, tx } => {
                self.peer.actions().workers.push(LocalWorker { filter, tx });
            },
            HubMsg::AddStore { filter, tx } => {
                self.peer.actions().stores.push(LocalStore { filter, tx });
            },
            HubMsg::PeerUp { peer, tx, accepted } => self.handle_peer_up(peer, tx, accepted),
            HubMsg::PeerDown { peer, graceful, reason } => {
                self.handle_peer_down(&peer, graceful, reason);
            },
            HubMsg::FromPeer { peer, msg } => {
                if self.peer.actions().congested.contains_key(&peer) {
                    // The link back to this peer is saturated; park its
                    // traffic in arrival order.
                    self.peer.actions().held.entry(peer).or_default().push(msg);
                } else {
                    self.peer.handle_peer_message(msg);
                }
            },
            HubMsg::LinkDrained(peer) => self.drain_link(&peer),
            HubMsg::Peers { reply } => {
                let peers = self.peer.tbl().iter().map(|(id, _)| id.clone()).collect();
                let _ = reply.send(peers);
            },
            HubMsg::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn handle_peer_up(&mut self, peer: PeerId, tx: LinkTx, accepted: oneshot::Sender<bool>) {
        if peer == *self.peer.id() {
            warn!("refusing self-referential peering");
            self.emit_error("invalid_peering", "attempted to peer with ourselves".to_string());
            let _ = accepted.send(false);
            return;
        }
        if self.peer.tbl().contains(&peer) {
            warn!(peer = %peer, "peer already connected");
            self.emit_error("invalid_peering", format!("{peer} is already connected"));
            let _ = accepted.send(false);
            return;
        }
        let _ = accepted.send(true);
        let handle = LinkHandle { peer: peer.clone(), tx };
        self.peer.insert_peer(peer.clone(), handle);
        self.peer.announce_to(&peer);
        info!(peer = %peer, "peer added");
        self.emit_status(StatusCode::PeerAdded, peer, "handshake successful");
    }

    fn handle_peer_down(&mut self, peer: &PeerId, graceful: bool, reason: Option<String>) {
        let actions = self.peer.actions();
        actions.congested.remove(peer);
        actions.held.remove(peer);
        if !self.peer.tbl().contains(peer) {
            return;
        }
        self.peer.handle_disconnect(peer);
        if graceful {
            info!(peer = %peer, "peering removed");
            self.emit_status(StatusCode::PeerRemoved, peer.clone(), "removed peering");
        } else {
            info!(peer = %peer, "peer lost");
            self.emit_status(StatusCode::PeerLost, peer.clone(), "lost remote peer");
            if let Some(reason) = reason {
                self.emit_error("peer_lost", reason);
            }
        }
    }

    fn drain_link(&mut self, peer_id: &PeerId) {
        let Some(mut backlog) = self.peer.actions().congested.remove(peer_id) else {
            return;
        };
        let Some(tx) = self.peer.tbl().get(peer_id).map(|e| e.handle.tx.clone()) else {
            self.peer.actions().held.remove(peer_id);
            return;
        };
        while let Some(msg) = backlog.pop_front() {
            match tx.try_send(msg) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(msg)) => {
                    // Still saturated; keep parking and wait for the next
                    // drain notification.
                    backlog.push_front(msg);
                    let actions = self.peer.actions();
                    actions.congested.insert(peer_id.clone(), backlog);
                    actions.spawn_drain_waiter(peer_id.clone(), tx);
                    return;
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    backlog.clear();
                    break;
                },
            }
        }
        if let Some(held) = self.peer.actions().held.remove(peer_id) {
            debug!(peer = %peer_id, count = held.len(), "replaying held messages");
            for msg in held {
                self.peer.handle_peer_message(msg);
            }
        }
    }

    fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Publish(msg) => {
                self.peer.actions().deliver_command(msg.clone());
                self.peer.publish_command(msg);
            },
            StoreEvent::Direct(to, msg) => {
                if to == *self.peer.id() {
                    self.peer.actions().deliver_command(msg);
                } else {
                    self.peer.ship_to(NodeContent::Command(msg), &to);
                }
            },
        }
    }
}

pub(crate) async fn run_hub(
    mut hub: Hub,
    mut rx: mpsc::Receiver<HubMsg>,
    mut store_events: mpsc::UnboundedReceiver<StoreEvent>,
) {
    debug!(id = %hub.peer.id(), "hub running");
    let mut store_events_open = true;
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(HubMsg::Shutdown) | None => break,
                Some(msg) => hub.handle(msg),
            },
            event = store_events.recv(), if store_events_open => match event {
                Some(event) => hub.handle_store_event(event),
                None => store_events_open = false,
            },
        }
    }
    debug!("hub terminating");
}
