//! The endpoint façade.
//!
//! An `Endpoint` wires one hub actor, the TCP transport, and any number of
//! attached stores and subscribers. It holds only handles; all state lives
//! inside the actors it spawns.

use crate::{
    hub::{run_hub, Hub, HubMsg},
    network::{self, ConnEntry, LinkContext},
    subscriber::Subscriber,
};
use broker_core::{
    message::DataMessage,
    topic::{Filter, Topic},
    types::PeerId,
    Config, Data, Error, Result,
};
use broker_store::{spawn_clone, spawn_master, CloneIntervals, Store, StoreRelay};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{net::IpAddr, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, watch};

const WORKER_QUEUE: usize = 512;
const STORE_QUEUE: usize = 64;

/// One participant in the overlay.
///
/// Must be created inside a tokio runtime; `new` spawns the hub actor.
#[derive(Debug)]
pub struct Endpoint {
    id: PeerId,
    config: Config,
    hub_tx: mpsc::Sender<HubMsg>,
    relay: StoreRelay,
    connections: Arc<DashMap<String, ConnEntry>>,
    shutdown: watch::Sender<bool>,
    stores: Mutex<Vec<Store>>,
}

impl Endpoint {
    /// Create an endpoint with a random id.
    ///
    /// # Errors
    /// Returns a configuration error for invalid options.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_id(PeerId::random(), config)
    }

    /// Create an endpoint with a caller-chosen id.
    ///
    /// # Errors
    /// Returns a configuration error for invalid options or an invalid id.
    pub fn with_id(id: PeerId, config: Config) -> Result<Self> {
        config.validate()?;
        if !id.is_valid() {
            return Err(Error::configuration("endpoint id must not be empty"));
        }
        let (hub_tx, hub_rx) = mpsc::channel(256);
        let (relay, store_events) = StoreRelay::channel();
        let hub = Hub::new(id.clone(), &config, hub_tx.clone());
        tokio::spawn(run_hub(hub, hub_rx, store_events));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            id,
            config,
            hub_tx,
            relay,
            connections: Arc::new(DashMap::new()),
            shutdown,
            stores: Mutex::new(Vec::new()),
        })
    }

    /// This endpoint's id.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The configuration the endpoint runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn link_context(&self) -> LinkContext {
        LinkContext {
            hub: self.hub_tx.clone(),
            local_id: self.id.clone(),
            max_frame: self.config.max_frame_size,
            queue_capacity: self.config.outbound_queue_capacity,
            connect_timeout: Duration::from_secs_f64(self.config.connect_timeout),
            shutdown: self.shutdown.subscribe(),
            registry: Arc::clone(&self.connections),
        }
    }

    async fn send(&self, msg: HubMsg) -> Result<()> {
        self.hub_tx.send(msg).await.map_err(|_| Error::Detached)
    }

    /// Accept peerings on `host:port`. An empty host binds all interfaces,
    /// port 0 picks a free port. Returns the bound port.
    ///
    /// # Errors
    /// Returns an error if the address is invalid or binding fails.
    pub async fn listen(&self, host: &str, port: u16) -> Result<u16> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let addr: IpAddr = host
            .parse()
            .map_err(|e| Error::network(format!("invalid listen address '{host}': {e}")))?;
        network::listen(self.link_context(), addr, port).await
    }

    /// Establish a peering with a remote endpoint. Returns the remote's id
    /// once the handshake succeeded. When a retry interval is configured,
    /// a lost link is re-dialed automatically until [`Endpoint::unpeer`].
    ///
    /// # Errors
    /// Returns an error if the address is already peered, unreachable, or
    /// the handshake fails.
    pub async fn peer(&self, host: &str, port: u16) -> Result<PeerId> {
        let key = format!("{host}:{port}");
        let (close, close_rx) = watch::channel(false);
        match self.connections.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::network(format!("already peering with {key}")));
            },
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ConnEntry { peer: PeerId::invalid(), close });
            },
        }
        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(network::run_outbound(
            host.to_string(),
            port,
            self.link_context(),
            self.config.retry_interval(),
            close_rx,
            first_tx,
            key.clone(),
        ));
        match first_rx.await {
            Ok(Ok(remote)) => Ok(remote),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::Detached),
        }
    }

    /// Tear down a peering established with [`Endpoint::peer`].
    ///
    /// # Errors
    /// Returns an error if no peering with that address exists.
    pub async fn unpeer(&self, host: &str, port: u16) -> Result<()> {
        let key = format!("{host}:{port}");
        let Some((_, entry)) = self.connections.remove(&key) else {
            return Err(Error::network(format!("no peering with {key}")));
        };
        let _ = entry.close.send(true);
        if entry.peer.is_valid() {
            self.send(HubMsg::PeerDown { peer: entry.peer, graceful: true, reason: None }).await?;
        }
        Ok(())
    }

    /// Extend this endpoint's subscriptions.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown.
    pub async fn subscribe(&self, filter: Filter) -> Result<()> {
        self.send(HubMsg::Subscribe(filter)).await
    }

    /// Publish a data value on a topic.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown.
    pub async fn publish(&self, topic: Topic, data: impl Into<Data>) -> Result<()> {
        self.send(HubMsg::PublishData(DataMessage::new(topic, data))).await
    }

    /// Create a subscriber receiving every publication matching `filter`,
    /// and extend the endpoint's subscriptions accordingly. Internal topics
    /// (`broker/...`) are delivered locally but never advertised.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown.
    pub async fn make_subscriber(&self, filter: Filter) -> Result<Subscriber> {
        let (tx, rx) = mpsc::channel(WORKER_QUEUE);
        self.send(HubMsg::AddWorker { filter: filter.clone(), tx }).await?;
        self.send(HubMsg::Subscribe(filter)).await?;
        Ok(Subscriber::new(rx))
    }

    /// The ids of all directly connected peers.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown.
    pub async fn peers(&self) -> Result<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubMsg::Peers { reply }).await?;
        rx.await.map_err(|_| Error::Detached)
    }

    fn check_store_name(name: &Topic) -> Result<()> {
        if name.is_internal() || name.is_clone_traffic() {
            return Err(Error::InvalidTopic {
                message: format!("'{name}' cannot name a data store"),
            });
        }
        Ok(())
    }

    /// Attach the authoritative master for the store `name`.
    ///
    /// # Errors
    /// Returns an error for reserved store names or after shutdown.
    pub async fn attach_master(&self, name: Topic) -> Result<Store> {
        Self::check_store_name(&name)?;
        let (tx, rx) = mpsc::channel(STORE_QUEUE);
        let filter = Filter::from_topics([name.clone_channel()]);
        self.send(HubMsg::AddStore { filter: filter.clone(), tx }).await?;
        self.send(HubMsg::Subscribe(filter)).await?;
        let store = spawn_master(name, self.relay.clone(), rx);
        self.stores.lock().push(store.clone());
        Ok(store)
    }

    /// Attach a clone of the store `name`, mirroring whatever master hosts
    /// it. The clone resyncs with the given intervals.
    ///
    /// # Errors
    /// Returns an error for reserved store names or after shutdown.
    pub async fn attach_clone(&self, name: Topic, intervals: CloneIntervals) -> Result<Store> {
        Self::check_store_name(&name)?;
        let (tx, rx) = mpsc::channel(STORE_QUEUE);
        let filter = Filter::from_topics([name.clone()]);
        self.send(HubMsg::AddStore { filter: filter.clone(), tx }).await?;
        self.send(HubMsg::Subscribe(filter)).await?;
        let store = spawn_clone(name, self.id.clone(), self.relay.clone(), intervals, rx);
        self.stores.lock().push(store.clone());
        Ok(store)
    }

    /// Stop the endpoint: close every connection and listener, then stop the
    /// hub. Attached stores terminate once their channels drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for entry in self.connections.iter() {
            let _ = entry.value().close.send(true);
        }
        self.connections.clear();
        self.stores.lock().clear();
        let _ = self.hub_tx.send(HubMsg::Shutdown).await;
    }
}
