//! The clone store actor and its resync state machine.
//!
//! A clone never applies its own writes: every local mutation is forwarded
//! to the master over the store's clone channel, and the clone mutates its
//! mirror only when the master's broadcast echoes back. Timers are delayed
//! self-messages carrying a generation counter; state transitions bump the
//! generation, so a tick from a previous life is simply ignored.

use crate::{
    frontend::{Store, StoreRequest},
    mutation,
    relay::StoreRelay,
};
use broker_core::{Command, CommandMessage, Data, Error, PeerId, Topic};
use std::collections::{BTreeMap, HashMap};
use tokio::{
    sync::{mpsc, oneshot},
    time::Duration,
};
use tracing::{debug, warn};

/// Timer settings for one clone.
#[derive(Debug, Clone, Copy)]
pub struct CloneIntervals {
    /// How often an unsynced clone re-requests a snapshot.
    pub resync: Duration,
    /// Master silence after which a live clone considers itself stale.
    pub stale: Duration,
    /// How long pre-sync writes may accumulate before they are dropped and
    /// the snapshot request is re-issued.
    pub mutation_buffer: Duration,
}

impl Default for CloneIntervals {
    fn default() -> Self {
        Self {
            resync: Duration::from_secs(10),
            stale: Duration::from_secs(10),
            mutation_buffer: Duration::from_secs(120),
        }
    }
}

/// Lifecycle of a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneStatus {
    /// Just created, first snapshot request in flight.
    Booting,
    /// Still (or again) waiting for a snapshot after a resync retry.
    Syncing,
    /// In sync; mirrors every master broadcast.
    Live,
    /// The master went silent; contents are not trustworthy.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickKind {
    Resync,
    Stale,
    Buffer,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Tick {
    generation: u64,
    kind: TickKind,
}

pub(crate) struct CloneState {
    name: Topic,
    endpoint: PeerId,
    relay: StoreRelay,
    intervals: CloneIntervals,
    store: BTreeMap<Data, Data>,
    status: CloneStatus,
    mutation_buffer: Vec<Command>,
    pending_acks: HashMap<u64, oneshot::Sender<broker_core::Result<bool>>>,
    next_req: u64,
    generation: u64,
    ticks: mpsc::UnboundedSender<Tick>,
}

impl CloneState {
    pub(crate) fn new(
        name: Topic,
        endpoint: PeerId,
        relay: StoreRelay,
        intervals: CloneIntervals,
        ticks: mpsc::UnboundedSender<Tick>,
    ) -> Self {
        Self {
            name,
            endpoint,
            relay,
            intervals,
            store: BTreeMap::new(),
            status: CloneStatus::Booting,
            mutation_buffer: Vec::new(),
            pending_acks: HashMap::new(),
            next_req: 0,
            generation: 0,
            ticks,
        }
    }

    pub(crate) fn status(&self) -> CloneStatus {
        self.status
    }

    pub(crate) fn contents(&self) -> &BTreeMap<Data, Data> {
        &self.store
    }

    fn schedule(&self, kind: TickKind, after: Duration) {
        let tx = self.ticks.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Tick { generation, kind });
        });
    }

    fn request_snapshot(&self) {
        let cmd = Command::Snapshot { requester: self.endpoint.clone() };
        self.relay.publish(CommandMessage::new(self.name.clone_channel(), cmd));
    }

    /// Issue the first snapshot request and arm the boot timers.
    pub(crate) fn boot(&mut self) {
        debug!(store = %self.name, "clone booting");
        self.request_snapshot();
        self.schedule(TickKind::Resync, self.intervals.resync);
        self.schedule(TickKind::Buffer, self.intervals.mutation_buffer);
    }

    fn install_snapshot(&mut self, entries: BTreeMap<Data, Data>) {
        debug!(store = %self.name, entries = entries.len(), "snapshot installed");
        self.store = entries;
        self.status = CloneStatus::Live;
        self.generation += 1;
        self.schedule(TickKind::Stale, self.intervals.stale);
        // Writes buffered before the sync now travel to the master in their
        // original order.
        for cmd in std::mem::take(&mut self.mutation_buffer) {
            self.relay.publish(CommandMessage::new(self.name.clone_channel(), cmd));
        }
    }

    fn enter_stale(&mut self) {
        warn!(store = %self.name, "master went silent: clone is stale");
        self.status = CloneStatus::Stale;
        self.generation += 1;
        for (_, reply) in self.pending_acks.drain() {
            let _ = reply.send(Err(Error::Unavailable));
        }
        self.request_snapshot();
        self.schedule(TickKind::Resync, self.intervals.resync);
    }

    /// Every broadcast from the master restarts the staleness watchdog.
    fn master_activity(&mut self) {
        self.generation += 1;
        self.schedule(TickKind::Stale, self.intervals.stale);
    }

    pub(crate) fn handle_tick(&mut self, tick: Tick) {
        if tick.generation != self.generation {
            return;
        }
        match (tick.kind, self.status) {
            (TickKind::Resync, CloneStatus::Booting | CloneStatus::Syncing) => {
                self.status = CloneStatus::Syncing;
                self.request_snapshot();
                self.schedule(TickKind::Resync, self.intervals.resync);
            },
            (TickKind::Resync, CloneStatus::Stale) => {
                self.request_snapshot();
                self.schedule(TickKind::Resync, self.intervals.resync);
            },
            (TickKind::Buffer, CloneStatus::Booting | CloneStatus::Syncing) => {
                if !self.mutation_buffer.is_empty() {
                    warn!(
                        store = %self.name,
                        dropped = self.mutation_buffer.len(),
                        "snapshot overdue: dropping buffered writes"
                    );
                    self.mutation_buffer.clear();
                }
                self.request_snapshot();
                self.schedule(TickKind::Buffer, self.intervals.mutation_buffer);
            },
            (TickKind::Stale, CloneStatus::Live) => self.enter_stale(),
            _ => {},
        }
    }

    pub(crate) fn handle_command(&mut self, msg: CommandMessage) {
        match msg.command {
            Command::PutUniqueResult { req, inserted } => {
                if let Some(reply) = self.pending_acks.remove(&req) {
                    let _ = reply.send(Ok(inserted));
                }
            },
            Command::Set { entries } if self.status != CloneStatus::Live => {
                self.install_snapshot(entries);
            },
            Command::Snapshot { .. } => {
                debug!(store = %self.name, "clone ignores snapshot request");
            },
            cmd if self.status == CloneStatus::Live => {
                self.master_activity();
                if let Err(reason) = mutation::apply_mutation(&mut self.store, &cmd) {
                    warn!(store = %self.name, reason, "broadcast command rejected");
                }
            },
            cmd => {
                debug!(
                    store = %self.name,
                    kind = cmd.kind(),
                    status = ?self.status,
                    "dropping broadcast while out of sync"
                );
            },
        }
    }

    /// Route a local write: buffered before the first sync, forwarded to the
    /// master otherwise. Never applied locally.
    fn local_mutation(&mut self, cmd: Command) {
        match self.status {
            CloneStatus::Booting | CloneStatus::Syncing => self.mutation_buffer.push(cmd),
            CloneStatus::Live | CloneStatus::Stale => {
                self.relay.publish(CommandMessage::new(self.name.clone_channel(), cmd));
            },
        }
    }

    pub(crate) fn handle_request(&mut self, request: StoreRequest) {
        match request {
            StoreRequest::Get { key, reply } => {
                let _ = reply.send(match self.status {
                    CloneStatus::Live => Ok(self.store.get(&key).cloned()),
                    _ => Err(Error::Unavailable),
                });
            },
            StoreRequest::Keys { reply } => {
                let _ = reply.send(match self.status {
                    CloneStatus::Live => Ok(Data::Set(self.store.keys().cloned().collect())),
                    _ => Err(Error::Unavailable),
                });
            },
            StoreRequest::Exists { key, reply } => {
                let _ = reply.send(match self.status {
                    CloneStatus::Live => Ok(self.store.contains_key(&key)),
                    _ => Err(Error::Unavailable),
                });
            },
            StoreRequest::Put { key, value, expiry } => {
                self.local_mutation(Command::Put { key, value, expiry });
            },
            StoreRequest::PutUnique { key, value, expiry, reply } => {
                let req = self.next_req;
                self.next_req += 1;
                self.pending_acks.insert(req, reply);
                self.local_mutation(Command::PutUnique {
                    key,
                    value,
                    expiry,
                    who: self.endpoint.clone(),
                    req,
                });
            },
            StoreRequest::Erase { key } => self.local_mutation(Command::Erase { key }),
            StoreRequest::Add { key, delta } => self.local_mutation(Command::Add { key, delta }),
            StoreRequest::Subtract { key, delta } => {
                self.local_mutation(Command::Subtract { key, delta });
            },
            StoreRequest::SetAll { entries } => self.local_mutation(Command::Set { entries }),
            StoreRequest::Clear => self.local_mutation(Command::Clear),
        }
    }
}

async fn run_clone(
    name: Topic,
    endpoint: PeerId,
    relay: StoreRelay,
    intervals: CloneIntervals,
    mut requests: mpsc::Receiver<StoreRequest>,
    mut commands: mpsc::Receiver<CommandMessage>,
) {
    let (ticks_tx, mut ticks) = mpsc::unbounded_channel();
    let mut state = CloneState::new(name.clone(), endpoint, relay, intervals, ticks_tx);
    state.boot();
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => state.handle_request(request),
                None => break,
            },
            msg = commands.recv() => match msg {
                Some(msg) => state.handle_command(msg),
                None => break,
            },
            tick = ticks.recv() => {
                if let Some(tick) = tick {
                    state.handle_tick(tick);
                }
            },
        }
    }
    debug!(store = %name, "clone store terminating");
}

/// Spawn a clone store actor and return its frontend handle.
pub fn spawn_clone(
    name: Topic,
    endpoint: PeerId,
    relay: StoreRelay,
    intervals: CloneIntervals,
    commands: mpsc::Receiver<CommandMessage>,
) -> Store {
    let (tx, requests) = mpsc::channel(64);
    tokio::spawn(run_clone(name.clone(), endpoint, relay, intervals, requests, commands));
    Store::new(name, tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::StoreEvent;

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    fn intervals() -> CloneIntervals {
        CloneIntervals {
            resync: Duration::from_millis(100),
            stale: Duration::from_millis(300),
            mutation_buffer: Duration::from_millis(1000),
        }
    }

    fn make_state() -> (CloneState, mpsc::UnboundedReceiver<StoreEvent>, mpsc::UnboundedReceiver<Tick>)
    {
        let (relay, events) = StoreRelay::channel();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let state =
            CloneState::new(topic("s"), PeerId::from("ep"), relay, intervals(), ticks_tx);
        (state, events, ticks_rx)
    }

    fn expect_snapshot_request(events: &mut mpsc::UnboundedReceiver<StoreEvent>) {
        match events.try_recv().expect("an event is queued") {
            StoreEvent::Publish(msg) => {
                assert_eq!(msg.topic, topic("s/clone"));
                assert!(matches!(msg.command, Command::Snapshot { .. }));
            },
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_requests_snapshot_and_buffers_writes() {
        let (mut state, mut events, _ticks) = make_state();
        state.boot();
        expect_snapshot_request(&mut events);

        // Pre-sync writes are held back, not forwarded.
        state.handle_request(StoreRequest::Put {
            key: Data::Count(1),
            value: Data::from("x"),
            expiry: None,
        });
        assert!(events.try_recv().is_err());
        assert_eq!(state.status(), CloneStatus::Booting);

        // The snapshot installs, flips the clone live, and flushes the buffer.
        state.handle_command(CommandMessage::new(
            topic("s"),
            Command::Set { entries: BTreeMap::new() },
        ));
        assert_eq!(state.status(), CloneStatus::Live);
        match events.try_recv().unwrap() {
            StoreEvent::Publish(msg) => {
                assert_eq!(msg.topic, topic("s/clone"));
                assert!(matches!(msg.command, Command::Put { .. }));
            },
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_unavailable_until_live() {
        let (mut state, _events, _ticks) = make_state();
        state.boot();
        let (reply, rx) = oneshot::channel();
        state.handle_request(StoreRequest::Get { key: Data::Count(1), reply });
        assert!(matches!(rx.await.unwrap(), Err(Error::Unavailable)));

        state.handle_command(CommandMessage::new(
            topic("s"),
            Command::Set { entries: [(Data::Count(1), Data::from("x"))].into() },
        ));
        let (reply, rx) = oneshot::channel();
        state.handle_request(StoreRequest::Get { key: Data::Count(1), reply });
        assert_eq!(rx.await.unwrap().unwrap(), Some(Data::from("x")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_clone_applies_broadcasts_only() {
        let (mut state, mut events, _ticks) = make_state();
        state.boot();
        events.try_recv().unwrap();
        state.handle_command(CommandMessage::new(
            topic("s"),
            Command::Set { entries: BTreeMap::new() },
        ));

        // A local write is forwarded but not applied.
        state.handle_request(StoreRequest::Put {
            key: Data::from("k"),
            value: Data::Count(1),
            expiry: None,
        });
        assert!(state.contents().is_empty());
        match events.try_recv().unwrap() {
            StoreEvent::Publish(msg) => assert_eq!(msg.topic, topic("s/clone")),
            other => panic!("unexpected event {other:?}"),
        }

        // The echo from the master is what mutates the mirror.
        state.handle_command(CommandMessage::new(
            topic("s"),
            Command::Put { key: Data::from("k"), value: Data::Count(1), expiry: None },
        ));
        assert_eq!(state.contents()[&Data::from("k")], Data::Count(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_marks_clone_stale_and_rerequests() {
        let (mut state, mut events, mut ticks) = make_state();
        state.boot();
        events.try_recv().unwrap();
        state.handle_command(CommandMessage::new(
            topic("s"),
            Command::Set { entries: BTreeMap::new() },
        ));
        assert_eq!(state.status(), CloneStatus::Live);

        // Let the timers run out: the boot-generation resync tick fires and
        // is ignored, the staleness watchdog fires and counts.
        tokio::time::advance(Duration::from_millis(301)).await;
        for _ in 0..2 {
            let tick = ticks.recv().await.unwrap();
            state.handle_tick(tick);
        }
        assert_eq!(state.status(), CloneStatus::Stale);
        expect_snapshot_request(&mut events);

        // Mutating broadcasts are ignored while stale; a fresh snapshot
        // brings the clone back.
        state.handle_command(CommandMessage::new(
            topic("s"),
            Command::Put { key: Data::from("k"), value: Data::Count(1), expiry: None },
        ));
        assert!(state.contents().is_empty());
        state.handle_command(CommandMessage::new(
            topic("s"),
            Command::Set { entries: [(Data::from("k"), Data::Count(1))].into() },
        ));
        assert_eq!(state.status(), CloneStatus::Live);
        assert_eq!(state.contents()[&Data::from("k")], Data::Count(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_buffer_is_dropped() {
        let (mut state, mut events, mut ticks) = make_state();
        state.boot();
        events.try_recv().unwrap();
        state.handle_request(StoreRequest::Put {
            key: Data::from("k"),
            value: Data::Count(1),
            expiry: None,
        });

        // Run past the mutation buffer interval; the resync retry fires
        // first, then the buffer deadline.
        tokio::time::advance(Duration::from_millis(1001)).await;
        for _ in 0..2 {
            let tick = ticks.recv().await.unwrap();
            state.handle_tick(tick);
        }
        assert!(state.mutation_buffer.is_empty());
        assert_ne!(state.status(), CloneStatus::Live);
        // At least one re-request went out.
        expect_snapshot_request(&mut events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_unique_ack_resolves_pending_request() {
        let (mut state, mut events, _ticks) = make_state();
        state.boot();
        events.try_recv().unwrap();
        state.handle_command(CommandMessage::new(
            topic("s"),
            Command::Set { entries: BTreeMap::new() },
        ));

        let (reply, rx) = oneshot::channel();
        state.handle_request(StoreRequest::PutUnique {
            key: Data::from("k"),
            value: Data::Count(1),
            expiry: None,
            reply,
        });
        let req = match events.try_recv().unwrap() {
            StoreEvent::Publish(msg) => match msg.command {
                Command::PutUnique { req, .. } => req,
                other => panic!("expected a forwarded put_unique, got {}", other.kind()),
            },
            other => panic!("unexpected event {other:?}"),
        };
        state.handle_command(CommandMessage::new(
            topic("s"),
            Command::PutUniqueResult { req, inserted: true },
        ));
        assert!(rx.await.unwrap().unwrap());
    }
}
