//! The authoritative (master) store actor.
//!
//! A master owns its key-value map outright and applies every command it
//! receives, in order, within one task. After a mutating command it
//! publishes the realized outcome on the store's topic so that all clones
//! replay the exact same sequence. Snapshot requests are answered with a
//! `Set` of the full contents shipped directly to the requester.

use crate::{
    frontend::{Store, StoreRequest},
    mutation,
    relay::StoreRelay,
};
use broker_core::{Command, CommandMessage, Data, PeerId, Timespan, Topic};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap},
};
use tokio::{
    sync::mpsc,
    time::{sleep_until, Duration, Instant},
};
use tracing::{debug, warn};

/// Poll interval used only when no expiry is pending.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// What applying one command asks the overlay to do next.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    /// Realized command to publish on the store topic.
    pub broadcast: Option<Command>,
    /// Command to ship to exactly one endpoint.
    pub direct: Option<(PeerId, Command)>,
}

/// Authoritative store contents plus expiry bookkeeping.
pub(crate) struct MasterState {
    name: Topic,
    store: BTreeMap<Data, Data>,
    clones: BTreeSet<PeerId>,
    /// Expiry generation per key; a heap entry only fires while its
    /// generation still matches, so overwrites invalidate old deadlines.
    expiry_gen: HashMap<Data, u64>,
    expiries: BinaryHeap<Reverse<(Instant, u64, Data)>>,
    generation: u64,
}

impl MasterState {
    pub(crate) fn new(name: Topic) -> Self {
        Self {
            name,
            store: BTreeMap::new(),
            clones: BTreeSet::new(),
            expiry_gen: HashMap::new(),
            expiries: BinaryHeap::new(),
            generation: 0,
        }
    }

    pub(crate) fn name(&self) -> &Topic {
        &self.name
    }

    pub(crate) fn contents(&self) -> &BTreeMap<Data, Data> {
        &self.store
    }

    pub(crate) fn clones(&self) -> &BTreeSet<PeerId> {
        &self.clones
    }

    fn schedule_expiry(&mut self, key: &Data, expiry: Option<Timespan>, now: Instant) {
        match expiry {
            Some(span) => {
                self.generation += 1;
                let deadline = match span.to_duration() {
                    Some(duration) => now + duration,
                    // A non-positive span expires immediately.
                    None => now,
                };
                self.expiry_gen.insert(key.clone(), self.generation);
                self.expiries.push(Reverse((deadline, self.generation, key.clone())));
            },
            None => {
                self.expiry_gen.remove(key);
            },
        }
    }

    /// Apply one command and report what to publish.
    pub(crate) fn apply(&mut self, cmd: Command, now: Instant) -> Outcome {
        match cmd {
            Command::Put { key, value, expiry } => {
                self.store.insert(key.clone(), value.clone());
                self.schedule_expiry(&key, expiry, now);
                Outcome { broadcast: Some(Command::Put { key, value, expiry }), direct: None }
            },
            Command::PutUnique { key, value, expiry, who, req } => {
                if self.store.contains_key(&key) {
                    debug!(store = %self.name, key = %key, "put_unique: key exists");
                    return Outcome {
                        broadcast: None,
                        direct: Some((who, Command::PutUniqueResult { req, inserted: false })),
                    };
                }
                self.store.insert(key.clone(), value.clone());
                self.schedule_expiry(&key, expiry, now);
                // Broadcast the realized outcome, never the tentative command.
                Outcome {
                    broadcast: Some(Command::Put { key, value, expiry }),
                    direct: Some((who, Command::PutUniqueResult { req, inserted: true })),
                }
            },
            Command::Erase { key } => {
                self.store.remove(&key);
                self.expiry_gen.remove(&key);
                Outcome { broadcast: Some(Command::Erase { key }), direct: None }
            },
            Command::Set { .. } | Command::Clear => {
                let outcome = match mutation::apply_mutation(&mut self.store, &cmd) {
                    Ok(()) => Outcome { broadcast: Some(cmd), direct: None },
                    Err(reason) => {
                        warn!(store = %self.name, reason, "reject command");
                        Outcome::default()
                    },
                };
                // Bulk replacement voids all scheduled expiries.
                self.expiry_gen.clear();
                outcome
            },
            Command::Add { .. } | Command::Subtract { .. } => {
                match mutation::apply_mutation(&mut self.store, &cmd) {
                    Ok(()) => Outcome { broadcast: Some(cmd), direct: None },
                    Err(reason) => {
                        warn!(store = %self.name, kind = cmd.kind(), reason, "reject command");
                        Outcome::default()
                    },
                }
            },
            Command::Snapshot { requester } => {
                debug!(store = %self.name, requester = %requester, "serving snapshot");
                self.clones.insert(requester.clone());
                Outcome {
                    broadcast: None,
                    direct: Some((requester, Command::Set { entries: self.store.clone() })),
                }
            },
            Command::PutUniqueResult { .. } => {
                debug!(store = %self.name, "ignore stray put_unique result");
                Outcome::default()
            },
        }
    }

    /// Earliest still-valid expiry deadline. Superseded heap entries are
    /// discarded on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, generation, key))) = self.expiries.peek() {
            if self.expiry_gen.get(key) == Some(generation) {
                return Some(*deadline);
            }
            self.expiries.pop();
        }
        None
    }

    /// Keys whose expiry deadline has passed.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Data> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, generation, key))) = self.expiries.peek() {
            if *deadline > now {
                break;
            }
            let live = self.expiry_gen.get(key) == Some(generation);
            let key = key.clone();
            self.expiries.pop();
            if live {
                self.expiry_gen.remove(&key);
                expired.push(key);
            }
        }
        expired
    }
}

fn emit(name: &Topic, relay: &StoreRelay, outcome: Outcome) {
    if let Some(cmd) = outcome.broadcast {
        relay.publish(CommandMessage::new(name.clone(), cmd));
    }
    if let Some((to, cmd)) = outcome.direct {
        relay.direct(to, CommandMessage::new(name.clone(), cmd));
    }
}

fn handle_request(state: &mut MasterState, relay: &StoreRelay, request: StoreRequest) {
    let now = Instant::now();
    match request {
        StoreRequest::Get { key, reply } => {
            let _ = reply.send(Ok(state.store.get(&key).cloned()));
        },
        StoreRequest::Keys { reply } => {
            let _ = reply.send(Ok(Data::Set(state.store.keys().cloned().collect())));
        },
        StoreRequest::Exists { key, reply } => {
            let _ = reply.send(Ok(state.store.contains_key(&key)));
        },
        StoreRequest::Put { key, value, expiry } => {
            let name = state.name.clone();
            emit(&name, relay, state.apply(Command::Put { key, value, expiry }, now));
        },
        StoreRequest::PutUnique { key, value, expiry, reply } => {
            // The local frontend gets its answer straight from the
            // authoritative state; remote requesters go through the
            // command path and its direct ack instead.
            let inserted = !state.store.contains_key(&key);
            if inserted {
                let name = state.name.clone();
                emit(&name, relay, state.apply(Command::Put { key, value, expiry }, now));
            }
            let _ = reply.send(Ok(inserted));
        },
        StoreRequest::Erase { key } => {
            let name = state.name.clone();
            emit(&name, relay, state.apply(Command::Erase { key }, now));
        },
        StoreRequest::Add { key, delta } => {
            let name = state.name.clone();
            emit(&name, relay, state.apply(Command::Add { key, delta }, now));
        },
        StoreRequest::Subtract { key, delta } => {
            let name = state.name.clone();
            emit(&name, relay, state.apply(Command::Subtract { key, delta }, now));
        },
        StoreRequest::SetAll { entries } => {
            let name = state.name.clone();
            emit(&name, relay, state.apply(Command::Set { entries }, now));
        },
        StoreRequest::Clear => {
            let name = state.name.clone();
            emit(&name, relay, state.apply(Command::Clear, now));
        },
    }
}

async fn run_master(
    name: Topic,
    relay: StoreRelay,
    mut requests: mpsc::Receiver<StoreRequest>,
    mut commands: mpsc::Receiver<CommandMessage>,
) {
    let mut state = MasterState::new(name.clone());
    debug!(store = %name, "master store running");
    loop {
        let deadline = state.next_deadline();
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => handle_request(&mut state, &relay, request),
                None => break,
            },
            msg = commands.recv() => match msg {
                Some(msg) => {
                    let outcome = state.apply(msg.command, Instant::now());
                    emit(&name, &relay, outcome);
                },
                None => break,
            },
            () = sleep_until(deadline.unwrap_or_else(|| Instant::now() + IDLE_WAIT)),
                if deadline.is_some() =>
            {
                let now = Instant::now();
                for key in state.take_expired(now) {
                    debug!(store = %name, key = %key, "entry expired");
                    let outcome = state.apply(Command::Erase { key }, now);
                    emit(&name, &relay, outcome);
                }
            },
        }
    }
    debug!(store = %name, "master store terminating");
}

/// Spawn a master store actor and return its frontend handle.
///
/// `commands` receives every [`CommandMessage`] the overlay routes to the
/// store (its clone channel in particular); outgoing traffic goes through
/// `relay`.
pub fn spawn_master(
    name: Topic,
    relay: StoreRelay,
    commands: mpsc::Receiver<CommandMessage>,
) -> Store {
    let (tx, requests) = mpsc::channel(64);
    tokio::spawn(run_master(name.clone(), relay, requests, commands));
    Store::new(name, tx)
}
