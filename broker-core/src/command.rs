//! Store mutation commands.
//!
//! Every mutation of a data store travels as a `Command` on the store's
//! topic. The master applies commands in arrival order and re-broadcasts the
//! realized outcome so that all clones converge on the master's sequence.

use crate::{
    data::Data,
    types::{PeerId, Timespan},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A command interpreted by a master store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Insert or overwrite a key, optionally expiring after `expiry`.
    Put {
        /// Store key
        key: Data,
        /// New value
        value: Data,
        /// Relative expiry, if any
        expiry: Option<Timespan>,
    },
    /// Insert only if the key is absent; the outcome is acked to `who`.
    PutUnique {
        /// Store key
        key: Data,
        /// New value
        value: Data,
        /// Relative expiry, if any
        expiry: Option<Timespan>,
        /// Endpoint that issued the request
        who: PeerId,
        /// Request tag correlating the ack
        req: u64,
    },
    /// Realized outcome of a [`Command::PutUnique`], shipped directly to the
    /// requester. Never broadcast, mutates nothing.
    PutUniqueResult {
        /// Request tag from the originating command
        req: u64,
        /// Whether the insert took place
        inserted: bool,
    },
    /// Remove a key.
    Erase {
        /// Store key
        key: Data,
    },
    /// Numeric increment or container append.
    Add {
        /// Store key
        key: Data,
        /// Amount or element(s) to add
        delta: Data,
    },
    /// Numeric decrement or container removal.
    Subtract {
        /// Store key
        key: Data,
        /// Amount or element(s) to remove
        delta: Data,
    },
    /// Replace the entire store contents.
    Set {
        /// New store contents
        entries: BTreeMap<Data, Data>,
    },
    /// Drop all entries.
    Clear,
    /// Request a full state transfer, answered directly to `requester`.
    Snapshot {
        /// Endpoint that wants the state
        requester: PeerId,
    },
}

impl Command {
    /// Short name for diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::PutUnique { .. } => "put_unique",
            Self::PutUniqueResult { .. } => "put_unique_result",
            Self::Erase { .. } => "erase",
            Self::Add { .. } => "add",
            Self::Subtract { .. } => "subtract",
            Self::Set { .. } => "set",
            Self::Clear => "clear",
            Self::Snapshot { .. } => "snapshot",
        }
    }

    /// Whether applying this command can change store contents.
    pub const fn is_mutation(&self) -> bool {
        !matches!(self, Self::Snapshot { .. } | Self::PutUniqueResult { .. })
    }
}
