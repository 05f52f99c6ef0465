//! The user-facing store handle.

use broker_core::{Data, Error, Result, Timespan, Topic};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};

/// Requests a [`Store`] handle forwards to its owning actor.
#[derive(Debug)]
pub(crate) enum StoreRequest {
    Get {
        key: Data,
        reply: oneshot::Sender<Result<Option<Data>>>,
    },
    Keys {
        reply: oneshot::Sender<Result<Data>>,
    },
    Exists {
        key: Data,
        reply: oneshot::Sender<Result<bool>>,
    },
    Put {
        key: Data,
        value: Data,
        expiry: Option<Timespan>,
    },
    PutUnique {
        key: Data,
        value: Data,
        expiry: Option<Timespan>,
        reply: oneshot::Sender<Result<bool>>,
    },
    Erase {
        key: Data,
    },
    Add {
        key: Data,
        delta: Data,
    },
    Subtract {
        key: Data,
        delta: Data,
    },
    SetAll {
        entries: BTreeMap<Data, Data>,
    },
    Clear,
}

/// Handle to a master or clone store attached to an endpoint.
///
/// Mutations are asynchronous: they travel to the authoritative master and
/// become visible through the master's broadcast. Reads are answered from
/// the local actor; a clone that is out of sync reports
/// [`Error::Unavailable`] instead of serving stale contents.
#[derive(Debug, Clone)]
pub struct Store {
    name: Topic,
    tx: mpsc::Sender<StoreRequest>,
}

impl Store {
    pub(crate) fn new(name: Topic, tx: mpsc::Sender<StoreRequest>) -> Self {
        Self { name, tx }
    }

    /// The store's name (its routing topic).
    pub fn name(&self) -> &Topic {
        &self.name
    }

    async fn request(&self, request: StoreRequest) -> Result<()> {
        self.tx.send(request).await.map_err(|_| Error::Detached)
    }

    /// Read one key.
    ///
    /// # Errors
    /// [`Error::Unavailable`] while a clone is out of sync, or
    /// [`Error::Detached`] after shutdown.
    pub async fn get(&self, key: impl Into<Data>) -> Result<Option<Data>> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreRequest::Get { key: key.into(), reply }).await?;
        rx.await.map_err(|_| Error::Detached)?
    }

    /// The set of all keys.
    ///
    /// # Errors
    /// Same conditions as [`Store::get`].
    pub async fn keys(&self) -> Result<Data> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreRequest::Keys { reply }).await?;
        rx.await.map_err(|_| Error::Detached)?
    }

    /// Whether a key currently exists.
    ///
    /// # Errors
    /// Same conditions as [`Store::get`].
    pub async fn exists(&self, key: impl Into<Data>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreRequest::Exists { key: key.into(), reply }).await?;
        rx.await.map_err(|_| Error::Detached)?
    }

    /// Insert or overwrite a key, optionally expiring it after `expiry`.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown.
    pub async fn put(
        &self,
        key: impl Into<Data>,
        value: impl Into<Data>,
        expiry: Option<Timespan>,
    ) -> Result<()> {
        self.request(StoreRequest::Put { key: key.into(), value: value.into(), expiry }).await
    }

    /// Insert only if the key is absent. The outcome is decided by the
    /// master, never inferred locally.
    ///
    /// # Errors
    /// [`Error::Unavailable`] if the ack cannot be produced (e.g. the master
    /// went away mid-request), [`Error::Detached`] after shutdown.
    pub async fn put_unique(
        &self,
        key: impl Into<Data>,
        value: impl Into<Data>,
        expiry: Option<Timespan>,
    ) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreRequest::PutUnique {
            key: key.into(),
            value: value.into(),
            expiry,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Detached)?
    }

    /// Remove a key.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown.
    pub async fn erase(&self, key: impl Into<Data>) -> Result<()> {
        self.request(StoreRequest::Erase { key: key.into() }).await
    }

    /// Numeric increment or container append.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown. Type mismatches are rejected by
    /// the master and become no-ops.
    pub async fn add(&self, key: impl Into<Data>, delta: impl Into<Data>) -> Result<()> {
        self.request(StoreRequest::Add { key: key.into(), delta: delta.into() }).await
    }

    /// Numeric decrement or container removal.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown.
    pub async fn subtract(&self, key: impl Into<Data>, delta: impl Into<Data>) -> Result<()> {
        self.request(StoreRequest::Subtract { key: key.into(), delta: delta.into() }).await
    }

    /// Replace the entire store contents.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown.
    pub async fn set_all(&self, entries: BTreeMap<Data, Data>) -> Result<()> {
        self.request(StoreRequest::SetAll { entries }).await
    }

    /// Drop all entries.
    ///
    /// # Errors
    /// [`Error::Detached`] after shutdown.
    pub async fn clear(&self) -> Result<()> {
        self.request(StoreRequest::Clear).await
    }
}
