//! Record store handle
//!
//! [`RecordStore`] is a cheaply cloneable handle over an optional open
//! [`StorageEngine`]. Reads take a snapshot of the engine handle; writes are
//! serialized behind a single write lock and committed as one atomic batch, after
//! which the matching events are fired on the shared [`EventBroker`].

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{info, warn};
use zeroize::Zeroizing;

use peerpost_core::{
    Event, EventBroker, EventPayload, PeerpostConfig, PeerpostError, Result, StorageError,
    StoreConfig,
};

use crate::engine::StorageEngine;

struct StoreInner {
    engine: RwLock<Option<Arc<StorageEngine>>>,
    write_lock: Mutex<()>,
    password: RwLock<Option<Zeroizing<String>>>,
    broker: EventBroker,
    config: StoreConfig,
}

/// Shared handle to the encrypted record store
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

impl core::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecordStore")
            .field("path", &self.inner.config.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl RecordStore {
    pub fn new(config: StoreConfig, broker: EventBroker) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                engine: RwLock::new(None),
                write_lock: Mutex::new(()),
                password: RwLock::new(None),
                broker,
                config,
            }),
        }
    }

    /// Build a closed store and its broker from the `store` and `broker` sections
    pub fn from_config(config: &PeerpostConfig) -> Self {
        Self::new(config.store.clone(), EventBroker::from_config(&config.broker))
    }

    pub fn broker(&self) -> &EventBroker {
        &self.inner.broker
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    // ---- Lifecycle ----

    /// Open the on-disk database with `password`
    pub fn open(&self, password: &str) -> Result<()> {
        self.open_with(password, |config, password| {
            StorageEngine::open(config, password)
        })
    }

    /// Open a throwaway in-memory-backed database
    pub fn open_temporary(&self, password: &str) -> Result<()> {
        self.open_with(password, |config, password| {
            StorageEngine::open_temporary(config, password)
        })
    }

    fn open_with<F>(&self, password: &str, open: F) -> Result<()>
    where
        F: FnOnce(&StoreConfig, &str) -> Result<StorageEngine>,
    {
        if self.is_open() {
            return Err(StorageError::AlreadyOpen.into());
        }
        let engine = open(&self.inner.config, password)?;
        {
            let mut slot = self.inner.engine.write().map_err(|_| poisoned())?;
            if slot.is_some() {
                return Err(StorageError::AlreadyOpen.into());
            }
            *slot = Some(Arc::new(engine));
        }
        if let Ok(mut stored) = self.inner.password.write() {
            *stored = Some(Zeroizing::new(password.to_string()));
        }
        info!("record store opened");
        self.fire(EventPayload::DatabaseOpened);
        Ok(())
    }

    /// Flush and release the database; a closed store can be reopened
    pub fn close(&self) -> Result<()> {
        let _guard = self.write_guard()?;
        let engine = self.inner.engine.write().map_err(|_| poisoned())?.take();
        if let Some(engine) = engine {
            if let Err(e) = engine.flush() {
                warn!(error = %e, "flush on close failed");
            }
            info!("record store closed");
        }
        if let Ok(mut stored) = self.inner.password.write() {
            *stored = None;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .engine
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Check `password` against the one the store was opened with
    pub fn verify_password(&self, password: &str) -> Result<()> {
        if password.trim().is_empty() {
            return Err(PeerpostError::config_error("password cannot be empty"));
        }
        let stored = self.inner.password.read().map_err(|_| poisoned())?;
        match stored.as_ref() {
            None => Err(StorageError::NotOpen.into()),
            Some(expected) if expected.as_str() == password => Ok(()),
            Some(_) => Err(StorageError::EncryptionKeyMismatch.into()),
        }
    }

    // ---- Internal access ----

    pub(crate) fn engine(&self) -> Result<Arc<StorageEngine>> {
        self.inner
            .engine
            .read()
            .map_err(|_| poisoned())?
            .clone()
            .ok_or_else(|| StorageError::NotOpen.into())
    }

    pub(crate) fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.inner.write_lock.lock().map_err(|_| poisoned())
    }

    pub(crate) fn fire(&self, payload: EventPayload) {
        self.inner.broker.fire(Event::new(payload));
    }
}

fn poisoned() -> PeerpostError {
    PeerpostError::engine_error("store lock poisoned")
}

/// Apply `offset`/`limit` paging; past-the-end offsets yield nothing
pub(crate) fn page<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}
