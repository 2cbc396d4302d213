//! Ordered map store.
//!
//! A [`Store`] is a registry of named, typed [`OrderedMap`]s over a pluggable
//! [`StoreBackend`]. Maps are created on first open. Committed contents of
//! maps that have not been reopened yet are kept as raw JSON and carried into
//! the next commit untouched.

mod backend;
mod map;

pub use backend::{FileBackend, MemoryBackend, StoreBackend, StoreSnapshot, STORE_FORMAT_VERSION};
pub use map::{MapKey, MapValue, OrderedMap};

use crate::error::Result;
use crate::Error;
use map::StoredMap;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Flags shared between a store and all of its maps.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    closed: AtomicBool,
    dirty: AtomicBool,
}

impl StoreState {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

struct MapHandle {
    stored: Arc<dyn StoredMap>,
    typed: Arc<dyn Any + Send + Sync>,
}

pub(crate) struct StoreInner {
    backend: Box<dyn StoreBackend>,
    state: Arc<StoreState>,
    open: RwLock<HashMap<String, MapHandle>>,
    /// Committed maps not opened since the store was loaded.
    unopened: Mutex<BTreeMap<String, serde_json::Value>>,
    commit_lock: Mutex<()>,
}

impl StoreInner {
    fn check_open(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::StorageIo("store is closed".into()));
        }
        Ok(())
    }

    pub(crate) fn remove_map(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let handle = self
            .open
            .write()
            .map_err(|_| poisoned())?
            .remove(name);
        let unopened = self.unopened.lock().map_err(|_| poisoned())?.remove(name);

        if let Some(handle) = &handle {
            handle.stored.detach();
        }
        if handle.is_some() || unopened.is_some() {
            self.state.mark_dirty();
            tracing::debug!(map = %name, "Map removed");
        }
        Ok(())
    }
}

fn poisoned() -> Error {
    Error::StorageIo("store registry lock poisoned".into())
}

/// A named collection of ordered maps with commit/close semantics.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open a store over a backend, loading its last committed snapshot.
    pub fn open(backend: Box<dyn StoreBackend>) -> Result<Self> {
        let snapshot = backend.load()?;
        let durable = backend.is_durable();
        let maps = snapshot.map(|s| s.maps).unwrap_or_default();

        tracing::info!(durable, maps = maps.len(), "Store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                backend,
                state: Arc::new(StoreState::default()),
                open: RwLock::new(HashMap::new()),
                unopened: Mutex::new(maps),
                commit_lock: Mutex::new(()),
            }),
        })
    }

    /// Ephemeral store.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend: Box::new(MemoryBackend),
                state: Arc::new(StoreState::default()),
                open: RwLock::new(HashMap::new()),
                unopened: Mutex::new(BTreeMap::new()),
                commit_lock: Mutex::new(()),
            }),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.inner.backend.is_durable()
    }

    /// Open a map by name, creating it if absent.
    ///
    /// Reopening returns the same shared handle. Asking for an existing map
    /// with different key or value types fails.
    pub fn open_map<K: MapKey, V: MapValue>(&self, name: &str) -> Result<Arc<OrderedMap<K, V>>> {
        self.inner.check_open()?;
        let mut open = self.inner.open.write().map_err(|_| poisoned())?;

        if let Some(handle) = open.get(name) {
            return handle.typed.clone().downcast::<OrderedMap<K, V>>().map_err(|_| {
                Error::StorageIo(format!("map '{name}' is open with different types"))
            });
        }

        let persisted = self
            .inner
            .unopened
            .lock()
            .map_err(|_| poisoned())?
            .get(name)
            .cloned();
        let entries = match persisted {
            Some(json) => OrderedMap::<K, V>::decode(name, json)?,
            None => BTreeMap::new(),
        };
        // Decoded successfully, so the raw copy is no longer the source of truth.
        self.inner
            .unopened
            .lock()
            .map_err(|_| poisoned())?
            .remove(name);

        let map = Arc::new(OrderedMap::new(
            name.to_string(),
            entries,
            self.inner.state.clone(),
            Arc::downgrade(&self.inner),
        ));
        open.insert(
            name.to_string(),
            MapHandle {
                stored: map.clone(),
                typed: map.clone(),
            },
        );
        Ok(map)
    }

    /// Remove a map and its contents. Open handles become unusable.
    pub fn remove_map(&self, name: &str) -> Result<()> {
        self.inner.remove_map(name)
    }

    pub fn has_map(&self, name: &str) -> Result<bool> {
        self.inner.check_open()?;
        let open = self.inner.open.read().map_err(|_| poisoned())?;
        if open.contains_key(name) {
            return Ok(true);
        }
        Ok(self
            .inner
            .unopened
            .lock()
            .map_err(|_| poisoned())?
            .contains_key(name))
    }

    /// Names of every map, open or not, in sorted order.
    pub fn map_names(&self) -> Result<Vec<String>> {
        self.inner.check_open()?;
        let mut names: BTreeSet<String> = self
            .inner
            .open
            .read()
            .map_err(|_| poisoned())?
            .keys()
            .cloned()
            .collect();
        names.extend(
            self.inner
                .unopened
                .lock()
                .map_err(|_| poisoned())?
                .keys()
                .cloned(),
        );
        Ok(names.into_iter().collect())
    }

    /// Whether anything changed since the last commit.
    pub fn has_unsaved_changes(&self) -> bool {
        self.inner.state.dirty.load(Ordering::SeqCst)
    }

    /// Persist all maps. A no-op when nothing changed.
    pub fn commit(&self) -> Result<()> {
        self.inner.check_open()?;
        self.commit_inner()
    }

    fn commit_inner(&self) -> Result<()> {
        let _guard = self.inner.commit_lock.lock().map_err(|_| poisoned())?;
        if !self.inner.state.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.write_snapshot();
        if result.is_err() {
            self.inner.state.mark_dirty();
        }
        result
    }

    fn write_snapshot(&self) -> Result<()> {
        let mut snapshot = StoreSnapshot::new();
        snapshot.maps = self.inner.unopened.lock().map_err(|_| poisoned())?.clone();

        let open = self.inner.open.read().map_err(|_| poisoned())?;
        for (name, handle) in open.iter() {
            snapshot.maps.insert(name.clone(), handle.stored.to_json()?);
        }
        drop(open);

        self.inner.backend.persist(&snapshot)?;
        tracing::info!(maps = snapshot.maps.len(), "Store committed");
        Ok(())
    }

    /// Commit and close. Later operations on the store or any of its maps
    /// fail. Closing twice is a no-op.
    ///
    /// When the final commit fails the store stays open with its changes
    /// unsaved, so the caller can retry.
    pub fn close(&self) -> Result<()> {
        if self.inner.state.is_closed() {
            return Ok(());
        }
        if let Err(err) = self.commit_inner() {
            tracing::error!("Final commit failed, store left open: {}", err);
            return Err(err);
        }
        self.inner.state.closed.store(true, Ordering::SeqCst);
        if let Ok(mut open) = self.inner.open.write() {
            open.clear();
        }
        tracing::info!("Store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.inner.backend)
            .field("closed", &self.is_closed())
            .finish()
    }
}
