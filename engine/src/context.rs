//! Shared engine state.
//!
//! One [`EngineContext`] is built per open database and handed to every
//! collection by `Arc`. Construction goes store, catalogs, indexers, event
//! bus; [`EngineContext::shutdown`] tears down in reverse.

use crate::catalog::StoreCatalog;
use crate::clock::{Clock, TombstoneCounter};
use crate::config::{Config, StoreConfig};
use crate::error::Result;
use crate::events::EventBus;
use crate::id::IdGenerator;
use crate::index::{IndexCatalog, IndexerRegistry, TextTokenizer};
use crate::store::{FileBackend, MemoryBackend, Store, StoreBackend};
use crate::Timestamp;
use std::sync::Arc;

pub struct EngineContext {
    config: Config,
    store: Store,
    catalog: StoreCatalog,
    index_catalog: IndexCatalog,
    indexers: IndexerRegistry,
    tokenizer: Arc<TextTokenizer>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    ids: IdGenerator,
    tombstone_counter: TombstoneCounter,
}

impl EngineContext {
    pub fn open(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let backend: Box<dyn StoreBackend> = match &config.store {
            StoreConfig::InMemory => Box::new(MemoryBackend),
            StoreConfig::File { path } => Box::new(FileBackend::new(path.clone())),
        };
        let store = Store::open(backend)?;
        Self::with_store(config, store, clock)
    }

    /// Build a context over an already opened store.
    pub fn with_store(config: Config, store: Store, clock: Arc<dyn Clock>) -> Result<Self> {
        let catalog = StoreCatalog::open(&store)?;
        let index_catalog = IndexCatalog::open(&store)?;
        let tokenizer = Arc::new(TextTokenizer::new(&config.text_languages));
        let indexers = IndexerRegistry::with_defaults(tokenizer.clone());
        let events = EventBus::new(config.event_workers)?;

        Ok(Self {
            config,
            store,
            catalog,
            index_catalog,
            indexers,
            tokenizer,
            events,
            clock,
            ids: IdGenerator::new(),
            tombstone_counter: TombstoneCounter::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn catalog(&self) -> &StoreCatalog {
        &self.catalog
    }

    pub fn index_catalog(&self) -> &IndexCatalog {
        &self.index_catalog
    }

    pub fn indexers(&self) -> &IndexerRegistry {
        &self.indexers
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    pub(crate) fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub(crate) fn tombstone_counter(&self) -> &TombstoneCounter {
        &self.tombstone_counter
    }

    /// Commit when auto-commit is on.
    pub(crate) fn after_write(&self) -> Result<()> {
        if self.config.auto_commit {
            self.store.commit()?;
        }
        Ok(())
    }

    /// Stop event dispatch, then commit and close the store.
    pub fn shutdown(&self) -> Result<()> {
        self.events.shutdown();
        self.store.close()
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("store", &self.store)
            .field("indexers", &self.indexers)
            .field("events", &self.events)
            .finish()
    }
}
