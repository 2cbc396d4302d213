//! Collections.
//!
//! A collection is a primary map `DocumentId -> Document` plus the secondary
//! indexes registered for it in the index catalog. Writes follow one path:
//! validate, take the write lock, update the primary map, fan out to every
//! clean index, then publish an event. Reads never take the write lock.

mod index_ops;
mod read;
mod write;

pub use read::{FindOptions, SortOrder};
pub use write::UpdateOptions;

use crate::catalog::{validate_collection_name, Attributes};
use crate::context::EngineContext;
use crate::error::Result;
use crate::events::{CollectionEvent, CollectionEventListener, EventKind, Origin, SubscriptionId};
use crate::replication::TombstoneMap;
use crate::store::OrderedMap;
use crate::{CollectionName, Document, DocumentId, Error};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// A named set of documents with its secondary indexes.
pub struct Collection {
    name: CollectionName,
    pub(crate) ctx: Arc<EngineContext>,
    pub(crate) primary: Arc<OrderedMap<DocumentId, Document>>,
    write_lock: Mutex<()>,
    merge_lock: Mutex<()>,
    tombstones: RwLock<Option<TombstoneMap>>,
    building: DashMap<String, Arc<AtomicBool>>,
    cancelled: DashMap<String, Arc<AtomicBool>>,
    open: AtomicBool,
}

impl Collection {
    /// Open a collection, creating it on first access.
    pub(crate) fn open(ctx: Arc<EngineContext>, name: &str) -> Result<Arc<Self>> {
        validate_collection_name(name)?;
        let primary = ctx.store().open_map::<DocumentId, Document>(name)?;
        if let Some(DocumentId::Numeric(last)) = primary.last_key()? {
            ctx.ids().observe(last);
        }

        ctx.catalog().register_collection(name)?;
        let now = ctx.now();
        let owner = ctx.config().node_id.clone();
        let attributes = ctx.catalog().update_attributes(name, |attrs| {
            if attrs.get(Attributes::CREATED_TIME).is_none() {
                *attrs = Attributes::new(&owner, now);
            }
            attrs.clone()
        })?;

        let tombstones = if attributes.contains(Attributes::TOMBSTONE_MAP_NAME) {
            Some(TombstoneMap::open(ctx.store(), name)?)
        } else {
            None
        };

        tracing::debug!(collection = %name, "Collection opened");
        Ok(Arc::new(Self {
            name: name.to_string(),
            ctx,
            primary,
            write_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
            tombstones: RwLock::new(tombstones),
            building: DashMap::new(),
            cancelled: DashMap::new(),
            open: AtomicBool::new(true),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.ctx.store().is_closed()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed(format!("collection '{}'", self.name)))
        }
    }

    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_merges(&self) -> MutexGuard<'_, ()> {
        self.merge_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tombstone map, when replication is attached.
    pub(crate) fn tombstones(&self) -> Option<TombstoneMap> {
        self.tombstones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start writing tombstones for local removals.
    pub(crate) fn attach_tombstones(&self) -> Result<TombstoneMap> {
        if let Some(existing) = self.tombstones() {
            return Ok(existing);
        }
        let map = TombstoneMap::open(self.ctx.store(), &self.name)?;
        let map_name = map.name().to_string();
        self.ctx.catalog().update_attributes(&self.name, |attrs| {
            attrs.set(Attributes::TOMBSTONE_MAP_NAME, map_name);
        })?;
        *self.tombstones.write().unwrap_or_else(PoisonError::into_inner) = Some(map.clone());
        Ok(map)
    }

    pub fn is_replicated(&self) -> bool {
        self.tombstones().is_some()
    }

    /// Remove every document. Index descriptors survive with empty maps.
    pub fn clear(&self) -> Result<()> {
        self.check_open()?;
        let _guard = self.lock_writes();

        self.primary.clear()?;
        for meta in self.ctx.index_catalog().list_index_metas(&self.name) {
            let indexer = self.ctx.indexers().get(meta.kind())?;
            indexer.drop_index(self.ctx.store(), &meta)?;
        }
        self.touch()?;
        tracing::info!(collection = %self.name, "Collection cleared");
        self.ctx.after_write()
    }

    /// Destroy the collection: documents, indexes, tombstones and catalog
    /// entries. The handle is closed afterwards.
    pub fn drop_collection(&self) -> Result<()> {
        self.check_open()?;
        let _guard = self.lock_writes();

        for meta in self.ctx.index_catalog().remove_collection(&self.name)? {
            let indexer = self.ctx.indexers().get(meta.kind())?;
            indexer.drop_index(self.ctx.store(), &meta)?;
        }
        if let Some(tombstones) = self.tombstones() {
            tombstones.drop_map()?;
        }
        self.primary.drop_map()?;
        self.ctx.catalog().remove(&self.name)?;

        self.ctx.events().unsubscribe_collection(&self.name);
        self.open.store(false, Ordering::SeqCst);
        tracing::info!(collection = %self.name, "Collection dropped");
        self.ctx.after_write()
    }

    /// Detach listeners and invalidate this handle. Persisted data is kept.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.ctx.events().unsubscribe_collection(&self.name);
            tracing::debug!(collection = %self.name, "Collection closed");
        }
    }

    pub fn subscribe(&self, listener: impl CollectionEventListener) -> Result<SubscriptionId> {
        self.check_open()?;
        Ok(self.ctx.events().subscribe(&self.name, Arc::new(listener)))
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.ctx.events().unsubscribe(id)
    }

    pub fn attributes(&self) -> Result<Attributes> {
        self.check_open()?;
        Ok(self
            .ctx
            .catalog()
            .attributes(&self.name)?
            .unwrap_or_default())
    }

    pub fn set_attributes(&self, attributes: Attributes) -> Result<()> {
        self.check_open()?;
        self.ctx.catalog().set_attributes(&self.name, attributes)
    }

    /// Refresh the `lastModifiedTime` attribute.
    fn touch(&self) -> Result<()> {
        let now = self.ctx.now();
        self.ctx.catalog().update_attributes(&self.name, |attrs| {
            attrs.set(Attributes::LAST_MODIFIED_TIME, now.to_string());
        })
    }

    fn emit(&self, kind: EventKind, document: Option<Document>, field: Option<String>, originator: Origin) {
        self.ctx.events().publish(CollectionEvent {
            collection: self.name.clone(),
            kind,
            document,
            field,
            timestamp: self.ctx.now(),
            originator,
        });
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::Config;
    use crate::index::IndexKind;

    pub(crate) fn context() -> (Arc<EngineContext>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(1_000));
        let ctx = EngineContext::open(Config::in_memory().with_event_workers(1), clock.clone())
            .unwrap();
        (Arc::new(ctx), clock)
    }

    pub(crate) fn collection(name: &str) -> (Arc<Collection>, Arc<FixedClock>) {
        let (ctx, clock) = context();
        (Collection::open(ctx, name).unwrap(), clock)
    }

    #[test]
    fn open_registers_catalog_entry_and_attributes() {
        let (ctx, _) = context();
        let users = Collection::open(ctx.clone(), "users").unwrap();
        assert!(ctx.catalog().contains("users").unwrap());

        let attrs = users.attributes().unwrap();
        assert_eq!(attrs.get(Attributes::OWNER_COLLECTION), Some("local"));
        assert_eq!(attrs.timestamp(Attributes::CREATED_TIME), Some(1_000));
        assert!(attrs.get(Attributes::UNIQUE_ID).is_some());
        assert!(!users.is_replicated());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let (ctx, _) = context();
        assert!(matches!(
            Collection::open(ctx.clone(), ""),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            Collection::open(ctx, "a$b"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn closed_handle_rejects_operations() {
        let (users, _) = collection("users");
        users.insert(Document::new().with("a", 1)).unwrap();
        users.close();
        assert!(!users.is_open());
        assert!(matches!(users.size(), Err(Error::Closed(_))));
        assert!(matches!(
            users.insert(Document::new()),
            Err(Error::Closed(_))
        ));
        users.close();
    }

    #[test]
    fn clear_keeps_indexes() {
        let (users, _) = collection("users");
        users.create_index("age", IndexKind::NonUnique).unwrap();
        users.insert(Document::new().with("age", 30)).unwrap();
        users.clear().unwrap();

        assert_eq!(users.size().unwrap(), 0);
        assert!(users.has_index("age"));
        users.insert(Document::new().with("age", 30)).unwrap();
        let found = users
            .find(&crate::field("age").eq(30), &FindOptions::default())
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn drop_removes_everything() {
        let (ctx, _) = context();
        let users = Collection::open(ctx.clone(), "users").unwrap();
        users.create_index("email", IndexKind::Unique).unwrap();
        users.insert(Document::new().with("email", "a@b")).unwrap();
        users.drop_collection().unwrap();

        assert!(!users.is_open());
        assert!(!ctx.catalog().contains("users").unwrap());
        assert!(ctx.index_catalog().list_index_descriptors("users").is_empty());
        let names = ctx.store().map_names().unwrap();
        assert!(!names.iter().any(|n| n == "users" || n.starts_with("$index|users|")));
    }

    #[test]
    fn attributes_roundtrip() {
        let (users, _) = collection("users");
        let mut attrs = users.attributes().unwrap();
        attrs.set(Attributes::SYNC_LOCK, "true");
        users.set_attributes(attrs).unwrap();
        assert_eq!(
            users.attributes().unwrap().get(Attributes::SYNC_LOCK),
            Some("true")
        );
    }
}
