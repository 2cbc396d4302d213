//! Index catalog.
//!
//! Index metadata lives in the reserved `$index_meta` map. A `DashMap`
//! mirror serves lookups on the hot path; every change is written through to
//! the persisted map before the mirror is updated.

use super::IndexKind;
use crate::catalog::INDEX_META_MAP;
use crate::error::Result;
use crate::store::{OrderedMap, Store};
use crate::{CollectionName, Error};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What is indexed: one field of one collection, with one index kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub collection: CollectionName,
    pub field: String,
    pub kind: IndexKind,
}

impl IndexDescriptor {
    pub fn new(collection: impl Into<CollectionName>, field: impl Into<String>, kind: IndexKind) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            kind,
        }
    }
}

/// Catalog record for one index.
///
/// The dirty flag is shared by every clone, so a reader holding a copy sees
/// a build start or finish.
#[derive(Debug, Clone)]
pub struct IndexMeta {
    pub descriptor: IndexDescriptor,
    pub index_map: String,
    dirty: Arc<AtomicBool>,
}

impl IndexMeta {
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn field(&self) -> &str {
        &self.descriptor.field
    }

    pub fn kind(&self) -> IndexKind {
        self.descriptor.kind
    }

    fn persisted(&self) -> PersistedIndexMeta {
        PersistedIndexMeta {
            descriptor: self.descriptor.clone(),
            index_map: self.index_map.clone(),
            dirty: self.is_dirty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedIndexMeta {
    descriptor: IndexDescriptor,
    index_map: String,
    dirty: bool,
}

type MetaKey = (CollectionName, String);

fn meta_key(collection: &str, field: &str) -> MetaKey {
    (collection.to_string(), field.to_string())
}

/// Registry of index metadata for every collection of a store.
#[derive(Debug)]
pub struct IndexCatalog {
    persisted: Arc<OrderedMap<MetaKey, PersistedIndexMeta>>,
    mirror: DashMap<MetaKey, IndexMeta>,
}

impl IndexCatalog {
    /// Load the catalog. Dirty flags persisted by an interrupted build stay
    /// set until the index is rebuilt.
    pub fn open(store: &Store) -> Result<Self> {
        let persisted = store.open_map::<MetaKey, PersistedIndexMeta>(INDEX_META_MAP)?;
        let mirror = DashMap::new();
        for (key, record) in persisted.entries()? {
            if record.dirty {
                tracing::warn!(
                    collection = %record.descriptor.collection,
                    field = %record.descriptor.field,
                    "Index was left dirty by an interrupted build"
                );
            }
            mirror.insert(
                key,
                IndexMeta {
                    descriptor: record.descriptor,
                    index_map: record.index_map,
                    dirty: Arc::new(AtomicBool::new(record.dirty)),
                },
            );
        }
        Ok(Self { persisted, mirror })
    }

    pub fn find_index_descriptor(&self, collection: &str, field: &str) -> Option<IndexDescriptor> {
        self.find_index_meta(collection, field)
            .map(|meta| meta.descriptor)
    }

    pub fn find_index_meta(&self, collection: &str, field: &str) -> Option<IndexMeta> {
        self.mirror
            .get(&meta_key(collection, field))
            .map(|entry| entry.value().clone())
    }

    /// Descriptors of one collection, sorted by field.
    pub fn list_index_descriptors(&self, collection: &str) -> Vec<IndexDescriptor> {
        self.list_index_metas(collection)
            .into_iter()
            .map(|meta| meta.descriptor)
            .collect()
    }

    pub fn list_index_metas(&self, collection: &str) -> Vec<IndexMeta> {
        let mut metas: Vec<IndexMeta> = self
            .mirror
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| entry.value().clone())
            .collect();
        metas.sort_by(|a, b| a.descriptor.field.cmp(&b.descriptor.field));
        metas
    }

    pub fn has_index_entry(&self, collection: &str, field: &str) -> bool {
        self.mirror.contains_key(&meta_key(collection, field))
    }

    /// Register a new index. Fails when the field already has one.
    pub fn create_index_entry(
        &self,
        descriptor: IndexDescriptor,
        index_map: String,
    ) -> Result<IndexMeta> {
        let key = meta_key(&descriptor.collection, &descriptor.field);
        match self.mirror.entry(key.clone()) {
            Entry::Occupied(existing) => Err(Error::Indexing(format!(
                "index already exists on '{}' of collection '{}' ({})",
                descriptor.field,
                descriptor.collection,
                existing.get().kind()
            ))),
            Entry::Vacant(slot) => {
                let meta = IndexMeta {
                    descriptor,
                    index_map,
                    dirty: Arc::new(AtomicBool::new(false)),
                };
                self.persisted.put(key, meta.persisted())?;
                slot.insert(meta.clone());
                Ok(meta)
            }
        }
    }

    pub fn remove_index_entry(&self, collection: &str, field: &str) -> Result<Option<IndexMeta>> {
        let key = meta_key(collection, field);
        self.persisted.remove(&key)?;
        Ok(self.mirror.remove(&key).map(|(_, meta)| meta))
    }

    pub fn mark_dirty(&self, collection: &str, field: &str) -> Result<()> {
        self.set_dirty(collection, field, true)
    }

    pub fn mark_clean(&self, collection: &str, field: &str) -> Result<()> {
        self.set_dirty(collection, field, false)
    }

    fn set_dirty(&self, collection: &str, field: &str, dirty: bool) -> Result<()> {
        let key = meta_key(collection, field);
        let entry = self.mirror.get(&key).ok_or_else(|| not_found(collection, field))?;
        entry.dirty.store(dirty, Ordering::SeqCst);
        self.persisted.put(key.clone(), entry.persisted())?;
        Ok(())
    }

    pub fn is_dirty(&self, collection: &str, field: &str) -> bool {
        self.mirror
            .get(&meta_key(collection, field))
            .map(|entry| entry.is_dirty())
            .unwrap_or(false)
    }

    /// Point an index at a new backing map, returning the old map name.
    pub(crate) fn swap_index_map(
        &self,
        collection: &str,
        field: &str,
        index_map: String,
    ) -> Result<String> {
        let key = meta_key(collection, field);
        let mut entry = self
            .mirror
            .get_mut(&key)
            .ok_or_else(|| not_found(collection, field))?;
        let old = std::mem::replace(&mut entry.index_map, index_map);
        if let Err(err) = self.persisted.put(key.clone(), entry.persisted()) {
            entry.index_map = old;
            return Err(err);
        }
        Ok(old)
    }

    /// Remove every index entry of a collection, returning the removed metadata.
    pub fn remove_collection(&self, collection: &str) -> Result<Vec<IndexMeta>> {
        let metas = self.list_index_metas(collection);
        for meta in &metas {
            self.remove_index_entry(collection, &meta.descriptor.field)?;
        }
        Ok(metas)
    }
}

fn not_found(collection: &str, field: &str) -> Error {
    Error::Indexing(format!(
        "no index on '{field}' of collection '{collection}'"
    ))
}
