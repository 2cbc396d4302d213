//! Store catalog: which collections and repositories exist, their attribute
//! bags, and store-wide info such as the schema version.

use crate::error::Result;
use crate::store::{OrderedMap, Store};
use crate::{CollectionName, Error, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Collection and repository registry.
pub const STORE_CATALOG_MAP: &str = "$store_catalog";
/// Persisted index metadata.
pub const INDEX_META_MAP: &str = "$index_meta";
/// Per-collection attribute bags.
pub const ATTRIBUTES_MAP: &str = "$attributes";
/// Store-wide info.
pub const STORE_INFO_MAP: &str = "$store_info";

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// What a catalog name refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CatalogEntry {
    Collection,
    #[serde(rename_all = "camelCase")]
    Repository { type_name: String },
}

/// String-keyed property bag persisted per collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes {
    values: BTreeMap<String, String>,
}

impl Attributes {
    pub const CREATED_TIME: &'static str = "createdTime";
    pub const LAST_MODIFIED_TIME: &'static str = "lastModifiedTime";
    /// Node that created the collection.
    pub const OWNER_COLLECTION: &'static str = "ownerCollection";
    pub const UNIQUE_ID: &'static str = "uniqueId";
    pub const SYNC_LOCK: &'static str = "syncLock";
    pub const LAST_SYNC_TIME: &'static str = "lastSyncTime";
    /// Name of the tombstone map; present once replication is attached.
    pub const TOMBSTONE_MAP_NAME: &'static str = "tombstoneMapName";
    pub const REPLICA: &'static str = "replicaId";

    /// Fresh attributes for a newly created collection.
    pub fn new(owner: &str, now: Timestamp) -> Self {
        let mut attributes = Self::default();
        attributes.set(Self::OWNER_COLLECTION, owner);
        attributes.set(Self::CREATED_TIME, now.to_string());
        attributes.set(Self::LAST_MODIFIED_TIME, now.to_string());
        attributes.set(Self::UNIQUE_ID, uuid::Uuid::new_v4().to_string());
        attributes
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Read an attribute holding epoch millis.
    pub fn timestamp(&self, key: &str) -> Option<Timestamp> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }
}

/// Reject names that would collide with reserved maps or derived map names.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("collection name cannot be empty".into()));
    }
    if name.contains('$') || name.contains('|') {
        return Err(Error::Validation(format!(
            "collection name '{name}' contains a reserved character"
        )));
    }
    Ok(())
}

/// Typed view over the reserved catalog maps.
#[derive(Debug, Clone)]
pub struct StoreCatalog {
    entries: Arc<OrderedMap<CollectionName, CatalogEntry>>,
    attributes: Arc<OrderedMap<CollectionName, Attributes>>,
    info: Arc<OrderedMap<String, Value>>,
}

impl StoreCatalog {
    pub fn open(store: &Store) -> Result<Self> {
        Ok(Self {
            entries: store.open_map(STORE_CATALOG_MAP)?,
            attributes: store.open_map(ATTRIBUTES_MAP)?,
            info: store.open_map(STORE_INFO_MAP)?,
        })
    }

    pub fn register_collection(&self, name: &str) -> Result<()> {
        self.entries
            .put_if_absent(name.to_string(), CatalogEntry::Collection)?;
        Ok(())
    }

    /// Record a repository. The backing collection is registered as one.
    pub fn register_repository(&self, name: &str, type_name: &str) -> Result<()> {
        self.entries.put(
            name.to_string(),
            CatalogEntry::Repository {
                type_name: type_name.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn entry(&self, name: &str) -> Result<Option<CatalogEntry>> {
        self.entries.get(&name.to_string())
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        self.entries.contains_key(&name.to_string())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.entries.remove(&name.to_string())?;
        self.attributes.remove(&name.to_string())?;
        Ok(())
    }

    /// Names of plain collections, sorted.
    pub fn collection_names(&self) -> Result<Vec<CollectionName>> {
        Ok(self
            .entries
            .entries()?
            .into_iter()
            .filter(|(_, entry)| matches!(entry, CatalogEntry::Collection))
            .map(|(name, _)| name)
            .collect())
    }

    /// `(collection, type name)` for every registered repository.
    pub fn repositories(&self) -> Result<Vec<(CollectionName, String)>> {
        Ok(self
            .entries
            .entries()?
            .into_iter()
            .filter_map(|(name, entry)| match entry {
                CatalogEntry::Repository { type_name } => Some((name, type_name)),
                CatalogEntry::Collection => None,
            })
            .collect())
    }

    pub fn attributes(&self, name: &str) -> Result<Option<Attributes>> {
        self.attributes.get(&name.to_string())
    }

    pub fn set_attributes(&self, name: &str, attributes: Attributes) -> Result<()> {
        self.attributes.put(name.to_string(), attributes)?;
        Ok(())
    }

    /// Atomically change one collection's attributes, creating them if absent.
    pub fn update_attributes<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Attributes) -> R,
    ) -> Result<R> {
        self.attributes.alter(name.to_string(), |slot| {
            f(slot.get_or_insert_with(Attributes::default))
        })
    }

    pub fn schema_version(&self) -> Result<Option<u32>> {
        Ok(self
            .info
            .get(&SCHEMA_VERSION_KEY.to_string())?
            .and_then(|v| v.as_i64())
            .and_then(|v| u32::try_from(v).ok()))
    }

    pub fn set_schema_version(&self, version: u32) -> Result<()> {
        self.info
            .put(SCHEMA_VERSION_KEY.to_string(), Value::from(version))?;
        Ok(())
    }
}
