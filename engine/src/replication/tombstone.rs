use crate::error::Result;
use crate::store::{OrderedMap, Store};
use crate::{CollectionName, DocumentId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Record of a deleted document, kept so replicas can tell a stale insert
/// from a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub id: DocumentId,
    pub delete_time: Timestamp,
    /// Delta cursor. Zero for deletes applied on behalf of the replicator.
    pub counter: i64,
    pub source_collection: CollectionName,
}

impl Tombstone {
    pub fn new(id: DocumentId, delete_time: Timestamp, counter: i64, source_collection: &str) -> Self {
        Self {
            id,
            delete_time,
            counter,
            source_collection: source_collection.to_string(),
        }
    }
}

/// Tombstones of one collection, stored in `<collection>$tombstones`.
#[derive(Debug, Clone)]
pub struct TombstoneMap {
    map: Arc<OrderedMap<DocumentId, Tombstone>>,
}

impl TombstoneMap {
    pub fn map_name(collection: &str) -> String {
        format!("{collection}$tombstones")
    }

    pub fn open(store: &Store, collection: &str) -> Result<Self> {
        Ok(Self {
            map: store.open_map(&Self::map_name(collection))?,
        })
    }

    pub fn name(&self) -> &str {
        self.map.name()
    }

    pub fn get(&self, id: &DocumentId) -> Result<Option<Tombstone>> {
        self.map.get(id)
    }

    pub fn contains(&self, id: &DocumentId) -> Result<bool> {
        self.map.contains_key(id)
    }

    /// Record a tombstone, replacing any earlier one for the same id.
    pub fn put(&self, tombstone: Tombstone) -> Result<()> {
        self.map.put(tombstone.id.clone(), tombstone)?;
        Ok(())
    }

    pub fn remove(&self, id: &DocumentId) -> Result<Option<Tombstone>> {
        self.map.remove(id)
    }

    /// All tombstones in id order.
    pub fn all(&self) -> Result<Vec<Tombstone>> {
        self.map.values()
    }

    pub fn size(&self) -> Result<usize> {
        self.map.size()
    }

    pub(crate) fn drop_map(&self) -> Result<()> {
        self.map.drop_map()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_per_collection() {
        let store = Store::in_memory();
        let users = TombstoneMap::open(&store, "users").unwrap();
        assert_eq!(users.name(), "users$tombstones");

        let id = DocumentId::from("a");
        users.put(Tombstone::new(id.clone(), 10, 10, "users")).unwrap();
        users.put(Tombstone::new(id.clone(), 20, 21, "users")).unwrap();
        assert_eq!(users.size().unwrap(), 1);
        assert_eq!(users.get(&id).unwrap().unwrap().delete_time, 20);

        let reopened = TombstoneMap::open(&store, "users").unwrap();
        assert!(reopened.contains(&id).unwrap());
        assert!(users.remove(&id).unwrap().is_some());
        assert!(!reopened.contains(&id).unwrap());
    }

    #[test]
    fn serializes_camel_case() {
        let tombstone = Tombstone::new(DocumentId::Numeric(5), 100, 0, "users");
        let json = serde_json::to_value(&tombstone).unwrap();
        assert_eq!(json["deleteTime"], 100);
        assert_eq!(json["sourceCollection"], "users");
        assert_eq!(json["id"], 5);
    }
}
