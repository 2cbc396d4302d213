//! Typed ordered maps living inside a [`Store`](super::Store).

use super::{StoreInner, StoreState};
use crate::error::Result;
use crate::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Bounds for map keys.
pub trait MapKey: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapKey for T where T: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Bounds for map values.
pub trait MapValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Type-erased view of an open map, used by the store on commit.
pub(crate) trait StoredMap: Send + Sync {
    fn to_json(&self) -> Result<serde_json::Value>;
    fn detach(&self);
}

/// An ordered key-value map.
///
/// Reads that return collections (`keys`, `values`, `entries`, `range`) copy
/// the current contents, so callers can iterate while other threads write.
pub struct OrderedMap<K, V> {
    name: String,
    entries: RwLock<BTreeMap<K, V>>,
    state: Arc<StoreState>,
    store: Weak<StoreInner>,
    dropped: AtomicBool,
}

impl<K: MapKey, V: MapValue> OrderedMap<K, V> {
    pub(crate) fn new(
        name: String,
        entries: BTreeMap<K, V>,
        state: Arc<StoreState>,
        store: Weak<StoreInner>,
    ) -> Self {
        Self {
            name,
            entries: RwLock::new(entries),
            state,
            store,
            dropped: AtomicBool::new(false),
        }
    }

    /// Decode persisted `[key, value]` pairs.
    pub(crate) fn decode(name: &str, json: serde_json::Value) -> Result<BTreeMap<K, V>> {
        let pairs: Vec<(K, V)> = serde_json::from_value(json).map_err(|e| {
            Error::StorageIo(format!("map '{name}' does not match requested types: {e}"))
        })?;
        Ok(pairs.into_iter().collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_open(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::StorageIo("store is closed".into()));
        }
        if self.dropped.load(Ordering::SeqCst) {
            return Err(Error::StorageIo(format!("map '{}' was dropped", self.name)));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<K, V>>> {
        self.check_open()?;
        self.entries
            .read()
            .map_err(|_| Error::StorageIo(format!("map '{}' lock poisoned", self.name)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<K, V>>> {
        self.check_open()?;
        let guard = self
            .entries
            .write()
            .map_err(|_| Error::StorageIo(format!("map '{}' lock poisoned", self.name)))?;
        self.state.mark_dirty();
        Ok(guard)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.read()?.contains_key(key))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.read()?.get(key).cloned())
    }

    /// Insert or replace, returning the previous value.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        Ok(self.write()?.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        Ok(self.write()?.remove(key))
    }

    /// Insert only when the key is vacant. Returns the existing value
    /// otherwise, leaving it untouched.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        let mut entries = self.write()?;
        if let Some(existing) = entries.get(&key) {
            return Ok(Some(existing.clone()));
        }
        entries.insert(key, value);
        Ok(None)
    }

    /// Atomic read-modify-write of one entry. Leaving `None` in the slot
    /// removes the entry.
    pub fn alter<R>(&self, key: K, f: impl FnOnce(&mut Option<V>) -> R) -> Result<R> {
        let mut entries = self.write()?;
        let mut slot = entries.remove(&key);
        let result = f(&mut slot);
        if let Some(value) = slot {
            entries.insert(key, value);
        }
        Ok(result)
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    pub fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }

    /// Remove the map from its store. The handle is unusable afterwards.
    pub fn drop_map(&self) -> Result<()> {
        self.check_open()?;
        match self.store.upgrade() {
            Some(store) => store.remove_map(&self.name),
            None => Err(Error::StorageIo("store is closed".into())),
        }
    }

    /// Smallest key strictly greater than `key`.
    pub fn higher_key(&self, key: &K) -> Result<Option<K>> {
        let entries = self.read()?;
        let found = entries
            .range::<K, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone());
        Ok(found)
    }

    /// Smallest key greater than or equal to `key`.
    pub fn ceiling_key(&self, key: &K) -> Result<Option<K>> {
        let entries = self.read()?;
        let found = entries.range::<K, _>(key..).next().map(|(k, _)| k.clone());
        Ok(found)
    }

    /// Largest key strictly less than `key`.
    pub fn lower_key(&self, key: &K) -> Result<Option<K>> {
        let entries = self.read()?;
        let found = entries.range::<K, _>(..key).next_back().map(|(k, _)| k.clone());
        Ok(found)
    }

    /// Largest key less than or equal to `key`.
    pub fn floor_key(&self, key: &K) -> Result<Option<K>> {
        let entries = self.read()?;
        let found = entries.range::<K, _>(..=key).next_back().map(|(k, _)| k.clone());
        Ok(found)
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        Ok(self.read()?.keys().next().cloned())
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        Ok(self.read()?.keys().next_back().cloned())
    }

    pub fn keys(&self) -> Result<Vec<K>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.read()?.values().cloned().collect())
    }

    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        Ok(self
            .read()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Entries between two bounds in key order. Empty when the bounds are
    /// inverted.
    pub fn range(&self, lower: Bound<&K>, upper: Bound<&K>) -> Result<Vec<(K, V)>> {
        if bounds_are_empty(lower, upper) {
            return Ok(Vec::new());
        }
        let entries = self.read()?;
        Ok(entries
            .range::<K, _>((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// `BTreeMap::range` panics on inverted or empty-exclusive bounds.
fn bounds_are_empty<K: Ord>(lower: Bound<&K>, upper: Bound<&K>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

impl<K: MapKey, V: MapValue> StoredMap for OrderedMap<K, V> {
    fn to_json(&self) -> Result<serde_json::Value> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::StorageIo(format!("map '{}' lock poisoned", self.name)))?;
        let pairs: Vec<(&K, &V)> = entries.iter().collect();
        serde_json::to_value(pairs).map_err(|e| Error::StorageIo(e.to_string()))
    }

    fn detach(&self) {
        self.dropped.store(true, Ordering::SeqCst);
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl<K, V> fmt::Debug for OrderedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMap")
            .field("name", &self.name)
            .field("dropped", &self.dropped.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Store;
    use std::ops::Bound;

    #[test]
    fn navigation() {
        let store = Store::in_memory();
        let map = store.open_map::<i64, String>("nums").unwrap();
        for n in [10, 20, 30] {
            map.put(n, format!("v{n}")).unwrap();
        }

        assert_eq!(map.higher_key(&20).unwrap(), Some(30));
        assert_eq!(map.ceiling_key(&20).unwrap(), Some(20));
        assert_eq!(map.ceiling_key(&21).unwrap(), Some(30));
        assert_eq!(map.lower_key(&20).unwrap(), Some(10));
        assert_eq!(map.floor_key(&19).unwrap(), Some(10));
        assert_eq!(map.floor_key(&5).unwrap(), None);
        assert_eq!(map.higher_key(&30).unwrap(), None);
        assert_eq!(map.first_key().unwrap(), Some(10));
        assert_eq!(map.last_key().unwrap(), Some(30));
    }

    #[test]
    fn put_if_absent_keeps_existing() {
        let store = Store::in_memory();
        let map = store.open_map::<String, i64>("m").unwrap();
        assert_eq!(map.put_if_absent("a".into(), 1).unwrap(), None);
        assert_eq!(map.put_if_absent("a".into(), 2).unwrap(), Some(1));
        assert_eq!(map.get(&"a".into()).unwrap(), Some(1));
    }

    #[test]
    fn alter_removes_on_none() {
        let store = Store::in_memory();
        let map = store.open_map::<i64, Vec<i64>>("postings").unwrap();
        map.alter(1, |slot| slot.get_or_insert_with(Vec::new).push(7))
            .unwrap();
        assert_eq!(map.get(&1).unwrap(), Some(vec![7]));

        map.alter(1, |slot| *slot = None).unwrap();
        assert!(!map.contains_key(&1).unwrap());
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn range_scans() {
        let store = Store::in_memory();
        let map = store.open_map::<i64, i64>("r").unwrap();
        for n in 0..10 {
            map.put(n, n * n).unwrap();
        }

        let keys: Vec<i64> = map
            .range(Bound::Excluded(&3), Bound::Included(&6))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![4, 5, 6]);

        assert!(map
            .range(Bound::Included(&6), Bound::Included(&3))
            .unwrap()
            .is_empty());
        assert!(map
            .range(Bound::Excluded(&4), Bound::Excluded(&4))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn snapshot_iteration_survives_writes() {
        let store = Store::in_memory();
        let map = store.open_map::<i64, i64>("s").unwrap();
        map.put(1, 1).unwrap();
        map.put(2, 2).unwrap();

        let keys = map.keys().unwrap();
        for key in &keys {
            map.remove(key).unwrap();
            map.put(key + 100, 0).unwrap();
        }
        assert_eq!(keys, vec![1, 2]);
        assert_eq!(map.keys().unwrap(), vec![101, 102]);
    }

    #[test]
    fn dropped_map_rejects_operations() {
        let store = Store::in_memory();
        let map = store.open_map::<i64, i64>("gone").unwrap();
        map.put(1, 1).unwrap();
        map.drop_map().unwrap();

        assert!(map.get(&1).is_err());
        assert!(!store.has_map("gone").unwrap());

        let reopened = store.open_map::<i64, i64>("gone").unwrap();
        assert!(reopened.is_empty().unwrap());
    }
}
