use super::{find_comparable, IndexKey, IndexKind, IndexMeta, Indexer};
use crate::error::Result;
use crate::filter::Filter;
use crate::store::{OrderedMap, Store};
use crate::{DocumentId, Error, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Unique index: each key maps to exactly one document.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueIndexer;

impl UniqueIndexer {
    fn map(store: &Store, meta: &IndexMeta) -> Result<Arc<OrderedMap<IndexKey, DocumentId>>> {
        store.open_map(&meta.index_map)
    }
}

impl Indexer for UniqueIndexer {
    fn kind(&self) -> IndexKind {
        IndexKind::Unique
    }

    fn write_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        value: Option<&Value>,
    ) -> Result<()> {
        let map = Self::map(store, meta)?;
        let mut written = Vec::new();

        for key in IndexKey::keys_for(value) {
            match map.put_if_absent(key.clone(), id.clone())? {
                Some(existing) if existing != *id => {
                    for key in &written {
                        map.remove(key)?;
                    }
                    return Err(Error::UniqueConstraint(format!(
                        "'{}' = {} already exists in collection '{}'",
                        meta.field(),
                        key.0,
                        meta.descriptor.collection
                    )));
                }
                Some(_) => {}
                None => written.push(key),
            }
        }
        Ok(())
    }

    fn remove_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        value: Option<&Value>,
    ) -> Result<()> {
        let map = Self::map(store, meta)?;
        for key in IndexKey::keys_for(value) {
            map.alter(key, |slot| {
                if slot.as_ref() == Some(id) {
                    *slot = None;
                }
            })?;
        }
        Ok(())
    }

    fn find(
        &self,
        store: &Store,
        meta: &IndexMeta,
        filter: &Filter,
    ) -> Result<Option<BTreeSet<DocumentId>>> {
        let map = Self::map(store, meta)?;
        find_comparable(
            filter,
            |key| Ok(map.get(key)?.into_iter().collect()),
            |lower, upper| {
                Ok(map
                    .range(lower, upper)?
                    .into_iter()
                    .map(|(_, id)| id)
                    .collect())
            },
        )
    }
}
