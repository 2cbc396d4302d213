use super::{find_comparable, IndexKey, IndexKind, IndexMeta, Indexer};
use crate::error::Result;
use crate::filter::Filter;
use crate::store::{OrderedMap, Store};
use crate::{DocumentId, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Non-unique index: each key maps to an ordered set of documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonUniqueIndexer;

type Postings = OrderedMap<IndexKey, BTreeSet<DocumentId>>;

impl NonUniqueIndexer {
    fn map(store: &Store, meta: &IndexMeta) -> Result<Arc<Postings>> {
        store.open_map(&meta.index_map)
    }
}

impl Indexer for NonUniqueIndexer {
    fn kind(&self) -> IndexKind {
        IndexKind::NonUnique
    }

    fn write_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        value: Option<&Value>,
    ) -> Result<()> {
        let map = Self::map(store, meta)?;
        for key in IndexKey::keys_for(value) {
            map.alter(key, |slot| {
                slot.get_or_insert_with(BTreeSet::new).insert(id.clone());
            })?;
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
                if let Some(ids) = slot {
                    ids.remove(id);
                    if ids.is_empty() {
                        *slot = None;
                    }
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
            |key| Ok(map.get(key)?.unwrap_or_default()),
            |lower, upper| {
                Ok(map
                    .range(lower, upper)?
                    .into_iter()
                    .flat_map(|(_, ids)| ids)
                    .collect())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexCatalog, IndexDescriptor};

    fn setup() -> (Store, IndexMeta) {
        let store = Store::in_memory();
        let catalog = IndexCatalog::open(&store).unwrap();
        let meta = catalog
            .create_index_entry(
                IndexDescriptor::new("users", "city", IndexKind::NonUnique),
                "$index|users|city|non-unique".into(),
            )
            .unwrap();
        (store, meta)
    }

    fn eq(value: &str) -> Filter {
        Filter::Eq("city".into(), Value::from(value))
    }

    #[test]
    fn shared_keys_collect_ids() {
        let (store, meta) = setup();
        let lisbon = Value::from("Lisbon");
        for n in 1..=3 {
            NonUniqueIndexer
                .write_index_entry(&store, &meta, &DocumentId::from(n), Some(&lisbon))
                .unwrap();
        }
        let found = NonUniqueIndexer.find(&store, &meta, &eq("Lisbon")).unwrap().unwrap();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn empty_posting_is_removed() {
        let (store, meta) = setup();
        let porto = Value::from("Porto");
        NonUniqueIndexer
            .write_index_entry(&store, &meta, &DocumentId::from(1), Some(&porto))
            .unwrap();
        NonUniqueIndexer
            .remove_index_entry(&store, &meta, &DocumentId::from(1), Some(&porto))
            .unwrap();

        let map = NonUniqueIndexer::map(&store, &meta).unwrap();
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn arrays_and_in_filter() {
        let (store, meta) = setup();
        let cities = Value::Array(vec![Value::from("Lisbon"), Value::from("Porto")]);
        NonUniqueIndexer
            .write_index_entry(&store, &meta, &DocumentId::from(1), Some(&cities))
            .unwrap();
        NonUniqueIndexer
            .write_index_entry(&store, &meta, &DocumentId::from(2), Some(&Value::from("Faro")))
            .unwrap();

        assert_eq!(
            NonUniqueIndexer.find(&store, &meta, &eq("Porto")).unwrap().unwrap(),
            BTreeSet::from([DocumentId::from(1)])
        );
        let filter = Filter::In("city".into(), vec![Value::from("Faro"), Value::from("Lisbon")]);
        assert_eq!(
            NonUniqueIndexer.find(&store, &meta, &filter).unwrap().unwrap().len(),
            2
        );
    }

    #[test]
    fn update_moves_entry() {
        let (store, meta) = setup();
        let old = Value::from("Lisbon");
        let new = Value::from("Porto");
        NonUniqueIndexer
            .write_index_entry(&store, &meta, &DocumentId::from(1), Some(&old))
            .unwrap();
        NonUniqueIndexer
            .update_index_entry(&store, &meta, &DocumentId::from(1), Some(&new), Some(&old))
            .unwrap();

        assert!(NonUniqueIndexer.find(&store, &meta, &eq("Lisbon")).unwrap().unwrap().is_empty());
        assert_eq!(NonUniqueIndexer.find(&store, &meta, &eq("Porto")).unwrap().unwrap().len(), 1);
    }
}
