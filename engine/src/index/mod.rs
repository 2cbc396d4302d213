//! Secondary indexes.
//!
//! Index maintenance is dispatched through the [`Indexer`] trait. Each index
//! kind has one indexer registered in an [`IndexerRegistry`]; the kind tag is
//! what the [`IndexCatalog`] persists, so dispatch never depends on statics.

mod catalog;
mod non_unique;
mod spatial;
mod text;
mod tokenizer;
mod unique;

pub use catalog::{IndexCatalog, IndexDescriptor, IndexMeta};
pub use non_unique::NonUniqueIndexer;
pub use spatial::{Envelope, Geometry, SpatialIndexer, SpatialKey};
pub use text::TextIndexer;
pub use tokenizer::{Language, TextTokenizer};
pub use unique::UniqueIndexer;

use crate::error::Result;
use crate::filter::Filter;
use crate::store::Store;
use crate::{CollectionName, DocumentId, Error, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::Arc;

/// The kind of a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexKind {
    Unique,
    NonUnique,
    FullText,
    Spatial,
}

impl IndexKind {
    pub fn tag(&self) -> &'static str {
        match self {
            IndexKind::Unique => "unique",
            IndexKind::NonUnique => "non-unique",
            IndexKind::FullText => "full-text",
            IndexKind::Spatial => "spatial",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for IndexKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unique" => Ok(IndexKind::Unique),
            "non-unique" => Ok(IndexKind::NonUnique),
            "full-text" => Ok(IndexKind::FullText),
            "spatial" => Ok(IndexKind::Spatial),
            other => Err(Error::Indexing(format!("unknown index kind '{other}'"))),
        }
    }
}

/// Key of a comparable secondary index. Missing fields index as `Null`,
/// which sorts before every other value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexKey(pub Value);

impl IndexKey {
    pub fn null() -> Self {
        IndexKey(Value::Null)
    }

    /// Keys for a field value. Arrays index each element once.
    pub fn keys_for(value: Option<&Value>) -> BTreeSet<IndexKey> {
        match value {
            None => BTreeSet::from([IndexKey::null()]),
            Some(Value::Array(items)) if items.is_empty() => BTreeSet::from([IndexKey::null()]),
            Some(Value::Array(items)) => items.iter().cloned().map(IndexKey).collect(),
            Some(value) => BTreeSet::from([IndexKey(value.clone())]),
        }
    }
}

/// Name of the map backing an index. Rebuilds add a suffix so the new map
/// can be filled next to the old one.
pub(crate) fn index_map_name(
    collection: &CollectionName,
    field: &str,
    kind: IndexKind,
    suffix: Option<&str>,
) -> String {
    match suffix {
        Some(suffix) => format!("$index|{collection}|{field}|{}|{suffix}", kind.tag()),
        None => format!("$index|{collection}|{field}|{}", kind.tag()),
    }
}

/// Maintains one kind of secondary index.
///
/// `value` is the field value of the document being indexed, `None` when the
/// document does not have the field.
pub trait Indexer: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Reject fields this kind cannot index.
    fn validate_field(&self, field: &str) -> Result<()> {
        if field.is_empty() {
            return Err(Error::Indexing("index field cannot be empty".into()));
        }
        Ok(())
    }

    fn write_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        value: Option<&Value>,
    ) -> Result<()>;

    fn remove_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        value: Option<&Value>,
    ) -> Result<()>;

    /// Re-index a changed document. On failure the old entries are restored.
    fn update_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        new_value: Option<&Value>,
        old_value: Option<&Value>,
    ) -> Result<()> {
        self.remove_index_entry(store, meta, id, old_value)?;
        if let Err(err) = self.write_index_entry(store, meta, id, new_value) {
            self.write_index_entry(store, meta, id, old_value)?;
            return Err(err);
        }
        Ok(())
    }

    /// Remove every map backing the index.
    fn drop_index(&self, store: &Store, meta: &IndexMeta) -> Result<()> {
        store.remove_map(&meta.index_map)
    }

    /// Candidate ids for a filter on the indexed field, or `None` when this
    /// index cannot answer the filter. Candidates may over-approximate; the
    /// caller re-checks every document against the full filter.
    fn find(
        &self,
        store: &Store,
        meta: &IndexMeta,
        filter: &Filter,
    ) -> Result<Option<BTreeSet<DocumentId>>>;
}

/// Indexers keyed by kind.
#[derive(Clone)]
pub struct IndexerRegistry {
    indexers: HashMap<IndexKind, Arc<dyn Indexer>>,
}

impl IndexerRegistry {
    pub fn empty() -> Self {
        Self {
            indexers: HashMap::new(),
        }
    }

    /// The four built-in indexers.
    pub fn with_defaults(tokenizer: Arc<TextTokenizer>) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(UniqueIndexer));
        registry.register(Arc::new(NonUniqueIndexer));
        registry.register(Arc::new(TextIndexer::new(tokenizer)));
        registry.register(Arc::new(SpatialIndexer));
        registry
    }

    /// Register an indexer, replacing any previous one of the same kind.
    pub fn register(&mut self, indexer: Arc<dyn Indexer>) {
        self.indexers.insert(indexer.kind(), indexer);
    }

    pub fn get(&self, kind: IndexKind) -> Result<Arc<dyn Indexer>> {
        self.indexers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Indexing(format!("no indexer registered for '{kind}'")))
    }
}

impl fmt::Debug for IndexerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.indexers.keys().collect();
        kinds.sort();
        f.debug_struct("IndexerRegistry").field("kinds", &kinds).finish()
    }
}

fn bound(key: &IndexKey, inclusive: bool) -> Bound<&IndexKey> {
    if inclusive {
        Bound::Included(key)
    } else {
        Bound::Excluded(key)
    }
}

/// Candidate lookup shared by the comparable (unique and non-unique)
/// indexes. `point` resolves one key, `range` scans key bounds.
pub(crate) fn find_comparable<P, R>(
    filter: &Filter,
    point: P,
    range: R,
) -> Result<Option<BTreeSet<DocumentId>>>
where
    P: Fn(&IndexKey) -> Result<BTreeSet<DocumentId>>,
    R: Fn(Bound<&IndexKey>, Bound<&IndexKey>) -> Result<BTreeSet<DocumentId>>,
{
    let ids = match filter {
        Filter::Eq(_, Value::Array(_)) => return Ok(None),
        Filter::Eq(_, value) => point(&IndexKey(value.clone()))?,
        Filter::In(_, values) => {
            if values.iter().any(|v| matches!(v, Value::Array(_))) {
                return Ok(None);
            }
            let mut ids = BTreeSet::new();
            for value in values {
                ids.extend(point(&IndexKey(value.clone()))?);
            }
            ids
        }
        Filter::Gt(_, value) => {
            let key = IndexKey(value.clone());
            range(Bound::Excluded(&key), Bound::Unbounded)?
        }
        Filter::Gte(_, value) => {
            let key = IndexKey(value.clone());
            range(Bound::Included(&key), Bound::Unbounded)?
        }
        Filter::Lt(_, value) => {
            let key = IndexKey(value.clone());
            range(Bound::Unbounded, Bound::Excluded(&key))?
        }
        Filter::Lte(_, value) => {
            let key = IndexKey(value.clone());
            range(Bound::Unbounded, Bound::Included(&key))?
        }
        Filter::Between {
            lower,
            upper,
            lower_inclusive,
            upper_inclusive,
            ..
        } => {
            if matches!(lower, Value::Array(_)) || matches!(upper, Value::Array(_)) {
                return Ok(None);
            }
            let (lower, upper) = (IndexKey(lower.clone()), IndexKey(upper.clone()));
            range(bound(&lower, *lower_inclusive), bound(&upper, *upper_inclusive))?
        }
        _ => return Ok(None),
    };
    Ok(Some(ids))
}
