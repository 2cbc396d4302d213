use super::tokenizer::TextQuery;
use super::{IndexKind, IndexMeta, Indexer, TextTokenizer};
use crate::error::Result;
use crate::filter::Filter;
use crate::store::{OrderedMap, Store};
use crate::{DocumentId, Value};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;

type Postings = OrderedMap<String, BTreeSet<DocumentId>>;
type TokenMemory = OrderedMap<DocumentId, BTreeSet<String>>;

/// Full-text index: token postings plus the token set written for each
/// document, so removal never re-tokenizes stored text.
#[derive(Debug, Clone)]
pub struct TextIndexer {
    tokenizer: Arc<TextTokenizer>,
}

impl TextIndexer {
    pub fn new(tokenizer: Arc<TextTokenizer>) -> Self {
        Self { tokenizer }
    }

    fn postings(store: &Store, meta: &IndexMeta) -> Result<Arc<Postings>> {
        store.open_map(&meta.index_map)
    }

    fn memory(store: &Store, meta: &IndexMeta) -> Result<Arc<TokenMemory>> {
        store.open_map(&format!("{}|tokens", meta.index_map))
    }

    fn add_postings(postings: &Postings, id: &DocumentId, tokens: &BTreeSet<String>) -> Result<()> {
        for token in tokens {
            postings.alter(token.clone(), |slot| {
                slot.get_or_insert_with(BTreeSet::new).insert(id.clone());
            })?;
        }
        Ok(())
    }

    fn remove_postings(
        postings: &Postings,
        id: &DocumentId,
        tokens: &BTreeSet<String>,
    ) -> Result<()> {
        for token in tokens {
            postings.alter(token.clone(), |slot| {
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

    fn search(&self, postings: &Postings, query: &TextQuery) -> Result<BTreeSet<DocumentId>> {
        let mut ids = BTreeSet::new();
        match query {
            TextQuery::Tokens(tokens) => {
                for token in tokens {
                    ids.extend(postings.get(token)?.unwrap_or_default());
                }
            }
            TextQuery::Prefix(term) => {
                let entries = postings.range(Bound::Included(term), Bound::Unbounded)?;
                for (token, posting) in entries {
                    if !token.starts_with(term.as_str()) {
                        break;
                    }
                    ids.extend(posting);
                }
            }
            TextQuery::Suffix(_) | TextQuery::Contains(_) => {
                for (token, posting) in postings.entries()? {
                    if query.matches_token(&token) {
                        ids.extend(posting);
                    }
                }
            }
        }
        Ok(ids)
    }
}

impl Indexer for TextIndexer {
    fn kind(&self) -> IndexKind {
        IndexKind::FullText
    }

    fn write_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        value: Option<&Value>,
    ) -> Result<()> {
        let tokens = self.tokenizer.tokenize_value(meta.field(), value)?;
        let memory = Self::memory(store, meta)?;
        let postings = Self::postings(store, meta)?;

        let previous = memory.get(id)?.unwrap_or_default();
        let added: BTreeSet<String> = tokens.difference(&previous).cloned().collect();
        Self::add_postings(&postings, id, &added)?;

        let all: BTreeSet<String> = previous.union(&tokens).cloned().collect();
        if !all.is_empty() {
            memory.put(id.clone(), all)?;
        }
        Ok(())
    }

    fn remove_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        _value: Option<&Value>,
    ) -> Result<()> {
        let memory = Self::memory(store, meta)?;
        let postings = Self::postings(store, meta)?;
        if let Some(tokens) = memory.remove(id)? {
            Self::remove_postings(&postings, id, &tokens)?;
        }
        Ok(())
    }

    /// Diff the remembered tokens against the new value's tokens.
    fn update_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        new_value: Option<&Value>,
        _old_value: Option<&Value>,
    ) -> Result<()> {
        let new_tokens = self.tokenizer.tokenize_value(meta.field(), new_value)?;
        let memory = Self::memory(store, meta)?;
        let postings = Self::postings(store, meta)?;

        let old_tokens = memory.get(id)?.unwrap_or_default();
        let removed: BTreeSet<String> = old_tokens.difference(&new_tokens).cloned().collect();
        let added: BTreeSet<String> = new_tokens.difference(&old_tokens).cloned().collect();
        Self::remove_postings(&postings, id, &removed)?;
        Self::add_postings(&postings, id, &added)?;

        if new_tokens.is_empty() {
            memory.remove(id)?;
        } else {
            memory.put(id.clone(), new_tokens)?;
        }
        Ok(())
    }

    fn drop_index(&self, store: &Store, meta: &IndexMeta) -> Result<()> {
        store.remove_map(&meta.index_map)?;
        store.remove_map(&format!("{}|tokens", meta.index_map))
    }

    fn find(
        &self,
        store: &Store,
        meta: &IndexMeta,
        filter: &Filter,
    ) -> Result<Option<BTreeSet<DocumentId>>> {
        let Filter::Text(_, query) = filter else {
            return Ok(None);
        };
        let query = self.tokenizer.parse_query(query)?;
        let postings = Self::postings(store, meta)?;
        self.search(&postings, &query).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexCatalog, IndexDescriptor};
    use crate::Error;

    fn setup() -> (Store, IndexMeta, TextIndexer) {
        let store = Store::in_memory();
        let catalog = IndexCatalog::open(&store).unwrap();
        let meta = catalog
            .create_index_entry(
                IndexDescriptor::new("notes", "body", IndexKind::FullText),
                "$index|notes|body|full-text".into(),
            )
            .unwrap();
        (store, meta, TextIndexer::new(Arc::new(TextTokenizer::default())))
    }

    fn search(store: &Store, meta: &IndexMeta, indexer: &TextIndexer, query: &str) -> Vec<DocumentId> {
        indexer
            .find(store, meta, &Filter::Text("body".into(), query.into()))
            .unwrap()
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn exact_and_wildcard_search() {
        let (store, meta, indexer) = setup();
        let docs = [
            (1, "Rust makes systems programming fun"),
            (2, "Programmers love the borrow checker"),
            (3, "Gardening in spring"),
        ];
        for (id, text) in docs {
            indexer
                .write_index_entry(&store, &meta, &DocumentId::from(id), Some(&Value::from(text)))
                .unwrap();
        }

        assert_eq!(search(&store, &meta, &indexer, "rust"), vec![DocumentId::from(1)]);
        assert_eq!(search(&store, &meta, &indexer, "program*").len(), 2);
        assert_eq!(search(&store, &meta, &indexer, "*ing"), vec![
            DocumentId::from(1),
            DocumentId::from(3)
        ]);
        assert_eq!(search(&store, &meta, &indexer, "*arden*"), vec![DocumentId::from(3)]);
        assert!(search(&store, &meta, &indexer, "the").is_empty());

        let err = indexer
            .find(&store, &meta, &Filter::Text("body".into(), "*".into()))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn update_diffs_tokens() {
        let (store, meta, indexer) = setup();
        let id = DocumentId::from(1);
        let old = Value::from("red green");
        let new = Value::from("green blue");
        indexer.write_index_entry(&store, &meta, &id, Some(&old)).unwrap();
        indexer
            .update_index_entry(&store, &meta, &id, Some(&new), Some(&old))
            .unwrap();

        assert!(search(&store, &meta, &indexer, "red").is_empty());
        assert_eq!(search(&store, &meta, &indexer, "green"), vec![id.clone()]);
        assert_eq!(search(&store, &meta, &indexer, "blue"), vec![id]);
    }

    #[test]
    fn remove_uses_remembered_tokens() {
        let (store, meta, indexer) = setup();
        let id = DocumentId::from(1);
        indexer
            .write_index_entry(&store, &meta, &id, Some(&Value::from("alpha beta")))
            .unwrap();
        // The stored value is not needed to remove the entry.
        indexer.remove_index_entry(&store, &meta, &id, None).unwrap();

        assert!(search(&store, &meta, &indexer, "alpha").is_empty());
        assert!(TextIndexer::postings(&store, &meta).unwrap().is_empty().unwrap());
        assert!(TextIndexer::memory(&store, &meta).unwrap().is_empty().unwrap());
    }

    #[test]
    fn non_string_value_fails() {
        let (store, meta, indexer) = setup();
        let err = indexer
            .write_index_entry(&store, &meta, &DocumentId::from(1), Some(&Value::Int(5)))
            .unwrap_err();
        assert!(matches!(err, Error::Indexing(_)));
    }

    #[test]
    fn drop_removes_both_maps() {
        let (store, meta, indexer) = setup();
        indexer
            .write_index_entry(&store, &meta, &DocumentId::from(1), Some(&Value::from("x")))
            .unwrap();
        indexer.drop_index(&store, &meta).unwrap();
        assert!(!store.has_map(&meta.index_map).unwrap());
        assert!(!store.has_map(&format!("{}|tokens", meta.index_map)).unwrap());
    }
}
