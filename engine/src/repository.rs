//! Typed repositories over collections.
//!
//! Conversion between a type and a [`Document`] is supplied by the caller
//! through [`DocumentMapper`]. [`SerdeMapper`] covers any serde type.

use crate::collection::{Collection, FindOptions, UpdateOptions};
use crate::error::Result;
use crate::filter::Filter;
use crate::{Document, DocumentId, Error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Converts values of `T` to and from documents.
pub trait DocumentMapper<T>: Send + Sync {
    fn to_document(&self, item: &T) -> Result<Document>;
    fn from_document(&self, doc: &Document) -> Result<T>;
}

/// Maps through `serde_json`. Engine fields are ignored on the way back
/// unless `T` declares them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeMapper;

impl<T> DocumentMapper<T> for SerdeMapper
where
    T: Serialize + DeserializeOwned,
{
    fn to_document(&self, item: &T) -> Result<Document> {
        let json = serde_json::to_value(item)
            .map_err(|e| Error::Validation(format!("cannot map to document: {e}")))?;
        Document::from_json(json)
    }

    fn from_document(&self, doc: &Document) -> Result<T> {
        serde_json::from_value(doc.to_json())
            .map_err(|e| Error::Validation(format!("cannot map from document: {e}")))
    }
}

/// Collection name for a repository of `T`, optionally keyed.
pub fn repository_name<T>(key: Option<&str>) -> String {
    let type_name = std::any::type_name::<T>();
    match key {
        Some(key) => format!("{type_name}+{key}"),
        None => type_name.to_string(),
    }
}

/// A collection of `T` values.
pub struct ObjectRepository<T> {
    collection: Arc<Collection>,
    mapper: Arc<dyn DocumentMapper<T>>,
    id_field: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjectRepository<T> {
    pub(crate) fn new(
        collection: Arc<Collection>,
        mapper: Arc<dyn DocumentMapper<T>>,
        id_field: Option<String>,
    ) -> Self {
        Self {
            collection,
            mapper,
            id_field,
            _marker: PhantomData,
        }
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    /// Field whose value becomes the document id, if any.
    pub fn id_field(&self) -> Option<&str> {
        self.id_field.as_deref()
    }

    fn to_document(&self, item: &T) -> Result<Document> {
        let mut doc = self.mapper.to_document(item)?;
        if let Some(field) = &self.id_field {
            let value = doc
                .get(field)
                .ok_or_else(|| Error::Validation(format!("id field '{field}' is missing")))?;
            let id = DocumentId::from_value(value)?;
            doc.set_id(&id);
        }
        Ok(doc)
    }

    pub fn insert(&self, item: &T) -> Result<DocumentId> {
        self.collection.insert(self.to_document(item)?)
    }

    pub fn insert_many(&self, items: &[T]) -> Result<Vec<DocumentId>> {
        let docs = items
            .iter()
            .map(|item| self.to_document(item))
            .collect::<Result<Vec<_>>>()?;
        self.collection.insert_many(docs)
    }

    /// Merge `item` into every matching document.
    pub fn update(&self, filter: &Filter, item: &T, insert_if_absent: bool) -> Result<usize> {
        let options = UpdateOptions {
            insert_if_absent,
            just_once: false,
        };
        self.collection.update(filter, &self.to_document(item)?, options)
    }

    /// Update the stored item with the same id. Needs an id field.
    pub fn update_item(&self, item: &T, insert_if_absent: bool) -> Result<usize> {
        if self.id_field.is_none() {
            return Err(Error::Validation(
                "repository has no id field to update by".into(),
            ));
        }
        self.collection
            .update_document(&self.to_document(item)?, insert_if_absent)
    }

    pub fn remove(&self, filter: &Filter) -> Result<usize> {
        self.collection.remove(filter, false)
    }

    pub fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<T>> {
        self.collection
            .find(filter, options)?
            .iter()
            .map(|doc| self.mapper.from_document(doc))
            .collect()
    }

    pub fn get_by_id(&self, id: &DocumentId) -> Result<Option<T>> {
        self.collection
            .get_by_id(id)?
            .map(|doc| self.mapper.from_document(&doc))
            .transpose()
    }

    pub fn size(&self) -> Result<usize> {
        self.collection.size()
    }
}

impl<T> std::fmt::Debug for ObjectRepository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRepository")
            .field("collection", &self.collection.name())
            .field("id_field", &self.id_field)
            .finish()
    }
}
