//! Read path and index planning.

use super::Collection;
use crate::document::DOC_ID;
use crate::error::Result;
use crate::filter::Filter;
use crate::{Document, DocumentId, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Paging and ordering for [`Collection::find`]. Without a sort, results
/// come back in id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort: Vec<(String, SortOrder)>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }
}

fn compare_by(sort: &[(String, SortOrder)], a: &Document, b: &Document) -> Ordering {
    let null = Value::Null;
    for (field, order) in sort {
        let left = a.get(field).unwrap_or(&null);
        let right = b.get(field).unwrap_or(&null);
        let ordering = match order {
            SortOrder::Ascending => left.cmp(right),
            SortOrder::Descending => right.cmp(left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// The id a filter value selects. Integral floats equal the numeric id of
/// the same value; anything that is not an id matches no document.
fn lookup_id(value: &Value) -> Option<DocumentId> {
    match value {
        Value::Float(f) if f.fract() == 0.0 && *f >= 0.0 && *f < i64::MAX as f64 => {
            Some(DocumentId::Numeric(*f as i64))
        }
        other => DocumentId::from_value(other).ok(),
    }
}

impl Collection {
    /// Documents matching `filter`.
    pub fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>> {
        self.check_open()?;
        let mut docs = self.matching(filter)?;
        if !options.sort.is_empty() {
            docs.sort_by(|a, b| compare_by(&options.sort, a, b));
        }
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(docs.into_iter().skip(options.skip).take(limit).collect())
    }

    pub fn get_by_id(&self, id: &DocumentId) -> Result<Option<Document>> {
        self.check_open()?;
        self.primary.get(id)
    }

    pub fn size(&self) -> Result<usize> {
        self.check_open()?;
        self.primary.size()
    }

    /// Ids of matching documents in id order.
    pub(crate) fn find_ids(&self, filter: &Filter) -> Result<Vec<DocumentId>> {
        self.matching(filter)?
            .iter()
            .filter_map(|doc| doc.id().transpose())
            .collect()
    }

    fn matching(&self, filter: &Filter) -> Result<Vec<Document>> {
        let tokenizer = self.ctx.tokenizer();
        let mut docs = Vec::new();
        match self.candidates(filter)? {
            Some(ids) => {
                for id in ids {
                    if let Some(doc) = self.primary.get(&id)? {
                        if filter.matches_with(&doc, tokenizer)? {
                            docs.push(doc);
                        }
                    }
                }
            }
            None => {
                for doc in self.primary.values()? {
                    if filter.matches_with(&doc, tokenizer)? {
                        docs.push(doc);
                    }
                }
            }
        }
        Ok(docs)
    }

    /// Candidate ids answered by the primary map or a clean index, or `None`
    /// when a full scan is needed.
    fn candidates(&self, filter: &Filter) -> Result<Option<BTreeSet<DocumentId>>> {
        match filter {
            Filter::Eq(f, value) if f == DOC_ID => Ok(Some(lookup_id(value).into_iter().collect())),
            Filter::In(f, values) if f == DOC_ID => {
                Ok(Some(values.iter().filter_map(lookup_id).collect()))
            }
            Filter::And(children) => {
                let mut sets = Vec::new();
                for child in children {
                    if let Some(set) = self.candidates(child)? {
                        sets.push(set);
                    }
                }
                sets.sort_by_key(BTreeSet::len);
                let mut sets = sets.into_iter();
                let Some(mut result) = sets.next() else {
                    return Ok(None);
                };
                for set in sets {
                    if result.is_empty() {
                        break;
                    }
                    result.retain(|id| set.contains(id));
                }
                Ok(Some(result))
            }
            Filter::Or(children) => {
                let mut result = BTreeSet::new();
                for child in children {
                    match self.candidates(child)? {
                        Some(set) => result.extend(set),
                        None => return Ok(None),
                    }
                }
                Ok(Some(result))
            }
            Filter::All | Filter::Not(_) => Ok(None),
            leaf => {
                let Some(field) = leaf.field() else {
                    return Ok(None);
                };
                let Some(meta) = self.ctx.index_catalog().find_index_meta(self.name(), field) else {
                    return Ok(None);
                };
                if meta.is_dirty() {
                    tracing::debug!(
                        collection = %self.name(),
                        field = %field,
                        "Index is dirty, scanning"
                    );
                    return Ok(None);
                }
                let indexer = self.ctx.indexers().get(meta.kind())?;
                indexer.find(self.ctx.store(), &meta, leaf)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::collection;
    use super::*;
    use crate::field;
    use crate::index::{Geometry, IndexKind};

    fn seed(users: &Collection) {
        users
            .insert_many(vec![
                Document::new().with("_id", 1).with("name", "Alice").with("age", 30).with("city", "Lisbon"),
                Document::new().with("_id", 2).with("name", "Bob").with("age", 25).with("city", "Porto"),
                Document::new().with("_id", 3).with("name", "Carol").with("age", 35).with("city", "Lisbon"),
                Document::new().with("_id", 4).with("name", "Dave").with("city", "Faro"),
            ])
            .unwrap();
    }

    fn names(docs: &[Document]) -> Vec<&str> {
        docs.iter()
            .map(|d| d.get("name").and_then(Value::as_str).unwrap_or(""))
            .collect()
    }

    #[test]
    fn scans_and_indexed_reads_agree() {
        let (users, _) = collection("users");
        seed(&users);
        let filters = [
            field("age").gt(26),
            field("age").lte(30),
            field("city").eq("Lisbon"),
            field("city").in_values(["Porto", "Faro"]),
            field("age").eq(Value::Null),
            field("city").eq("Lisbon").and(field("age").gt(31)),
            field("city").eq("Porto").or(field("age").eq(35)),
            field("city").eq("Lisbon").not(),
        ];
        let scanned: Vec<_> = filters
            .iter()
            .map(|f| users.find(f, &FindOptions::default()).unwrap())
            .collect();

        users.create_index("age", IndexKind::NonUnique).unwrap();
        users.create_index("city", IndexKind::NonUnique).unwrap();
        for (filter, expected) in filters.iter().zip(scanned) {
            assert_eq!(users.find(filter, &FindOptions::default()).unwrap(), expected, "{filter:?}");
        }
    }

    #[test]
    fn id_lookups_use_primary_map() {
        let (users, _) = collection("users");
        seed(&users);
        let found = users.find(&field("_id").eq(3), &FindOptions::default()).unwrap();
        assert_eq!(names(&found), vec!["Carol"]);
        let found = users
            .find(&field("_id").in_values([1, 4, 9]), &FindOptions::default())
            .unwrap();
        assert_eq!(names(&found), vec!["Alice", "Dave"]);
        assert!(users
            .find(&field("_id").eq("nope"), &FindOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn integral_float_ids_find_numeric_documents() {
        let (users, _) = collection("users");
        seed(&users);
        let found = users.find(&field("_id").eq(3.0), &FindOptions::default()).unwrap();
        assert_eq!(names(&found), vec!["Carol"]);
        let found = users
            .find(&field("_id").in_values([1.0, 2.5, -4.0]), &FindOptions::default())
            .unwrap();
        assert_eq!(names(&found), vec!["Alice"]);

        // The same filter forced through a scan agrees.
        let scanned = users
            .find(&field("_id").eq(3.0).or(field("name").eq("nobody")), &FindOptions::default())
            .unwrap();
        assert_eq!(names(&scanned), vec!["Carol"]);
    }

    #[test]
    fn sort_skip_limit() {
        let (users, _) = collection("users");
        seed(&users);
        let options = FindOptions::new()
            .sort_by("age", SortOrder::Descending)
            .skip(1)
            .limit(2);
        let found = users.find(&Filter::All, &options).unwrap();
        assert_eq!(names(&found), vec!["Alice", "Bob"]);

        let options = FindOptions::new().sort_by("city", SortOrder::Ascending).sort_by("name", SortOrder::Descending);
        let found = users.find(&Filter::All, &options).unwrap();
        assert_eq!(names(&found), vec!["Dave", "Carol", "Alice", "Bob"]);
    }

    #[test]
    fn default_order_is_id_order() {
        let (users, _) = collection("users");
        users.create_index("tag", IndexKind::NonUnique).unwrap();
        for id in [5, 2, 9, 1] {
            users.insert(Document::new().with("_id", id).with("tag", "x")).unwrap();
        }
        let ids: Vec<_> = users
            .find(&field("tag").eq("x"), &FindOptions::default())
            .unwrap()
            .iter()
            .map(|d| d.id().unwrap().unwrap())
            .collect();
        assert_eq!(ids, [1, 2, 5, 9].map(DocumentId::Numeric).to_vec());
    }

    #[test]
    fn text_and_spatial_queries() {
        let (places, _) = collection("places");
        places
            .insert_many(vec![
                Document::new()
                    .with("_id", 1)
                    .with("about", "The quick brown fox")
                    .with("at", Geometry::point(1.0, 1.0).to_value()),
                Document::new()
                    .with("_id", 2)
                    .with("about", "A lazy dog sleeps")
                    .with("at", Geometry::point(8.0, 8.0).to_value()),
            ])
            .unwrap();
        places.create_index("about", IndexKind::FullText).unwrap();
        places.create_index("at", IndexKind::Spatial).unwrap();

        let found = places.find(&field("about").text("quick"), &FindOptions::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(places
            .find(&field("about").text("the"), &FindOptions::default())
            .unwrap()
            .is_empty());
        let found = places
            .find(&field("at").within(Geometry::rect(0.0, 0.0, 2.0, 2.0)), &FindOptions::default())
            .unwrap();
        assert_eq!(found[0].id().unwrap(), Some(DocumentId::Numeric(1)));
        let found = places
            .find(&field("at").near(7.5, 7.5, 1.0), &FindOptions::default())
            .unwrap();
        assert_eq!(found[0].id().unwrap(), Some(DocumentId::Numeric(2)));
    }
}
