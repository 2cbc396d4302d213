//! Index lifecycle: create, rebuild, drop.
//!
//! Every build of a field holds that field's build flag, so two builds of the
//! same index never overlap. Builds also hold the collection write lock;
//! reads during a build see the dirty flag and scan the primary map.

use super::Collection;
use crate::document::DOC_ID;
use crate::error::Result;
use crate::events::{EventKind, Origin};
use crate::index::{index_map_name, IndexDescriptor, IndexKind, IndexMeta};
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Holds a field's build flag; releases it on drop.
struct BuildGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Collection {
    /// Create an index and fill it from the existing documents.
    pub fn create_index(&self, field: &str, kind: IndexKind) -> Result<()> {
        self.check_open()?;
        if field == DOC_ID {
            return Err(Error::Indexing(
                "_id is indexed by the primary map and cannot have a secondary index".into(),
            ));
        }
        let indexer = self.ctx.indexers().get(kind)?;
        indexer.validate_field(field)?;

        let _build = self.begin_build(field)?;
        let _guard = self.lock_writes();

        let descriptor = IndexDescriptor::new(self.name(), field, kind);
        let map = index_map_name(&self.name().to_string(), field, kind, None);
        let meta = self.ctx.index_catalog().create_index_entry(descriptor, map)?;

        tracing::info!(collection = %self.name(), field = %field, kind = %kind, "Creating index");
        if let Err(err) = self.fill(&meta) {
            indexer.drop_index(self.ctx.store(), &meta)?;
            self.ctx.index_catalog().remove_index_entry(self.name(), field)?;
            return Err(err);
        }
        self.finish_build(field)?;
        self.ctx.after_write()
    }

    /// Rebuild an index from the primary map into a fresh backing map, then
    /// swap it in. With `run_async` the build runs on the event runtime's
    /// blocking pool and this returns immediately.
    pub fn rebuild_index(self: &Arc<Self>, field: &str, run_async: bool) -> Result<()> {
        self.check_open()?;
        if self.ctx.index_catalog().find_index_meta(self.name(), field).is_none() {
            return Err(Error::Indexing(format!(
                "no index on '{field}' of collection '{}'",
                self.name()
            )));
        }
        let build = self.begin_build(field)?;

        if run_async {
            let this = Arc::clone(self);
            let field = field.to_string();
            self.ctx.events().spawn_blocking(move || {
                let _build = build;
                if let Err(err) = this.rebuild_locked(&field) {
                    tracing::warn!(
                        collection = %this.name(),
                        field = %field,
                        "Background rebuild failed: {}",
                        err
                    );
                }
            });
            Ok(())
        } else {
            let _build = build;
            self.rebuild_locked(field)?;
            self.ctx.after_write()
        }
    }

    fn rebuild_locked(&self, field: &str) -> Result<()> {
        let _guard = self.lock_writes();
        let meta = self
            .ctx
            .index_catalog()
            .find_index_meta(self.name(), field)
            .ok_or_else(|| Error::Indexing(format!("index on '{field}' was dropped")))?;
        let indexer = self.ctx.indexers().get(meta.kind())?;

        tracing::info!(collection = %self.name(), field = %field, kind = %meta.kind(), "Rebuilding index");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let mut fresh = meta.clone();
        fresh.index_map = index_map_name(&self.name().to_string(), field, meta.kind(), Some(&suffix));

        if let Err(err) = self.fill(&fresh) {
            indexer.drop_index(self.ctx.store(), &fresh)?;
            return Err(err);
        }

        let old_map = self
            .ctx
            .index_catalog()
            .swap_index_map(self.name(), field, fresh.index_map.clone())?;
        let mut old = meta;
        old.index_map = old_map;
        indexer.drop_index(self.ctx.store(), &old)?;
        self.finish_build(field)
    }

    /// Write every document into `meta`'s map, leaving the index dirty.
    /// Caller holds the write lock and the build flag.
    fn fill(&self, meta: &IndexMeta) -> Result<()> {
        let field = meta.field().to_string();
        let cancelled = self.cancel_flag(&field);
        cancelled.store(false, Ordering::SeqCst);

        self.ctx.index_catalog().mark_dirty(self.name(), &field)?;
        self.emit(EventKind::IndexStart, None, Some(field.clone()), Origin::Local);

        let mut count = 0usize;
        for (id, doc) in self.primary.entries()? {
            if cancelled.load(Ordering::SeqCst) {
                tracing::warn!(collection = %self.name(), field = %field, "Index build cancelled");
                return Err(Error::Indexing(format!(
                    "build of index on '{field}' was cancelled"
                )));
            }
            if let Err(err) = self.write_entry(meta, &id, &doc) {
                tracing::error!(
                    collection = %self.name(),
                    field = %field,
                    id = %id,
                    "Index build failed: {}",
                    err
                );
                return Err(err);
            }
            count += 1;
        }

        tracing::info!(collection = %self.name(), field = %field, documents = count, "Index built");
        Ok(())
    }

    /// Mark a completed build clean and announce it.
    fn finish_build(&self, field: &str) -> Result<()> {
        self.ctx.index_catalog().mark_clean(self.name(), field)?;
        self.emit(EventKind::IndexEnd, None, Some(field.to_string()), Origin::Local);
        Ok(())
    }

    /// Drop one index. Fails while a build of it is running.
    pub fn drop_index(&self, field: &str) -> Result<()> {
        self.check_open()?;
        let _build = self.begin_build(field)?;
        let _guard = self.lock_writes();

        let meta = self
            .ctx
            .index_catalog()
            .remove_index_entry(self.name(), field)?
            .ok_or_else(|| {
                Error::Indexing(format!("no index on '{field}' of collection '{}'", self.name()))
            })?;
        let indexer = self.ctx.indexers().get(meta.kind())?;
        indexer.drop_index(self.ctx.store(), &meta)?;

        tracing::info!(collection = %self.name(), field = %field, "Index dropped");
        self.ctx.after_write()
    }

    pub fn drop_all_indices(&self) -> Result<()> {
        for descriptor in self.list_indexes()? {
            self.drop_index(&descriptor.field)?;
        }
        Ok(())
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexDescriptor>> {
        self.check_open()?;
        Ok(self.ctx.index_catalog().list_index_descriptors(self.name()))
    }

    pub fn has_index(&self, field: &str) -> bool {
        self.ctx.index_catalog().has_index_entry(self.name(), field)
    }

    /// Whether a build of the field's index is running.
    pub fn is_indexing(&self, field: &str) -> bool {
        self.building
            .get(field)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Ask a running build to stop. The index is left dirty and keeps being
    /// answered by full scans until rebuilt. Returns whether a build was
    /// running.
    pub fn cancel_rebuild(&self, field: &str) -> bool {
        if !self.is_indexing(field) {
            return false;
        }
        self.cancel_flag(field).store(true, Ordering::SeqCst);
        true
    }

    fn begin_build(&self, field: &str) -> Result<BuildGuard> {
        let flag = self
            .building
            .entry(field.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Indexing(format!(
                "indexing is already running on '{field}' of collection '{}'",
                self.name()
            )));
        }
        Ok(BuildGuard { flag })
    }

    fn cancel_flag(&self, field: &str) -> Arc<AtomicBool> {
        self.cancelled
            .entry(field.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::collection;
    use super::super::FindOptions;
    use crate::{field, Document, DocumentId};
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_until_idle(users: &Collection, field: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while users.is_indexing(field) {
            assert!(Instant::now() < deadline, "rebuild did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn id_field_cannot_be_indexed() {
        let (users, _) = collection("users");
        let err = users.create_index("_id", IndexKind::Unique).unwrap_err();
        assert!(matches!(err, Error::Indexing(_)));
        assert!(users.create_index("", IndexKind::NonUnique).is_err());
    }

    #[test]
    fn one_index_per_field() {
        let (users, _) = collection("users");
        users.create_index("email", IndexKind::Unique).unwrap();
        let err = users.create_index("email", IndexKind::NonUnique).unwrap_err();
        assert!(matches!(err, Error::Indexing(_)));
        assert_eq!(users.list_indexes().unwrap().len(), 1);
        assert!(!users.is_indexing("email"));
    }

    #[test]
    fn create_on_existing_duplicates_fails_cleanly() {
        let (users, _) = collection("users");
        users
            .insert_many(vec![
                Document::new().with("email", "a"),
                Document::new().with("email", "a"),
            ])
            .unwrap();
        let err = users.create_index("email", IndexKind::Unique).unwrap_err();
        assert!(matches!(err, Error::UniqueConstraint(_)));
        assert!(!users.has_index("email"));
        users.create_index("email", IndexKind::NonUnique).unwrap();
    }

    #[test]
    fn rebuild_matches_fresh_build() {
        let (users, _) = collection("users");
        users.create_index("group", IndexKind::NonUnique).unwrap();
        for i in 0..20 {
            users
                .insert(Document::new().with("_id", i).with("group", i % 3))
                .unwrap();
        }
        let before = users.find(&field("group").eq(1), &FindOptions::default()).unwrap();
        let old_map = users
            .ctx
            .index_catalog()
            .find_index_meta("users", "group")
            .unwrap()
            .index_map;

        users.rebuild_index("group", false).unwrap();
        let new_map = users
            .ctx
            .index_catalog()
            .find_index_meta("users", "group")
            .unwrap()
            .index_map;
        assert_ne!(old_map, new_map);
        assert!(!users.ctx.store().has_map(&old_map).unwrap());
        assert!(!users.ctx.index_catalog().is_dirty("users", "group"));
        assert_eq!(
            users.find(&field("group").eq(1), &FindOptions::default()).unwrap(),
            before
        );
    }

    #[test]
    fn async_rebuild_finishes() {
        let (users, _) = collection("users");
        users.create_index("n", IndexKind::NonUnique).unwrap();
        for i in 0..200 {
            users.insert(Document::new().with("n", i % 10)).unwrap();
        }
        users.rebuild_index("n", true).unwrap();
        wait_until_idle(&users, "n");

        assert!(!users.ctx.index_catalog().is_dirty("users", "n"));
        let found = users.find(&field("n").eq(4), &FindOptions::default()).unwrap();
        assert_eq!(found.len(), 20);
    }

    #[test]
    fn rebuild_of_missing_index_fails() {
        let (users, _) = collection("users");
        assert!(matches!(
            users.rebuild_index("nope", false),
            Err(Error::Indexing(_))
        ));
    }

    #[test]
    fn drop_while_building_fails() {
        let (users, _) = collection("users");
        users.create_index("n", IndexKind::NonUnique).unwrap();
        let guard = users.begin_build("n").unwrap();
        assert!(users.is_indexing("n"));
        assert!(matches!(users.drop_index("n"), Err(Error::Indexing(_))));
        assert!(matches!(
            users.rebuild_index("n", false),
            Err(Error::Indexing(_))
        ));
        drop(guard);
        users.drop_index("n").unwrap();
        assert!(!users.has_index("n"));
    }

    #[test]
    fn dirty_index_forces_scan() {
        let (users, _) = collection("users");
        users.create_index("n", IndexKind::NonUnique).unwrap();
        users.insert(Document::new().with("_id", 1).with("n", 1)).unwrap();
        users.ctx.index_catalog().mark_dirty("users", "n").unwrap();

        // Writes skip the dirty index, scans still see the document.
        users.insert(Document::new().with("_id", 2).with("n", 1)).unwrap();
        let found = users.find(&field("n").eq(1), &FindOptions::default()).unwrap();
        assert_eq!(found.len(), 2);

        users.rebuild_index("n", false).unwrap();
        let found = users.find(&field("n").eq(1), &FindOptions::default()).unwrap();
        let ids: Vec<_> = found.iter().map(|d| d.id().unwrap().unwrap()).collect();
        assert_eq!(ids, vec![DocumentId::Numeric(1), DocumentId::Numeric(2)]);
    }

    #[test]
    fn drop_all() {
        let (users, _) = collection("users");
        users.create_index("a", IndexKind::NonUnique).unwrap();
        users.create_index("b", IndexKind::FullText).unwrap();
        users.drop_all_indices().unwrap();
        assert!(users.list_indexes().unwrap().is_empty());
        assert!(!users.cancel_rebuild("a"));
    }
}
