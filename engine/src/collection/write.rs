//! Write path: insert, update, remove and their replicated variants.

use super::Collection;
use crate::document::{DOC_ID, DOC_MODIFIED, DOC_REVISION, DOC_SOURCE};
use crate::error::Result;
use crate::events::{EventKind, Origin};
use crate::filter::Filter;
use crate::index::IndexMeta;
use crate::replication::Tombstone;
use crate::{Document, DocumentId, Error, Timestamp};

/// Options for [`Collection::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert the update document when nothing matches.
    pub insert_if_absent: bool,
    /// Update only the first match, in id order.
    pub just_once: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self {
            insert_if_absent: true,
            just_once: false,
        }
    }

    pub fn just_once() -> Self {
        Self {
            insert_if_absent: false,
            just_once: true,
        }
    }
}

fn origin_of(doc: &Document) -> Origin {
    if doc.is_replicated() {
        Origin::Replicator
    } else {
        Origin::Local
    }
}

impl Collection {
    /// Insert a document, returning its id. An id is generated when the
    /// document has none.
    pub fn insert(&self, doc: Document) -> Result<DocumentId> {
        self.check_open()?;
        let origin = origin_of(&doc);
        let id = {
            let _guard = self.lock_writes();
            let stored = self.insert_locked(doc, false)?;
            let id = stored.id()?.ok_or_else(|| Error::InvalidId("missing after insert".into()))?;
            self.emit(EventKind::Insert, Some(stored), None, origin);
            id
        };
        self.touch()?;
        self.ctx.after_write()?;
        Ok(id)
    }

    /// Insert several documents. Either all of them are inserted or, on the
    /// first failure, none are.
    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<DocumentId>> {
        self.check_open()?;
        let mut inserted: Vec<(Document, Origin)> = Vec::with_capacity(docs.len());
        let mut ids = Vec::with_capacity(docs.len());
        {
            let _guard = self.lock_writes();
            for doc in docs {
                let origin = origin_of(&doc);
                match self.insert_locked(doc, false) {
                    Ok(stored) => inserted.push((stored, origin)),
                    Err(err) => {
                        tracing::warn!(
                            collection = %self.name,
                            rolled_back = inserted.len(),
                            "Batch insert failed: {}",
                            err
                        );
                        for (stored, _) in inserted.iter().rev() {
                            self.discard_locked(stored)?;
                        }
                        return Err(err);
                    }
                }
            }

            for (stored, origin) in inserted {
                if let Some(id) = stored.id()? {
                    ids.push(id);
                }
                self.emit(EventKind::Insert, Some(stored), None, origin);
            }
        }
        self.touch()?;
        self.ctx.after_write()?;
        Ok(ids)
    }

    /// Merge `update` into every document matching `filter`. Returns the
    /// number of affected documents.
    pub fn update(&self, filter: &Filter, update: &Document, options: UpdateOptions) -> Result<usize> {
        self.check_open()?;
        let origin = origin_of(update);
        let mut changes = update.clone();
        for reserved in [DOC_ID, DOC_REVISION, DOC_MODIFIED, DOC_SOURCE] {
            changes.remove(reserved);
        }

        let affected = {
            let _guard = self.lock_writes();
            let mut ids = self.find_ids(filter)?;
            if options.just_once {
                ids.truncate(1);
            }

            if ids.is_empty() {
                if !options.insert_if_absent {
                    return Ok(0);
                }
                let mut doc = update.clone();
                doc.remove(DOC_REVISION);
                doc.remove(DOC_MODIFIED);
                let stored = self.insert_locked(doc, false)?;
                self.emit(EventKind::Insert, Some(stored), None, origin);
                1
            } else {
                let documents = self.update_locked(&ids, &changes)?;
                let affected = documents.len();
                for doc in documents {
                    self.emit(EventKind::Update, Some(doc), None, origin);
                }
                affected
            }
        };
        self.touch()?;
        self.ctx.after_write()?;
        Ok(affected)
    }

    /// Merge a document into the stored document with the same id.
    pub fn update_document(&self, doc: &Document, insert_if_absent: bool) -> Result<usize> {
        let id = doc
            .id()?
            .ok_or_else(|| Error::Validation("document has no id to update by".into()))?;
        let options = UpdateOptions {
            insert_if_absent,
            just_once: true,
        };
        self.update(&Filter::Eq(DOC_ID.to_string(), id.to_value()), doc, options)
    }

    /// Remove documents matching `filter`. Returns the number removed.
    pub fn remove(&self, filter: &Filter, just_once: bool) -> Result<usize> {
        self.remove_with_origin(filter, just_once, Origin::Local)
    }

    /// Remove the stored document with the same id as `doc`. A document
    /// tagged by the replicator leaves a replicator tombstone.
    pub fn remove_document(&self, doc: &Document) -> Result<usize> {
        let id = doc
            .id()?
            .ok_or_else(|| Error::Validation("document has no id to remove by".into()))?;
        self.remove_with_origin(
            &Filter::Eq(DOC_ID.to_string(), id.to_value()),
            true,
            origin_of(doc),
        )
    }

    fn remove_with_origin(&self, filter: &Filter, just_once: bool, origin: Origin) -> Result<usize> {
        self.check_open()?;
        let count = {
            let _guard = self.lock_writes();
            let mut ids = self.find_ids(filter)?;
            if just_once {
                ids.truncate(1);
            }
            let mut count = 0;
            for id in ids {
                if let Some(doc) = self.remove_locked(&id, origin, None)? {
                    self.emit(EventKind::Remove, Some(doc), None, origin);
                    count += 1;
                }
            }
            count
        };

        if count > 0 {
            self.touch()?;
        }
        self.ctx.after_write()?;
        Ok(count)
    }

    /// Store a replicated document as-is, keeping its revision and
    /// modification time. Caller holds the merge lock.
    pub(crate) fn put_replicated(&self, mut doc: Document) -> Result<()> {
        self.check_open()?;
        doc.clear_source();
        let id = doc
            .id()?
            .ok_or_else(|| Error::replication("replicated document has no id"))?;

        {
            let _guard = self.lock_writes();
            let (kind, stored) = match self.primary.get(&id)? {
                None => (EventKind::Insert, self.insert_locked(doc, true)?),
                Some(old) => {
                    self.primary.put(id.clone(), doc.clone())?;
                    if let Err(err) = self.reindex(&id, &doc, &old) {
                        self.primary.put(id, old)?;
                        return Err(err);
                    }
                    (EventKind::Update, doc)
                }
            };
            self.emit(kind, Some(stored), None, Origin::Replicator);
        }
        self.touch()?;
        Ok(())
    }

    /// Remove a document on behalf of the replicator, recording a tombstone
    /// with the remote delete time. Caller holds the merge lock.
    pub(crate) fn remove_replicated(&self, id: &DocumentId, delete_time: Timestamp) -> Result<bool> {
        self.check_open()?;
        let removed = {
            let _guard = self.lock_writes();
            match self.remove_locked(id, Origin::Replicator, Some(delete_time))? {
                Some(doc) => {
                    self.emit(EventKind::Remove, Some(doc), None, Origin::Replicator);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.touch()?;
        }
        Ok(removed)
    }

    /// Copy documents in unchanged, keeping their ids, revisions and
    /// modification times. All or nothing, like [`Collection::insert_many`].
    pub(crate) fn import(&self, docs: Vec<Document>) -> Result<usize> {
        self.check_open()?;
        let _guard = self.lock_writes();
        let mut imported: Vec<Document> = Vec::with_capacity(docs.len());
        for doc in docs {
            match self.insert_locked(doc, true) {
                Ok(stored) => imported.push(stored),
                Err(err) => {
                    for stored in imported.iter().rev() {
                        self.discard_locked(stored)?;
                    }
                    return Err(err);
                }
            }
        }
        self.touch()?;
        Ok(imported.len())
    }

    /// Replace every document through `f`. Used by migrations; revisions
    /// are bumped like an update. Returns the number of changed documents.
    pub(crate) fn rewrite_all(&self, mut f: impl FnMut(&mut Document) -> Result<()>) -> Result<usize> {
        self.check_open()?;
        let _guard = self.lock_writes();
        let now = self.ctx.now();
        let mut changed = 0;
        for (id, old) in self.primary.entries()? {
            let mut doc = old.clone();
            f(&mut doc)?;
            if doc == old {
                continue;
            }
            doc.set_id(&id);
            doc.set_revision(old.revision() + 1);
            doc.set_last_modified(now);
            self.primary.put(id.clone(), doc.clone())?;
            if let Err(err) = self.reindex(&id, &doc, &old) {
                self.primary.put(id, old)?;
                return Err(err);
            }
            changed += 1;
        }
        if changed > 0 {
            self.touch()?;
        }
        Ok(changed)
    }

    /// Validate, stamp and store one document, then fan out to indexes.
    /// Caller holds the write lock.
    fn insert_locked(&self, mut doc: Document, keep_meta: bool) -> Result<Document> {
        let now = self.ctx.now();
        let keep_meta = keep_meta || doc.is_replicated();
        doc.clear_source();

        let id = match doc.id()? {
            Some(id) => id,
            None => {
                let id = self.ctx.ids().next(now);
                doc.set_id(&id);
                id
            }
        };
        if let Some(existing) = self.primary.first_key()? {
            if !existing.same_kind(&id) {
                return Err(Error::IncomparableIds {
                    collection: self.name.clone(),
                    expected: existing.kind().to_string(),
                    actual: id.kind().to_string(),
                });
            }
        }

        if !keep_meta || doc.revision() <= 0 {
            doc.set_revision(1);
        }
        if !keep_meta || doc.last_modified() <= 0 {
            doc.set_last_modified(now);
        }

        if self.primary.put_if_absent(id.clone(), doc.clone())?.is_some() {
            return Err(Error::UniqueConstraint(format!(
                "document with id {id} already exists in collection '{}'",
                self.name
            )));
        }

        let metas = self.clean_indexes();
        for (written, meta) in metas.iter().enumerate() {
            if let Err(err) = self.write_entry(meta, &id, &doc) {
                tracing::error!(
                    collection = %self.name,
                    id = %id,
                    field = %meta.field(),
                    "Index write failed, rolling back insert: {}",
                    err
                );
                for meta in &metas[..written] {
                    self.remove_entry(meta, &id, &doc)?;
                }
                self.primary.remove(&id)?;
                return Err(err);
            }
        }

        tracing::debug!(collection = %self.name, id = %id, "Document inserted");
        Ok(doc)
    }

    /// Merge `changes` into each document. Either every document is updated
    /// or, on failure, all of them are restored. Caller holds the write lock.
    fn update_locked(&self, ids: &[DocumentId], changes: &Document) -> Result<Vec<Document>> {
        let now = self.ctx.now();
        let mut done: Vec<(DocumentId, Document, Document)> = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(old) = self.primary.get(id)? else {
                continue;
            };
            let mut doc = old.clone();
            doc.merge(changes);
            doc.set_revision(old.revision() + 1);
            doc.set_last_modified(now.max(old.last_modified()));

            self.primary.put(id.clone(), doc.clone())?;
            if let Err(err) = self.reindex(id, &doc, &old) {
                tracing::warn!(
                    collection = %self.name,
                    id = %id,
                    restored = done.len() + 1,
                    "Update failed, restoring documents: {}",
                    err
                );
                self.primary.put(id.clone(), old)?;
                for (id, old, new) in done.into_iter().rev() {
                    self.reindex(&id, &old, &new)?;
                    self.primary.put(id, old)?;
                }
                return Err(err);
            }
            tracing::debug!(collection = %self.name, id = %id, "Document updated");
            done.push((id.clone(), old, doc));
        }

        Ok(done.into_iter().map(|(_, _, doc)| doc).collect())
    }

    /// Remove one document and its index entries, writing a tombstone when
    /// replication is attached. Caller holds the write lock.
    fn remove_locked(
        &self,
        id: &DocumentId,
        origin: Origin,
        delete_time: Option<Timestamp>,
    ) -> Result<Option<Document>> {
        let Some(doc) = self.primary.remove(id)? else {
            return Ok(None);
        };

        let metas = self.clean_indexes();
        for (removed, meta) in metas.iter().enumerate() {
            if let Err(err) = self.remove_entry(meta, id, &doc) {
                tracing::warn!(
                    collection = %self.name,
                    id = %id,
                    field = %meta.field(),
                    "Index removal failed, restoring document: {}",
                    err
                );
                for meta in &metas[..removed] {
                    self.write_entry(meta, id, &doc)?;
                }
                self.primary.put(id.clone(), doc)?;
                return Err(err);
            }
        }

        if let Some(tombstones) = self.tombstones() {
            let now = self.ctx.now();
            let tombstone = match origin {
                Origin::Replicator => Tombstone::new(id.clone(), delete_time.unwrap_or(now), 0, &self.name),
                Origin::Local => Tombstone::new(
                    id.clone(),
                    now,
                    self.ctx.tombstone_counter().next(now),
                    &self.name,
                ),
            };
            tombstones.put(tombstone)?;
        }

        tracing::debug!(collection = %self.name, id = %id, "Document removed");
        Ok(Some(doc))
    }

    /// Undo an insert made under the same write lock.
    fn discard_locked(&self, doc: &Document) -> Result<()> {
        let Some(id) = doc.id()? else {
            return Ok(());
        };
        for meta in self.clean_indexes() {
            self.remove_entry(&meta, &id, doc)?;
        }
        self.primary.remove(&id)?;
        Ok(())
    }

    /// Bring every clean index from `old` to `doc`. On failure the indexes
    /// already moved are moved back.
    fn reindex(&self, id: &DocumentId, doc: &Document, old: &Document) -> Result<()> {
        let metas = self.clean_indexes();
        for (updated, meta) in metas.iter().enumerate() {
            let new_value = doc.get(meta.field());
            let old_value = old.get(meta.field());
            if new_value == old_value {
                continue;
            }
            let indexer = self.ctx.indexers().get(meta.kind())?;
            if let Err(err) =
                indexer.update_index_entry(self.ctx.store(), meta, id, new_value, old_value)
            {
                tracing::error!(
                    collection = %self.name,
                    id = %id,
                    field = %meta.field(),
                    "Index update failed: {}",
                    err
                );
                for meta in &metas[..updated] {
                    let (new_value, old_value) = (doc.get(meta.field()), old.get(meta.field()));
                    if new_value != old_value {
                        let indexer = self.ctx.indexers().get(meta.kind())?;
                        indexer.update_index_entry(self.ctx.store(), meta, id, old_value, new_value)?;
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Indexes that accept writes. Dirty indexes are skipped; they are
    /// rebuilt from the primary map before they serve reads again.
    fn clean_indexes(&self) -> Vec<IndexMeta> {
        self.ctx
            .index_catalog()
            .list_index_metas(&self.name)
            .into_iter()
            .filter(|meta| !meta.is_dirty())
            .collect()
    }

    pub(crate) fn write_entry(&self, meta: &IndexMeta, id: &DocumentId, doc: &Document) -> Result<()> {
        let indexer = self.ctx.indexers().get(meta.kind())?;
        indexer.write_index_entry(self.ctx.store(), meta, id, doc.get(meta.field()))
    }

    fn remove_entry(&self, meta: &IndexMeta, id: &DocumentId, doc: &Document) -> Result<()> {
        let indexer = self.ctx.indexers().get(meta.kind())?;
        indexer.remove_index_entry(self.ctx.store(), meta, id, doc.get(meta.field()))
    }
}
