use super::{DeltaState, MergeResult, Tombstone, TombstoneMap};
use crate::catalog::Attributes;
use crate::collection::Collection;
use crate::error::Result;
use crate::{Document, DocumentId, Error, Timestamp};
use std::sync::Arc;

/// Last-write-wins replicated view of a collection.
///
/// Conflicts resolve by revision first and modification time second. Local
/// removals leave tombstones so a delete is not undone by an older insert
/// arriving later.
#[derive(Debug, Clone)]
pub struct LastWriteWinMap {
    collection: Arc<Collection>,
    tombstones: TombstoneMap,
}

impl LastWriteWinMap {
    /// Attach replication to a collection. From here on local removals
    /// write tombstones.
    pub fn attach(collection: Arc<Collection>) -> Result<Self> {
        collection.check_open()?;
        let tombstones = collection.attach_tombstones()?;
        collection.ctx.catalog().update_attributes(collection.name(), |attrs| {
            if !attrs.contains(Attributes::REPLICA) {
                attrs.set(Attributes::REPLICA, uuid::Uuid::new_v4().to_string());
            }
        })?;
        tracing::info!(collection = %collection.name(), "Replication attached");
        Ok(Self {
            collection,
            tombstones,
        })
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    /// Identity of this replica, stable across reopen.
    pub fn replica_id(&self) -> Result<String> {
        let attrs = self.collection.attributes()?;
        attrs
            .get(Attributes::REPLICA)
            .map(str::to_string)
            .ok_or_else(|| Error::replication("replica id is missing"))
    }

    pub fn last_sync_time(&self) -> Result<Option<Timestamp>> {
        Ok(self
            .collection
            .attributes()?
            .timestamp(Attributes::LAST_SYNC_TIME))
    }

    pub fn set_last_sync_time(&self, time: Timestamp) -> Result<()> {
        self.collection
            .ctx
            .catalog()
            .update_attributes(self.collection.name(), |attrs| {
                attrs.set(Attributes::LAST_SYNC_TIME, time.to_string());
            })
    }

    /// Changes in the window `(start, end]`.
    ///
    /// Documents are selected by modification time and ordered by
    /// `(modified, id)`; tombstones by counter. `offset` and `size` page each
    /// list separately.
    pub fn delta(&self, start: Timestamp, end: Timestamp, offset: usize, size: usize) -> Result<DeltaState> {
        self.collection.check_open()?;
        let in_window = |t: Timestamp| t > start && t <= end;

        let mut changes: Vec<Document> = self
            .collection
            .primary
            .values()?
            .into_iter()
            .filter(|doc| in_window(doc.last_modified()))
            .collect();
        changes.sort_by_cached_key(|doc| (doc.last_modified(), doc.id().ok().flatten()));

        let mut tombstones: Vec<Tombstone> = self
            .tombstones
            .all()?
            .into_iter()
            .filter(|t| in_window(t.counter) && t.source_collection == self.collection.name())
            .collect();
        tombstones.sort_by_key(|t| t.counter);

        let changes = changes.into_iter().skip(offset).take(size).collect();
        let tombstones = tombstones.into_iter().skip(offset).take(size).collect();
        Ok(DeltaState::new(changes, tombstones))
    }

    /// Apply a delta from another replica.
    pub fn merge(&self, delta: &DeltaState) -> Result<MergeResult> {
        self.collection.check_open()?;
        delta.check_version()?;
        let mut incoming = Vec::with_capacity(delta.changes.len());
        for doc in &delta.changes {
            let id = doc
                .id()
                .map_err(|e| Error::replication(format!("changed document has a bad id: {e}")))?
                .ok_or_else(|| Error::replication("changed document has no id"))?;
            incoming.push((id, doc));
        }

        let _merge = self.collection.lock_merges();
        let mut result = MergeResult::default();

        for (id, doc) in incoming {
            if self.accept(&id, doc)? {
                self.collection.put_replicated(doc.clone())?;
                self.tombstones.remove(&id)?;
                result.applied += 1;
            } else {
                result.discarded += 1;
            }
        }

        for tombstone in &delta.tombstones {
            self.collection.ctx.tombstone_counter().observe(tombstone.counter);
            if self
                .collection
                .remove_replicated(&tombstone.id, tombstone.delete_time)?
            {
                result.deleted += 1;
            }
        }

        tracing::info!(
            collection = %self.collection.name(),
            applied = result.applied,
            discarded = result.discarded,
            deleted = result.deleted,
            "Delta merged"
        );
        self.collection.ctx.after_write()?;
        Ok(result)
    }

    /// Whether an incoming document should replace local state.
    fn accept(&self, id: &DocumentId, incoming: &Document) -> Result<bool> {
        match self.collection.get_by_id(id)? {
            None => match self.tombstones.get(id)? {
                Some(tombstone) if incoming.last_modified() < tombstone.delete_time => {
                    tracing::warn!(
                        collection = %self.collection.name(),
                        id = %id,
                        modified = incoming.last_modified(),
                        deleted = tombstone.delete_time,
                        "Discarding stale replicated insert"
                    );
                    Ok(false)
                }
                _ => Ok(true),
            },
            Some(local) => {
                let accepted = incoming.revision() > local.revision()
                    || (incoming.revision() == local.revision()
                        && incoming.last_modified() > local.last_modified());
                Ok(accepted)
            }
        }
    }

    /// Record a tombstone directly. Replicator deletes get counter zero;
    /// local ones get a strictly increasing counter starting at the clock.
    pub fn create_tombstone(
        &self,
        id: DocumentId,
        delete_time: Timestamp,
        from_replicator: bool,
    ) -> Result<Tombstone> {
        let counter = if from_replicator {
            0
        } else {
            self.collection
                .ctx
                .tombstone_counter()
                .next(self.collection.ctx.now())
        };
        let tombstone = Tombstone::new(id, delete_time, counter, self.collection.name());
        self.tombstones.put(tombstone.clone())?;
        Ok(tombstone)
    }

    pub fn tombstone(&self, id: &DocumentId) -> Result<Option<Tombstone>> {
        self.tombstones.get(id)
    }

    pub fn tombstones(&self) -> Result<Vec<Tombstone>> {
        self.tombstones.all()
    }

    /// Drop tombstones deleted before `now - ttl`, returning their ids.
    pub fn collect_garbage(&self, ttl: Timestamp) -> Result<Vec<DocumentId>> {
        let _merge = self.collection.lock_merges();
        let cutoff = self.collection.ctx.now() - ttl;
        let mut collected = Vec::new();
        for tombstone in self.tombstones.all()? {
            if tombstone.delete_time < cutoff {
                self.tombstones.remove(&tombstone.id)?;
                collected.push(tombstone.id);
            }
        }
        if !collected.is_empty() {
            tracing::info!(
                collection = %self.collection.name(),
                collected = collected.len(),
                "Tombstones collected"
            );
        }
        Ok(collected)
    }
}
