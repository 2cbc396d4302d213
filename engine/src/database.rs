//! The database handle.

use crate::catalog::CatalogEntry;
use crate::clock::{Clock, SystemClock};
use crate::collection::Collection;
use crate::config::Config;
use crate::context::EngineContext;
use crate::error::Result;
use crate::migration::MigrationManager;
use crate::replication::LastWriteWinMap;
use crate::repository::{repository_name, DocumentMapper, ObjectRepository};
use crate::{CollectionName, Error};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An open database: a store, its catalogs and the collections opened so
/// far. Closing (or dropping) commits and closes the store.
pub struct Database {
    ctx: Arc<EngineContext>,
    collections: DashMap<CollectionName, Arc<Collection>>,
    closed: AtomicBool,
}

impl Database {
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::open_with_migrations(config, clock, &MigrationManager::new())
    }

    /// Open and bring the schema to `config.schema_version` with the
    /// registered migrations.
    pub fn open_with_migrations(
        config: Config,
        clock: Arc<dyn Clock>,
        migrations: &MigrationManager,
    ) -> Result<Self> {
        let target = config.schema_version;
        let ctx = EngineContext::open(config, clock)?;
        let db = Self {
            ctx: Arc::new(ctx),
            collections: DashMap::new(),
            closed: AtomicBool::new(false),
        };
        migrations.migrate(&db, target)?;
        tracing::info!(
            durable = db.ctx.store().is_durable(),
            schema_version = target,
            "Database opened"
        );
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(Config::in_memory())
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("database".into()));
        }
        Ok(())
    }

    /// Open a collection, creating it on first access.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.check_open()?;
        if let Some(existing) = self.collections.get(name) {
            if existing.is_open() {
                return Ok(existing.clone());
            }
        }
        let collection = Collection::open(self.ctx.clone(), name)?;
        self.collections
            .insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    pub fn has_collection(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        Ok(matches!(
            self.ctx.catalog().entry(name)?,
            Some(CatalogEntry::Collection)
        ))
    }

    /// Names of plain collections. Repository collections are listed by
    /// [`Database::list_repositories`].
    pub fn list_collection_names(&self) -> Result<Vec<CollectionName>> {
        self.check_open()?;
        self.ctx.catalog().collection_names()
    }

    /// `(collection, type name)` of every repository.
    pub fn list_repositories(&self) -> Result<Vec<(CollectionName, String)>> {
        self.check_open()?;
        self.ctx.catalog().repositories()
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.check_open()?;
        if !self.ctx.catalog().contains(name)? {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        self.collection(name)?.drop_collection()?;
        self.collections.remove(name);
        Ok(())
    }

    /// Move every document and index of `from` to a new collection `to`,
    /// then drop `from`. Revisions and modification times are kept.
    pub fn rename_collection(&self, from: &str, to: &str) -> Result<()> {
        self.check_open()?;
        let entry = self
            .ctx
            .catalog()
            .entry(from)?
            .ok_or_else(|| Error::CollectionNotFound(from.to_string()))?;
        if self.ctx.catalog().contains(to)? {
            return Err(Error::Validation(format!(
                "cannot rename '{from}' to existing collection '{to}'"
            )));
        }

        let source = self.collection(from)?;
        if let CatalogEntry::Repository { type_name } = &entry {
            self.ctx.catalog().register_repository(to, type_name)?;
        }
        let target = self.collection(to)?;

        let documents = source.find(&crate::Filter::All, &Default::default())?;
        let count = target.import(documents)?;
        for descriptor in source.list_indexes()? {
            target.create_index(&descriptor.field, descriptor.kind)?;
        }
        self.drop_collection(from)?;

        tracing::info!(from = %from, to = %to, documents = count, "Collection renamed");
        Ok(())
    }

    /// Open a repository of `T`, stored in a collection named after the type
    /// and `key`.
    pub fn repository<T: 'static>(
        &self,
        mapper: Arc<dyn DocumentMapper<T>>,
        key: Option<&str>,
    ) -> Result<ObjectRepository<T>> {
        let collection = self.repository_collection::<T>(key)?;
        Ok(ObjectRepository::new(collection, mapper, None))
    }

    /// Like [`Database::repository`], using `id_field` of every item as its
    /// document id.
    pub fn repository_with_id<T: 'static>(
        &self,
        mapper: Arc<dyn DocumentMapper<T>>,
        key: Option<&str>,
        id_field: &str,
    ) -> Result<ObjectRepository<T>> {
        let collection = self.repository_collection::<T>(key)?;
        Ok(ObjectRepository::new(
            collection,
            mapper,
            Some(id_field.to_string()),
        ))
    }

    fn repository_collection<T>(&self, key: Option<&str>) -> Result<Arc<Collection>> {
        self.check_open()?;
        let name = repository_name::<T>(key);
        match self.ctx.catalog().entry(&name)? {
            Some(CatalogEntry::Collection) => {
                return Err(Error::Validation(format!(
                    "'{name}' is a plain collection, not a repository"
                )));
            }
            Some(CatalogEntry::Repository { .. }) => {}
            None => self
                .ctx
                .catalog()
                .register_repository(&name, std::any::type_name::<T>())?,
        }
        self.collection(&name)
    }

    /// Attach last-write-wins replication to a collection.
    pub fn replicated(&self, name: &str) -> Result<LastWriteWinMap> {
        LastWriteWinMap::attach(self.collection(name)?)
    }

    pub fn schema_version(&self) -> Result<Option<u32>> {
        self.check_open()?;
        self.ctx.catalog().schema_version()
    }

    /// Run migrations towards `target` on an open database.
    pub fn migrate(&self, migrations: &MigrationManager, target: u32) -> Result<usize> {
        self.check_open()?;
        migrations.migrate(self, target)
    }

    pub fn commit(&self) -> Result<()> {
        self.check_open()?;
        self.ctx.store().commit()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.ctx.store().has_unsaved_changes()
    }

    /// Close every collection, stop the event bus, then commit and close the
    /// store. Closing twice is a no-op. If the final commit fails the
    /// database stays open so `commit` or `close` can be retried.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for entry in self.collections.iter() {
            entry.value().close();
        }
        self.collections.clear();
        if let Err(err) = self.ctx.shutdown() {
            self.closed.store(false, Ordering::SeqCst);
            return Err(err);
        }
        tracing::info!("Database closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!("Failed to close database: {}", err);
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("context", &self.ctx)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::index::IndexKind;
    use crate::{field, Document, FindOptions};

    fn db() -> Database {
        Database::open_with_clock(Config::in_memory(), Arc::new(FixedClock::new(1))).unwrap()
    }

    #[test]
    fn collections_are_cached_and_listed() {
        let db = db();
        let a = db.collection("users").unwrap();
        let b = db.collection("users").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        db.collection("orders").unwrap();
        assert_eq!(db.list_collection_names().unwrap(), vec!["orders", "users"]);
        assert!(db.has_collection("users").unwrap());
        assert!(!db.has_collection("nope").unwrap());
    }

    #[test]
    fn fresh_store_is_stamped_with_schema_version() {
        let db = Database::open(Config::in_memory().with_schema_version(4)).unwrap();
        assert_eq!(db.schema_version().unwrap(), Some(4));
    }

    #[test]
    fn drop_and_recreate() {
        let db = db();
        let users = db.collection("users").unwrap();
        users.insert(Document::new().with("a", 1)).unwrap();
        db.drop_collection("users").unwrap();
        assert!(!users.is_open());
        assert!(matches!(
            db.drop_collection("users"),
            Err(Error::CollectionNotFound(_))
        ));

        let users = db.collection("users").unwrap();
        assert_eq!(users.size().unwrap(), 0);
    }

    #[test]
    fn rename_keeps_documents_and_indexes() {
        let db = db();
        let users = db.collection("users").unwrap();
        users.create_index("email", IndexKind::Unique).unwrap();
        users.create_index("bio", IndexKind::FullText).unwrap();
        let id = users
            .insert(Document::new().with("email", "a@x").with("bio", "likes rust"))
            .unwrap();
        users
            .update(&field("email").eq("a@x"), &Document::new().with("n", 1), Default::default())
            .unwrap();
        let before = users.get_by_id(&id).unwrap().unwrap();

        db.rename_collection("users", "people").unwrap();
        assert!(!db.has_collection("users").unwrap());
        let people = db.collection("people").unwrap();
        assert_eq!(people.get_by_id(&id).unwrap().unwrap(), before);
        let kinds: Vec<_> = people
            .list_indexes()
            .unwrap()
            .into_iter()
            .map(|d| (d.field, d.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("bio".to_string(), IndexKind::FullText),
                ("email".to_string(), IndexKind::Unique)
            ]
        );
        let found = people.find(&field("bio").text("rust"), &FindOptions::default()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn rename_onto_existing_fails() {
        let db = db();
        db.collection("a").unwrap();
        db.collection("b").unwrap();
        assert!(matches!(db.rename_collection("a", "b"), Err(Error::Validation(_))));
        assert!(matches!(
            db.rename_collection("zzz", "c"),
            Err(Error::CollectionNotFound(_))
        ));
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let db = db();
        let users = db.collection("users").unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(db.is_closed());
        assert!(!users.is_open());
        assert!(matches!(db.collection("users"), Err(Error::Closed(_))));
    }
}
