//! Schema migrations.
//!
//! A [`Migration`] moves the store from one schema version to another by
//! running [`Command`]s in order. The [`MigrationManager`] chains registered
//! migrations from the stored version to the configured one and records the
//! new version after every completed migration.

use crate::database::Database;
use crate::error::Result;
use crate::index::IndexKind;
use crate::{Document, Error, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Computes a field value from the document it is added to.
pub type Generator = Arc<dyn Fn(&Document) -> Value + Send + Sync>;

/// Converts a field value to a new type.
pub type Converter = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Arbitrary migration step.
pub type CustomStep = Arc<dyn Fn(&Database) -> Result<()> + Send + Sync>;

/// Value written by [`Command::AddField`].
#[derive(Clone)]
pub enum FieldDefault {
    Value(Value),
    Generator(Generator),
}

impl FieldDefault {
    fn value_for(&self, doc: &Document) -> Value {
        match self {
            FieldDefault::Value(value) => value.clone(),
            FieldDefault::Generator(generate) => generate(doc),
        }
    }
}

/// One migration step.
#[derive(Clone)]
pub enum Command {
    /// Set a field on every document and rebuild its index, if any.
    AddField {
        collection: String,
        field: String,
        default: FieldDefault,
    },
    /// Remove a field from every document and drop its index.
    DeleteField { collection: String, field: String },
    /// Move a field's value to a new name. An index on the old name is
    /// recreated on the new one with the same kind.
    RenameField {
        collection: String,
        old_name: String,
        new_name: String,
    },
    /// Convert a field's value on every document that has it.
    ChangeDataType {
        collection: String,
        field: String,
        converter: Converter,
    },
    /// Replace the unique identifying field. Document ids are not rewritten.
    ChangeIdField {
        collection: String,
        old_field: Option<String>,
        new_field: String,
    },
    CreateIndex {
        collection: String,
        field: String,
        kind: IndexKind,
    },
    /// Drop one index, or every index of the collection when `field` is
    /// `None`.
    DropIndex {
        collection: String,
        field: Option<String>,
    },
    /// Move documents and index descriptors to a new collection name.
    Rename { from: String, to: String },
    Drop { collection: String },
    Custom(CustomStep),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::AddField { collection, field, .. } => {
                write!(f, "AddField({collection}.{field})")
            }
            Command::DeleteField { collection, field } => {
                write!(f, "DeleteField({collection}.{field})")
            }
            Command::RenameField {
                collection,
                old_name,
                new_name,
            } => write!(f, "RenameField({collection}.{old_name} -> {new_name})"),
            Command::ChangeDataType { collection, field, .. } => {
                write!(f, "ChangeDataType({collection}.{field})")
            }
            Command::ChangeIdField {
                collection,
                new_field,
                ..
            } => write!(f, "ChangeIdField({collection}.{new_field})"),
            Command::CreateIndex {
                collection,
                field,
                kind,
            } => write!(f, "CreateIndex({collection}.{field}, {kind})"),
            Command::DropIndex { collection, field } => {
                write!(f, "DropIndex({collection}.{})", field.as_deref().unwrap_or("*"))
            }
            Command::Rename { from, to } => write!(f, "Rename({from} -> {to})"),
            Command::Drop { collection } => write!(f, "Drop({collection})"),
            Command::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Command {
    pub fn execute(&self, db: &Database) -> Result<()> {
        tracing::debug!(command = ?self, "Running migration command");
        match self {
            Command::AddField {
                collection,
                field,
                default,
            } => {
                let collection = db.collection(collection)?;
                collection.rewrite_all(|doc| {
                    let value = default.value_for(doc);
                    doc.put(field, value)
                })?;
                if collection.has_index(field) {
                    collection.rebuild_index(field, false)?;
                }
                Ok(())
            }

            Command::DeleteField { collection, field } => {
                let collection = db.collection(collection)?;
                if collection.has_index(field) {
                    collection.drop_index(field)?;
                }
                collection.rewrite_all(|doc| {
                    doc.remove(field);
                    Ok(())
                })?;
                Ok(())
            }

            Command::RenameField {
                collection,
                old_name,
                new_name,
            } => {
                let collection = db.collection(collection)?;
                let kind = db
                    .context()
                    .index_catalog()
                    .find_index_descriptor(collection.name(), old_name)
                    .map(|descriptor| descriptor.kind);
                if kind.is_some() {
                    collection.drop_index(old_name)?;
                }
                collection.rewrite_all(|doc| {
                    if let Some(value) = doc.remove(old_name) {
                        doc.put(new_name, value)?;
                    }
                    Ok(())
                })?;
                if let Some(kind) = kind {
                    collection.create_index(new_name, kind)?;
                }
                Ok(())
            }

            Command::ChangeDataType {
                collection,
                field,
                converter,
            } => {
                let collection = db.collection(collection)?;
                collection.rewrite_all(|doc| {
                    if let Some(value) = doc.get(field) {
                        let converted = converter(value)?;
                        doc.put(field, converted)?;
                    }
                    Ok(())
                })?;
                if collection.has_index(field) {
                    collection.rebuild_index(field, false)?;
                }
                Ok(())
            }

            Command::ChangeIdField {
                collection,
                old_field,
                new_field,
            } => {
                let collection = db.collection(collection)?;
                if let Some(old_field) = old_field {
                    if collection.has_index(old_field) {
                        collection.drop_index(old_field)?;
                    }
                }
                let existing = db
                    .context()
                    .index_catalog()
                    .find_index_descriptor(collection.name(), new_field);
                match existing {
                    Some(descriptor) if descriptor.kind == IndexKind::Unique => Ok(()),
                    Some(_) => {
                        collection.drop_index(new_field)?;
                        collection.create_index(new_field, IndexKind::Unique)
                    }
                    None => collection.create_index(new_field, IndexKind::Unique),
                }
            }

            Command::CreateIndex {
                collection,
                field,
                kind,
            } => db.collection(collection)?.create_index(field, *kind),

            Command::DropIndex { collection, field } => {
                let collection = db.collection(collection)?;
                match field {
                    Some(field) => collection.drop_index(field),
                    None => collection.drop_all_indices(),
                }
            }

            Command::Rename { from, to } => db.rename_collection(from, to),
            Command::Drop { collection } => db.drop_collection(collection),
            Command::Custom(step) => step(db),
        }
    }
}

/// Commands that move the schema from `from` to `to`.
#[derive(Debug, Clone)]
pub struct Migration {
    pub from: u32,
    pub to: u32,
    pub commands: Vec<Command>,
}

impl Migration {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            from,
            to,
            commands: Vec::new(),
        }
    }

    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn add_field(self, collection: &str, field: &str, default: impl Into<Value>) -> Self {
        self.command(Command::AddField {
            collection: collection.into(),
            field: field.into(),
            default: FieldDefault::Value(default.into()),
        })
    }

    pub fn add_generated_field(
        self,
        collection: &str,
        field: &str,
        generator: impl Fn(&Document) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.command(Command::AddField {
            collection: collection.into(),
            field: field.into(),
            default: FieldDefault::Generator(Arc::new(generator)),
        })
    }

    pub fn delete_field(self, collection: &str, field: &str) -> Self {
        self.command(Command::DeleteField {
            collection: collection.into(),
            field: field.into(),
        })
    }

    pub fn rename_field(self, collection: &str, old_name: &str, new_name: &str) -> Self {
        self.command(Command::RenameField {
            collection: collection.into(),
            old_name: old_name.into(),
            new_name: new_name.into(),
        })
    }

    pub fn change_data_type(
        self,
        collection: &str,
        field: &str,
        converter: impl Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.command(Command::ChangeDataType {
            collection: collection.into(),
            field: field.into(),
            converter: Arc::new(converter),
        })
    }

    pub fn change_id_field(self, collection: &str, old_field: Option<&str>, new_field: &str) -> Self {
        self.command(Command::ChangeIdField {
            collection: collection.into(),
            old_field: old_field.map(str::to_string),
            new_field: new_field.into(),
        })
    }

    pub fn create_index(self, collection: &str, field: &str, kind: IndexKind) -> Self {
        self.command(Command::CreateIndex {
            collection: collection.into(),
            field: field.into(),
            kind,
        })
    }

    pub fn drop_index(self, collection: &str, field: Option<&str>) -> Self {
        self.command(Command::DropIndex {
            collection: collection.into(),
            field: field.map(str::to_string),
        })
    }

    pub fn rename(self, from: &str, to: &str) -> Self {
        self.command(Command::Rename {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn drop_collection(self, collection: &str) -> Self {
        self.command(Command::Drop {
            collection: collection.into(),
        })
    }

    pub fn custom(self, step: impl Fn(&Database) -> Result<()> + Send + Sync + 'static) -> Self {
        self.command(Command::Custom(Arc::new(step)))
    }
}

/// Registered migrations, keyed by source then target version.
#[derive(Debug, Clone, Default)]
pub struct MigrationManager {
    migrations: BTreeMap<u32, BTreeMap<u32, Migration>>,
}

impl MigrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration, replacing one with the same versions.
    pub fn register(mut self, migration: Migration) -> Self {
        self.migrations
            .entry(migration.from)
            .or_default()
            .insert(migration.to, migration);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Migrations leading from `start` to `end`.
    ///
    /// Upgrades take the largest step not overshooting `end` at every
    /// version, downgrades the smallest. An empty path means no work.
    pub fn find_path(&self, start: u32, end: u32) -> Result<Vec<&Migration>> {
        let mut path = Vec::new();
        let mut current = start;
        let upgrade = end > start;

        while current != end {
            let targets = self.migrations.get(&current).ok_or_else(|| no_path(start, end))?;
            let next = if upgrade {
                targets.range(current + 1..=end).next_back()
            } else {
                targets.range(end..current).next()
            };
            let (&version, migration) = next.ok_or_else(|| no_path(start, end))?;
            path.push(migration);
            current = version;
        }
        Ok(path)
    }

    /// Bring the store to `target`. A store without a recorded version is
    /// new and is stamped with `target` directly. Returns the number of
    /// migrations run.
    pub fn migrate(&self, db: &Database, target: u32) -> Result<usize> {
        let catalog = db.context().catalog();
        let Some(current) = catalog.schema_version()? else {
            catalog.set_schema_version(target)?;
            return Ok(0);
        };
        if current == target {
            return Ok(0);
        }

        let path = self.find_path(current, target)?;
        tracing::info!(from = current, to = target, steps = path.len(), "Migrating schema");
        for migration in &path {
            for command in &migration.commands {
                command.execute(db)?;
            }
            catalog.set_schema_version(migration.to)?;
            tracing::info!(from = migration.from, to = migration.to, "Migration applied");
        }
        db.commit()?;
        Ok(path.len())
    }
}

fn no_path(start: u32, end: u32) -> Error {
    Error::Validation(format!(
        "schema version mismatch, no migration path from version {start} to {end}"
    ))
}
