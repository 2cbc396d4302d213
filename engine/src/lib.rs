//! # Saltpeter Engine
//!
//! An embedded document database for local-first applications.
//!
//! Documents live in named collections backed by an ordered key-value
//! store. Collections carry secondary indexes (unique, non-unique, full-text
//! and spatial), publish change events, and can be replicated between peers
//! with a last-write-wins CRDT.
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A [`Document`] is an ordered map of field names to [`Value`]s. Nested
//! fields are addressed with dotted paths (`address.city`). The engine owns
//! a few reserved fields:
//! - `_id` - the [`DocumentId`], generated on insert when absent
//! - `_revision` - bumped on every successful update
//! - `_modified` - wall-clock millis of the last change
//!
//! ### Collections and Indexes
//!
//! A [`Collection`] keeps its documents in a primary map and fans every write
//! out to its indexes. Queries are expressed with [`Filter`]s, usually built
//! through [`field`]. A clean index answers the part of a filter it covers;
//! everything else is a scan.
//!
//! ### Replication
//!
//! [`LastWriteWinMap`] exports a [`DeltaState`] of changes and tombstones in
//! a time window, and merges the delta of a peer. Higher revision wins; equal
//! revisions are decided by modification time.
//!
//! ### Migrations
//!
//! A [`MigrationManager`] holds versioned [`Migration`] plans and brings a
//! store from its recorded schema version to the configured one.
//!
//! ## Quick Start
//!
//! ```rust
//! use saltpeter_engine::{field, Database, Document, FindOptions, IndexKind};
//!
//! let db = Database::in_memory().unwrap();
//! let users = db.collection("users").unwrap();
//! users.create_index("email", IndexKind::Unique).unwrap();
//!
//! users
//!     .insert(Document::new().with("email", "ann@example.com").with("age", 31))
//!     .unwrap();
//! users
//!     .insert(Document::new().with("email", "ben@example.com").with("age", 27))
//!     .unwrap();
//!
//! let found = users
//!     .find(&field("age").gt(30), &FindOptions::default())
//!     .unwrap();
//! assert_eq!(found.len(), 1);
//! assert!(users
//!     .insert(Document::new().with("email", "ann@example.com"))
//!     .is_err());
//! ```
//!
//! ## Persistence
//!
//! [`Config::file`] opens a store backed by a JSON snapshot file, written on
//! [`Database::commit`] and on close. [`Config::from_env`] reads the same
//! settings from `SALTPETER_*` environment variables.

pub mod catalog;
pub mod clock;
pub mod collection;
pub mod config;
pub mod context;
pub mod database;
pub mod document;
pub mod error;
pub mod events;
pub mod filter;
pub mod id;
pub mod index;
pub mod migration;
pub mod replication;
pub mod repository;
pub mod store;
pub mod value;

// Re-export main types at crate root
pub use catalog::{Attributes, CatalogEntry};
pub use clock::{Clock, FixedClock, SystemClock};
pub use collection::{Collection, FindOptions, SortOrder, UpdateOptions};
pub use config::{Config, ConfigError, StoreConfig};
pub use database::Database;
pub use document::Document;
pub use error::{Error, Result};
pub use events::{CollectionEvent, CollectionEventListener, EventKind, Origin, SubscriptionId};
pub use filter::{field, Filter, Pattern, ELEMENT};
pub use id::DocumentId;
pub use index::{Geometry, IndexDescriptor, IndexKind, Language};
pub use migration::{Migration, MigrationManager};
pub use replication::{DeltaState, LastWriteWinMap, MergeResult, Tombstone};
pub use repository::{DocumentMapper, ObjectRepository, SerdeMapper};
pub use value::Value;

/// Type aliases for clarity
pub type CollectionName = String;
pub type Timestamp = i64;
