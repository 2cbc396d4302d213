//! Persistence backends for the map store.
//!
//! A backend only deals in [`StoreSnapshot`]s: the store hands it the full
//! contents of every map on commit and asks for the last snapshot on open.

use crate::error::Result;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};

/// Version of the on-disk snapshot format.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Contents of every named map at commit time.
///
/// Each map is stored as a JSON array of `[key, value]` pairs in key order.
/// `BTreeMap` keeps the map names in a deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    pub maps: BTreeMap<String, serde_json::Value>,
}

impl StoreSnapshot {
    pub fn new() -> Self {
        Self {
            format_version: STORE_FORMAT_VERSION,
            maps: BTreeMap::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::StorageIo(e.to_string()))
    }

    /// Parse a snapshot, rejecting formats newer than this build understands.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::StorageIo(e.to_string()))?;

        if snapshot.format_version > STORE_FORMAT_VERSION {
            return Err(Error::StorageIo(format!(
                "snapshot format version {} is newer than supported version {}",
                snapshot.format_version, STORE_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Where committed map contents live.
pub trait StoreBackend: Send + Sync + Debug {
    /// Last committed snapshot, if any.
    fn load(&self) -> Result<Option<StoreSnapshot>>;

    /// Replace the committed snapshot.
    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()>;

    /// Whether committed data survives the process.
    fn is_durable(&self) -> bool;
}

/// Ephemeral backend. Nothing is written anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBackend;

impl StoreBackend for MemoryBackend {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        Ok(None)
    }

    fn persist(&self, _snapshot: &StoreSnapshot) -> Result<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Single-file JSON backend.
///
/// Commits write to a sibling temp file and rename it over the target, so a
/// crash mid-commit leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StoreBackend for FileBackend {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)?;
        StoreSnapshot::from_json(&json).map(Some)
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = self.temp_path();
        fs::write(&temp, snapshot.to_json()?)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}
