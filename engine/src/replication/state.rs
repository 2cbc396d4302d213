use super::Tombstone;
use crate::error::Result;
use crate::{Document, Error};
use serde::{Deserialize, Serialize};

/// Current delta format version. Deltas with a newer version are rejected.
pub const DELTA_FORMAT_VERSION: u32 = 1;

/// A bounded batch of changes between two sync markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaState {
    pub format_version: u32,
    pub changes: Vec<Document>,
    pub tombstones: Vec<Tombstone>,
}

impl Default for DeltaState {
    fn default() -> Self {
        Self {
            format_version: DELTA_FORMAT_VERSION,
            changes: Vec::new(),
            tombstones: Vec::new(),
        }
    }
}

impl DeltaState {
    pub fn new(changes: Vec<Document>, tombstones: Vec<Tombstone>) -> Self {
        Self {
            format_version: DELTA_FORMAT_VERSION,
            changes,
            tombstones,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.tombstones.is_empty()
    }

    /// Fails with a fatal replication error when produced by a newer engine.
    pub fn check_version(&self) -> Result<()> {
        if self.format_version > DELTA_FORMAT_VERSION {
            return Err(Error::fatal_replication(format!(
                "delta format version {} is newer than supported version {}",
                self.format_version, DELTA_FORMAT_VERSION
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let state: DeltaState = serde_json::from_str(json)
            .map_err(|e| Error::fatal_replication(format!("malformed delta: {e}")))?;
        state.check_version()?;
        Ok(state)
    }
}

/// Outcome of merging one delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    /// Incoming documents written locally.
    pub applied: usize,
    /// Incoming documents that lost to local state.
    pub discarded: usize,
    /// Local documents removed by incoming tombstones.
    pub deleted: usize,
}
