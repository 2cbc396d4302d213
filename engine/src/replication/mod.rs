//! Last-write-wins replication.
//!
//! The network transport is out of scope: a peer calls
//! [`LastWriteWinMap::delta`] to export a window of changes and the other
//! side feeds the result to [`LastWriteWinMap::merge`]. [`DeltaState`]
//! serializes with serde for whatever framing the transport picks.

mod lww;
mod state;
mod tombstone;

pub use lww::LastWriteWinMap;
pub use state::{DeltaState, MergeResult, DELTA_FORMAT_VERSION};
pub use tombstone::{Tombstone, TombstoneMap};
