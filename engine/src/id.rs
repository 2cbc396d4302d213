//! Document identifiers and id generation.

use crate::{Error, Result, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// 2024-01-01T00:00:00Z in epoch milliseconds.
const ID_EPOCH: Timestamp = 1_704_067_200_000;
/// Low bits reserved for the per-millisecond sequence.
const SEQUENCE_BITS: u32 = 22;

/// Identifier of a document within a collection.
///
/// Generated ids are numeric. User supplied ids may be numeric or text, but a
/// collection never mixes the two kinds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentId {
    Numeric(i64),
    Text(String),
}

impl DocumentId {
    /// Parse an id from a field value.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(n) if *n >= 0 => Ok(DocumentId::Numeric(*n)),
            Value::Int(n) => Err(Error::InvalidId(format!("negative id {n}"))),
            Value::String(s) if s.is_empty() => Err(Error::InvalidId("empty id".into())),
            Value::String(s) => Ok(DocumentId::Text(s.clone())),
            other => Err(Error::InvalidId(format!(
                "unsupported id type {}",
                other.kind_name()
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DocumentId::Numeric(n) => Value::Int(*n),
            DocumentId::Text(s) => Value::String(s.clone()),
        }
    }

    /// Kind name, used to reject collections that mix id kinds.
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentId::Numeric(_) => "numeric",
            DocumentId::Text(_) => "text",
        }
    }

    pub fn same_kind(&self, other: &DocumentId) -> bool {
        self.kind() == other.kind()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Numeric(n) => write!(f, "{n}"),
            DocumentId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for DocumentId {
    fn from(n: i64) -> Self {
        DocumentId::Numeric(n)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId::Text(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        DocumentId::Text(s)
    }
}

/// Snowflake-style generator: milliseconds since [`ID_EPOCH`] in the high
/// bits, a sequence in the low bits. Ids are strictly increasing per
/// generator even when the clock stalls or moves backwards.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id for the given wall-clock time.
    pub fn next(&self, now: Timestamp) -> DocumentId {
        let base = (now - ID_EPOCH).max(0) << SEQUENCE_BITS;
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(base.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        DocumentId::Numeric(base.max(previous + 1))
    }

    /// Never generate `seen` or anything below it. Called with the largest
    /// stored id when a collection is reopened.
    pub fn observe(&self, seen: i64) {
        self.last.fetch_max(seen, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = IdGenerator::new();
        let now = 1_706_745_600_000;
        let a = generator.next(now);
        let b = generator.next(now);
        let c = generator.next(now - 10_000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn later_time_jumps_ahead() {
        let generator = IdGenerator::new();
        let a = generator.next(1_706_745_600_000);
        let b = generator.next(1_706_745_600_001);
        match (a, b) {
            (DocumentId::Numeric(a), DocumentId::Numeric(b)) => {
                assert_eq!(b - a, 1 << SEQUENCE_BITS);
            }
            _ => panic!("expected numeric ids"),
        }
    }

    #[test]
    fn observed_ids_are_skipped() {
        let generator = IdGenerator::new();
        let now = 1_706_745_600_000;
        let stored = (now - ID_EPOCH) << SEQUENCE_BITS;
        generator.observe(stored + 5);
        assert_eq!(generator.next(now), DocumentId::Numeric(stored + 6));
    }

    #[test]
    fn value_conversion() {
        assert_eq!(
            DocumentId::from_value(&Value::Int(7)).unwrap(),
            DocumentId::Numeric(7)
        );
        assert!(DocumentId::from_value(&Value::Int(-1)).is_err());
        assert!(DocumentId::from_value(&Value::from("")).is_err());
        assert!(DocumentId::from_value(&Value::Float(1.5)).is_err());
        assert_eq!(DocumentId::from("x").to_value(), Value::from("x"));
    }

    #[test]
    fn kinds() {
        assert!(DocumentId::from(1).same_kind(&DocumentId::from(2)));
        assert!(!DocumentId::from(1).same_kind(&DocumentId::from("a")));
        assert_eq!(DocumentId::from("a").kind(), "text");
    }

    #[test]
    fn serde_untagged() {
        let json = serde_json::to_string(&DocumentId::from(5)).unwrap();
        assert_eq!(json, "5");
        let back: DocumentId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, DocumentId::from("abc"));
    }
}
