use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single stored version of a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    /// Sequence id assigned by the table on insert. Strictly increasing and never reused.
    pub id: u64,
    pub key: String,
    /// Time of the last write to this row.
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

/// On-disk envelope of a row. The payload is left opaque so it can be
/// produced by any [`crate::Serializer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRow {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl StoredRow {
    pub fn new(key: &str, payload: Vec<u8>) -> Self {
        Self {
            key: key.to_owned(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
