//! Record shapes crossing the broker boundary
//!
//! A [`Record`] is what sources and producers hand to the broker: an
//! optional key, an optional value (`None` is a tombstone), a millisecond
//! timestamp, and ordered headers. A [`PolledRecord`] is the same payload
//! with provenance attached after it has landed in a partition log.
//!
//! Timestamps are milliseconds everywhere in the runtime; sources working
//! in nanoseconds convert at the edge.

use serde::{Deserialize, Serialize};

/// Ordered set of record headers
///
/// Headers preserve insertion order, matching broker semantics where the
/// same header name may appear more than once. `get` returns the last
/// value for a name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, Vec<u8>)>);

impl Headers {
    /// Create an empty header set
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    /// Append a header
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.push((name.into(), value.into()));
    }

    /// Last value recorded for `name`, if any
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Iterate over headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the header set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A record as produced into (or synthesized for) a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Partitioning/state key; `None` routes round-robin
    pub key: Option<Vec<u8>>,
    /// Serialized value; `None` denotes a tombstone
    pub value: Option<Vec<u8>>,
    /// Event timestamp in milliseconds
    pub timestamp_ms: i64,
    /// Record headers
    pub headers: Headers,
}

impl Record {
    /// Create a record with a key and value
    pub fn new(
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        timestamp_ms: i64,
    ) -> Self {
        Record {
            key: Some(key.into()),
            value: Some(value.into()),
            timestamp_ms,
            headers: Headers::new(),
        }
    }

    /// Create a tombstone record for a key
    pub fn tombstone(key: impl Into<Vec<u8>>, timestamp_ms: i64) -> Self {
        Record {
            key: Some(key.into()),
            value: None,
            timestamp_ms,
            headers: Headers::new(),
        }
    }

    /// Attach a header, builder style
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this record is a tombstone
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A record with provenance, as delivered from a partition log
#[derive(Debug, Clone, PartialEq)]
pub struct PolledRecord {
    /// Topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// The record payload
    pub record: Record,
}

impl PolledRecord {
    /// The record key, if present
    pub fn key(&self) -> Option<&[u8]> {
        self.record.key.as_deref()
    }

    /// The record value, if present
    pub fn value(&self) -> Option<&[u8]> {
        self.record.value.as_deref()
    }

    /// The record timestamp in milliseconds
    pub fn timestamp_ms(&self) -> i64 {
        self.record.timestamp_ms
    }
}
