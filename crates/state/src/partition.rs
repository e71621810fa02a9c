//! Store partition: the per-(topic, partition, store) transactional unit.
//!
//! A partition owns a private ordered key-value namespace and tracks two
//! offsets in the engine's metadata column family:
//!
//! - **processed offset**: highest source offset whose effects are durably
//!   committed (monotonically non-decreasing)
//! - **changelog offset**: highest changelog offset replayed or produced
//!
//! A commit advances both atomically with the flushed mutations. At most
//! one transaction may be open per partition at a time.

use crate::changelog::ChangelogProducer;
use crate::engine::{ColumnFamily, KvEngine, WriteBatch};
use crate::transaction::PartitionTransaction;
use rivulet_core::{PolledRecord, Result, StateError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Metadata key holding the processed source offset.
pub(crate) const PROCESSED_OFFSET_KEY: &[u8] = b"__processed_offset__";

/// Metadata key holding the replayed/produced changelog offset.
pub(crate) const CHANGELOG_OFFSET_KEY: &[u8] = b"__changelog_offset__";

pub(crate) fn encode_offset(offset: i64) -> [u8; 8] {
    offset.to_le_bytes()
}

pub(crate) fn decode_offset(bytes: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StateError::corruption("offset metadata is not 8 bytes"))?;
    Ok(i64::from_le_bytes(arr))
}

/// Per-partition transactional key-value unit.
pub struct StorePartition {
    store_name: String,
    topic: Option<String>,
    partition: i32,
    engine: KvEngine,
    changelog_producer: Option<ChangelogProducer>,
    transaction_open: AtomicBool,
    failed: AtomicBool,
}

impl StorePartition {
    /// Create a partition over an opened engine.
    pub fn new(
        store_name: impl Into<String>,
        topic: Option<String>,
        partition: i32,
        engine: KvEngine,
        changelog_producer: Option<ChangelogProducer>,
    ) -> Self {
        StorePartition {
            store_name: store_name.into(),
            topic,
            partition,
            engine,
            changelog_producer,
            transaction_open: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// Store this partition belongs to.
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Source topic, `None` for global stores.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Partition number.
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Whether the partition uses a changelog.
    pub fn uses_changelog(&self) -> bool {
        self.changelog_producer.is_some()
    }

    /// Begin a transaction.
    ///
    /// Fails with `BusyTransaction` if one is already open.
    pub fn begin(self: &Arc<Self>) -> Result<PartitionTransaction> {
        if self
            .transaction_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StateError::BusyTransaction {
                store_name: self.store_name.clone(),
                partition: self.partition,
            });
        }
        Ok(PartitionTransaction::new(self.clone()))
    }

    /// Read a committed value (outside any transaction).
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.engine.get(ColumnFamily::Default, key)
    }

    /// Highest source offset durably committed, if any.
    pub fn processed_offset(&self) -> Option<i64> {
        self.engine
            .get(ColumnFamily::Metadata, PROCESSED_OFFSET_KEY)
            .and_then(|bytes| decode_offset(&bytes).ok())
    }

    /// Highest changelog offset applied or acknowledged, if any.
    pub fn changelog_offset(&self) -> Option<i64> {
        self.engine
            .get(ColumnFamily::Metadata, CHANGELOG_OFFSET_KEY)
            .and_then(|bytes| decode_offset(&bytes).ok())
    }

    /// Ordered dump of the user keyspace (tests, parity checks).
    pub fn dump(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.engine.dump(ColumnFamily::Default)
    }

    /// Whether a transaction is currently open.
    pub fn has_open_transaction(&self) -> bool {
        self.transaction_open.load(Ordering::Acquire)
    }

    /// Whether the partition was poisoned by a failed commit.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Apply one changelog record during recovery.
    ///
    /// Bypasses the changelog producer: writes during recovery must not
    /// re-emit changelog entries. Advances the changelog offset to the
    /// record's offset in the same atomic batch.
    pub fn recover_from_changelog(&self, record: &PolledRecord) -> Result<()> {
        let key = record.key().ok_or_else(|| {
            StateError::recovery_failed(format!(
                "changelog record at {}[{}]@{} has no key",
                record.topic, record.partition, record.offset
            ))
        })?;

        let cf = match record.record.headers.get(crate::changelog::COLUMN_FAMILY_HEADER) {
            None => ColumnFamily::Default,
            Some(raw) => {
                let name = std::str::from_utf8(raw).map_err(|_| {
                    StateError::recovery_failed("column family header is not UTF-8")
                })?;
                ColumnFamily::from_name(name).ok_or_else(|| {
                    StateError::recovery_failed(format!("unknown column family \"{}\"", name))
                })?
            }
        };

        let mut batch = WriteBatch::new();
        match record.value() {
            Some(value) => batch.put(cf, key.to_vec(), value.to_vec()),
            None => batch.delete(cf, key.to_vec()),
        }
        batch.put(
            ColumnFamily::Metadata,
            CHANGELOG_OFFSET_KEY.to_vec(),
            encode_offset(record.offset).to_vec(),
        );
        if let Some(raw) = record
            .record
            .headers
            .get(crate::changelog::PROCESSED_OFFSET_HEADER)
        {
            let offset = decode_offset(raw)
                .map_err(|_| StateError::recovery_failed("malformed processed offset header"))?;
            batch.put(
                ColumnFamily::Metadata,
                PROCESSED_OFFSET_KEY.to_vec(),
                encode_offset(offset).to_vec(),
            );
        }
        self.engine.write_batch(&batch)
    }

    /// Persist the changelog replay position (used by `stop_recovery` so a
    /// later assignment can resume instead of replaying from scratch).
    pub fn write_changelog_offset(&self, offset: i64) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(
            ColumnFamily::Metadata,
            CHANGELOG_OFFSET_KEY.to_vec(),
            encode_offset(offset).to_vec(),
        );
        self.engine.write_batch(&batch)
    }

    pub(crate) fn engine(&self) -> &KvEngine {
        &self.engine
    }

    pub(crate) fn changelog_producer(&self) -> Option<&ChangelogProducer> {
        self.changelog_producer.as_ref()
    }

    pub(crate) fn release_transaction(&self) {
        self.transaction_open.store(false, Ordering::Release);
    }

    pub(crate) fn mark_failed(&self) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            warn!(
                store = %self.store_name,
                partition = self.partition,
                "partition poisoned by failed transaction; it must be re-assigned"
            );
        }
    }
}
