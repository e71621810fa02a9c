//! Partition transactions.
//!
//! A transaction is a short-lived write buffer bound to one store
//! partition. Reads see the transaction's own pending writes first
//! (read-your-writes; pending deletes observed as missing), then fall
//! through to the engine. Nothing touches the backing store until commit.
//!
//! Commit sequence:
//! 1. Refuse stale input (`OffsetRegression`) before any side effect.
//! 2. Produce pending changelog entries (if not already produced).
//! 3. Block until every delivery future reports broker acknowledgement;
//!    any failure rolls the transaction back, poisons the partition, and
//!    surfaces `StateTransactionError`.
//! 4. Flush mutations plus both offsets in one atomic engine batch.
//!
//! State machine: `Active` → `Committed` | `RolledBack` | `Failed`.
//! Operations on a finished transaction fail with
//! `InvalidStoreTransactionState`.

use crate::engine::{ColumnFamily, WalOp, WriteBatch};
use crate::partition::{
    encode_offset, StorePartition, CHANGELOG_OFFSET_KEY, PROCESSED_OFFSET_KEY,
};
use rivulet_broker::DeliveryFuture;
use rivulet_core::{Result, StateError};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Lifecycle state of a partition transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting reads and writes
    Active,
    /// Committed successfully (terminal)
    Committed,
    /// Discarded without effect (terminal)
    RolledBack,
    /// Aborted by a commit failure (terminal); the partition is poisoned
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
            TransactionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Write buffer bound to one [`StorePartition`].
pub struct PartitionTransaction {
    partition: Arc<StorePartition>,
    mutations: Vec<WalOp>,
    pending_acks: Vec<DeliveryFuture>,
    changelog_produced: bool,
    timestamp_ms: i64,
    state: TransactionState,
}

impl fmt::Debug for PartitionTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionTransaction")
            .field("mutations", &self.mutations.len())
            .field("pending_acks", &self.pending_acks.len())
            .field("changelog_produced", &self.changelog_produced)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PartitionTransaction {
    pub(crate) fn new(partition: Arc<StorePartition>) -> Self {
        PartitionTransaction {
            partition,
            mutations: Vec::new(),
            pending_acks: Vec::new(),
            changelog_produced: false,
            timestamp_ms: 0,
            state: TransactionState::Active,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Timestamp stamped onto changelog records (the input record's).
    pub fn set_timestamp(&mut self, timestamp_ms: i64) {
        self.timestamp_ms = timestamp_ms;
    }

    /// Number of buffered mutations.
    pub fn pending_mutations(&self) -> usize {
        self.mutations.len()
    }

    /// Pending mutations for one column family, in buffer order.
    pub(crate) fn pending_in(&self, cf: ColumnFamily) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.mutations
            .iter()
            .filter(|op| op.cf == cf)
            .map(|op| (op.key.clone(), op.value.clone()))
            .collect()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(StateError::invalid_transaction_state(self.state.to_string()));
        }
        Ok(())
    }

    /// Read through the transaction in the default column family.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_cf(ColumnFamily::Default, key)
    }

    /// Read through the transaction in a specific column family.
    pub fn get_cf(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        for op in self.mutations.iter().rev() {
            if op.cf == cf && op.key == key {
                return Ok(op.value.clone());
            }
        }
        Ok(self.partition.engine().get(cf, key))
    }

    /// Buffer a put in the default column family.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.put_cf(ColumnFamily::Default, key, value)
    }

    /// Buffer a put in a specific column family.
    pub fn put_cf(
        &mut self,
        cf: ColumnFamily,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.mutations.push(WalOp {
            cf,
            key: key.into(),
            value: Some(value.into()),
        });
        Ok(())
    }

    /// Buffer a delete in the default column family.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.delete_cf(ColumnFamily::Default, key)
    }

    /// Buffer a delete in a specific column family.
    pub fn delete_cf(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>) -> Result<()> {
        self.ensure_active()?;
        self.mutations.push(WalOp {
            cf,
            key: key.into(),
            value: None,
        });
        Ok(())
    }

    /// Produce the buffered mutations to the changelog.
    ///
    /// `processed_offset` is stamped into each record's headers so that
    /// replay restores the processed position alongside the data.
    /// Idempotent; called implicitly by [`commit`](Self::commit) when the
    /// executor has not produced explicitly. No-op for stores without a
    /// changelog.
    pub fn produce_changelog(&mut self, processed_offset: i64) -> Result<()> {
        self.ensure_active()?;
        if self.changelog_produced {
            return Ok(());
        }
        if let Some(producer) = self.partition.changelog_producer() {
            for op in &self.mutations {
                match producer.produce(
                    &op.key,
                    op.value.as_deref(),
                    op.cf,
                    self.timestamp_ms,
                    Some(processed_offset),
                ) {
                    Ok(future) => self.pending_acks.push(future),
                    Err(e) => {
                        self.abort_failed();
                        return Err(StateError::state_transaction(format!(
                            "changelog produce failed: {}",
                            e
                        )));
                    }
                }
            }
        }
        self.changelog_produced = true;
        Ok(())
    }

    /// Commit the transaction at `processed_offset`.
    ///
    /// Atomically flushes mutations and advances both offsets. Blocks
    /// until every changelog delivery is acknowledged.
    pub fn commit(&mut self, processed_offset: i64) -> Result<()> {
        self.ensure_active()?;

        if let Some(stored) = self.partition.processed_offset() {
            if processed_offset < stored {
                self.discard();
                return Err(StateError::offset_regression(stored, processed_offset));
            }
        }

        self.produce_changelog(processed_offset)?;

        let mut changelog_offset: Option<i64> = None;
        let pending_acks: Vec<_> = self.pending_acks.drain(..).collect();
        for future in pending_acks {
            match future.wait() {
                Ok(report) => {
                    changelog_offset = Some(changelog_offset.map_or(report.offset, |o| {
                        o.max(report.offset)
                    }));
                }
                Err(e) => {
                    self.abort_failed();
                    return Err(StateError::state_transaction(format!(
                        "changelog delivery failed: {}",
                        e
                    )));
                }
            }
        }

        let mut batch = WriteBatch::new();
        for op in self.mutations.drain(..) {
            match op.value {
                Some(value) => batch.put(op.cf, op.key, value),
                None => batch.delete(op.cf, op.key),
            }
        }
        batch.put(
            ColumnFamily::Metadata,
            PROCESSED_OFFSET_KEY.to_vec(),
            encode_offset(processed_offset).to_vec(),
        );
        if let Some(offset) = changelog_offset {
            batch.put(
                ColumnFamily::Metadata,
                CHANGELOG_OFFSET_KEY.to_vec(),
                encode_offset(offset).to_vec(),
            );
        }

        if let Err(e) = self.partition.engine().write_batch(&batch) {
            self.abort_failed();
            return Err(StateError::state_transaction(format!(
                "commit flush failed: {}",
                e
            )));
        }

        debug!(
            store = %self.partition.store_name(),
            partition = self.partition.partition(),
            processed_offset,
            mutations = batch.len(),
            "transaction committed"
        );
        self.state = TransactionState::Committed;
        self.partition.release_transaction();
        Ok(())
    }

    /// Discard all buffered mutations without advancing offsets.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.discard();
        Ok(())
    }

    fn discard(&mut self) {
        self.mutations.clear();
        self.pending_acks.clear();
        self.state = TransactionState::RolledBack;
        self.partition.release_transaction();
    }

    fn abort_failed(&mut self) {
        self.mutations.clear();
        self.pending_acks.clear();
        self.state = TransactionState::Failed;
        self.partition.mark_failed();
        self.partition.release_transaction();
    }
}

impl Drop for PartitionTransaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.discard();
        }
    }
}
