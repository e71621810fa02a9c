//! Windowed store: time-bucketed view layered over the ordered engine.
//!
//! Window entries live in the `Windows` column family under byte-ordered
//! composite keys:
//!
//! ```text
//! prefix(1) | user key | big-endian(start_ms, 8) | big-endian(end_ms, 8)
//! ```
//!
//! so a prefix scan returns a key's windows in ascending `(start, end)`
//! order. The `LatestTimestamps` family tracks the maximum observed
//! timestamp per key, which the executor uses as the expiry watermark.
//!
//! The store does not perform grouping; it stores whatever buckets the
//! executor writes. Windows with `end <= watermark - grace_ms` are
//! eligible for expiry, emitted deterministically in key-then-start order.

use crate::engine::ColumnFamily;
use crate::partition::StorePartition;
use crate::store::{Store, StoreBackendKind};
use crate::transaction::PartitionTransaction;
use byteorder::{BigEndian, ByteOrder};
use dashmap::DashMap;
use rivulet_core::{Result, StateError};
use std::collections::BTreeMap;
use std::sync::Arc;

const WINDOW_KEY_PREFIX: u8 = 0x01;

/// Encode a `(key, start, end)` window into its composite byte key.
pub fn encode_window_key(key: &[u8], start_ms: i64, end_ms: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len() + 16);
    out.push(WINDOW_KEY_PREFIX);
    out.extend_from_slice(key);
    let mut ts = [0u8; 16];
    BigEndian::write_u64(&mut ts[0..8], start_ms as u64);
    BigEndian::write_u64(&mut ts[8..16], end_ms as u64);
    out.extend_from_slice(&ts);
    out
}

/// Decode a composite window key back into `(key, start, end)`.
pub fn decode_window_key(bytes: &[u8]) -> Result<(Vec<u8>, i64, i64)> {
    if bytes.len() < 17 || bytes[0] != WINDOW_KEY_PREFIX {
        return Err(StateError::corruption("malformed window key"));
    }
    let key_end = bytes.len() - 16;
    let key = bytes[1..key_end].to_vec();
    let start = BigEndian::read_u64(&bytes[key_end..key_end + 8]) as i64;
    let end = BigEndian::read_u64(&bytes[key_end + 8..]) as i64;
    Ok((key, start, end))
}

fn key_scan_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(WINDOW_KEY_PREFIX);
    out.extend_from_slice(key);
    out
}

/// An expired window, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredWindow {
    /// Window start (milliseconds)
    pub start_ms: i64,
    /// Window end (milliseconds)
    pub end_ms: i64,
    /// Stored aggregate bytes
    pub value: Vec<u8>,
}

/// Time-bucketed view over one store partition.
///
/// Window operations go through the partition's transaction so that
/// windowed mutations share the commit/changelog path of plain ones.
pub struct WindowedStorePartition {
    inner: Arc<StorePartition>,
    grace_ms: i64,
}

impl WindowedStorePartition {
    /// Wrap a store partition with window semantics.
    pub fn new(inner: Arc<StorePartition>, grace_ms: i64) -> Self {
        WindowedStorePartition { inner, grace_ms }
    }

    /// The underlying store partition.
    pub fn inner(&self) -> &Arc<StorePartition> {
        &self.inner
    }

    /// Grace period subtracted from the watermark at expiry.
    pub fn grace_ms(&self) -> i64 {
        self.grace_ms
    }

    /// Begin a transaction on the underlying partition.
    pub fn begin(&self) -> Result<PartitionTransaction> {
        self.inner.begin()
    }

    /// Read one window's aggregate.
    pub fn get_window(
        &self,
        tx: &PartitionTransaction,
        key: &[u8],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Option<Vec<u8>>> {
        tx.get_cf(ColumnFamily::Windows, &encode_window_key(key, start_ms, end_ms))
    }

    /// Write one window's aggregate and raise the key's latest timestamp.
    pub fn update_window(
        &self,
        tx: &mut PartitionTransaction,
        key: &[u8],
        start_ms: i64,
        end_ms: i64,
        value: &[u8],
        timestamp_ms: i64,
    ) -> Result<()> {
        tx.put_cf(
            ColumnFamily::Windows,
            encode_window_key(key, start_ms, end_ms),
            value.to_vec(),
        )?;
        let latest = self.latest_timestamp(tx, key)?;
        if latest.map_or(true, |l| timestamp_ms > l) {
            tx.put_cf(
                ColumnFamily::LatestTimestamps,
                key.to_vec(),
                timestamp_ms.to_le_bytes().to_vec(),
            )?;
        }
        Ok(())
    }

    /// Maximum timestamp observed for `key`, if any.
    pub fn latest_timestamp(
        &self,
        tx: &PartitionTransaction,
        key: &[u8],
    ) -> Result<Option<i64>> {
        match tx.get_cf(ColumnFamily::LatestTimestamps, key)? {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StateError::corruption("latest timestamp is not 8 bytes"))?;
                Ok(Some(i64::from_le_bytes(arr)))
            }
        }
    }

    /// All windows for `key`, ascending by `(start, end)`.
    pub fn windows_for_key(
        &self,
        tx: &PartitionTransaction,
        key: &[u8],
    ) -> Result<Vec<(i64, i64, Vec<u8>)>> {
        let prefix = key_scan_prefix(key);
        let expected_len = prefix.len() + 16;

        // Committed entries first, then the transaction's pending writes
        // overlaid so reads see uncommitted window updates.
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for (k, v) in self.inner.engine().range_prefix(ColumnFamily::Windows, &prefix) {
            if k.len() == expected_len {
                merged.insert(k, Some(v));
            }
        }
        for (k, v) in tx.pending_in(ColumnFamily::Windows) {
            if k.len() == expected_len && k.starts_with(&prefix) {
                merged.insert(k, v);
            }
        }

        let mut out = Vec::new();
        for (k, v) in merged {
            if let Some(value) = v {
                let (_, start, end) = decode_window_key(&k)?;
                out.push((start, end, value));
            }
        }
        Ok(out)
    }

    /// Remove and return the windows with `end <= watermark - grace_ms`.
    ///
    /// Expiry is deterministic: results come back in ascending start order
    /// for the key.
    pub fn expire_windows(
        &self,
        tx: &mut PartitionTransaction,
        key: &[u8],
        watermark_ms: i64,
    ) -> Result<Vec<ExpiredWindow>> {
        let cutoff = watermark_ms - self.grace_ms;
        let mut expired = Vec::new();
        for (start, end, value) in self.windows_for_key(tx, key)? {
            if end <= cutoff {
                tx.delete_cf(ColumnFamily::Windows, encode_window_key(key, start, end))?;
                expired.push(ExpiredWindow {
                    start_ms: start,
                    end_ms: end,
                    value,
                });
            }
        }
        Ok(expired)
    }
}

/// Registry of windowed partitions for one logical windowed store.
///
/// Windowed state is always durable; the time-indexed layout relies on the
/// ordered disk-backed engine.
pub struct WindowedStore {
    store: Store,
    grace_ms: i64,
    wrapped: DashMap<i32, Arc<WindowedStorePartition>>,
}

impl WindowedStore {
    /// Create a windowed store over a durable backing store.
    pub fn new(
        name: impl Into<String>,
        topic: Option<String>,
        base_dir: Option<std::path::PathBuf>,
        changelog_producer_factory: Option<crate::changelog::ChangelogProducerFactory>,
        grace_ms: i64,
    ) -> Result<Self> {
        let store = Store::new(
            name,
            topic,
            StoreBackendKind::Durable,
            base_dir,
            changelog_producer_factory,
        )?;
        Ok(WindowedStore {
            store,
            grace_ms,
            wrapped: DashMap::new(),
        })
    }

    /// The backing plain store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Assign a partition (idempotent).
    pub fn assign_partition(&self, partition: i32) -> Result<Arc<WindowedStorePartition>> {
        let inner = self.store.assign_partition(partition)?;
        let entry = self
            .wrapped
            .entry(partition)
            .or_insert_with(|| Arc::new(WindowedStorePartition::new(inner, self.grace_ms)));
        Ok(entry.value().clone())
    }

    /// Revoke a partition; fails while a transaction is open.
    pub fn revoke_partition(&self, partition: i32) -> Result<()> {
        self.store.revoke_partition(partition)?;
        self.wrapped.remove(&partition);
        Ok(())
    }

    /// Assigned windowed partition, if any.
    pub fn partition(&self, partition: i32) -> Option<Arc<WindowedStorePartition>> {
        self.wrapped.get(&partition).map(|e| e.value().clone())
    }

    /// Currently assigned partition numbers, sorted.
    pub fn partitions(&self) -> Vec<i32> {
        self.store.partitions()
    }

    /// Revoke everything.
    pub fn close(&self) -> Result<()> {
        self.store.close()?;
        self.wrapped.clear();
        Ok(())
    }
}
