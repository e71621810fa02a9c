//! Embedded ordered key-value engine.
//!
//! One engine instance backs one store partition. Data lives in ordered
//! maps split across column families; the durable variant appends every
//! committed batch to a write-ahead log before applying it, so a
//! successful commit survives process crash and a partial commit is never
//! visible.
//!
//! Durable engine open sequence:
//! 1. Replay the WAL into the in-memory column families.
//! 2. Open the writer (truncating any torn tail).
//! 3. Serve reads from memory; serve writes as WAL-append + apply.
//!
//! The volatile variant keeps the same interface with no disk I/O; its
//! state starts empty on every open.

pub mod wal;

use parking_lot::{Mutex, RwLock};
use rivulet_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use wal::{read_wal, WalWriter};

/// Column families separating user data from engine metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnFamily {
    /// User key-value data
    Default,
    /// Engine metadata (offsets)
    Metadata,
    /// Windowed aggregates, keyed `key | start | end`
    Windows,
    /// Per-key maximum observed timestamp
    LatestTimestamps,
}

impl ColumnFamily {
    /// All column families, in declaration order.
    pub const ALL: [ColumnFamily; 4] = [
        ColumnFamily::Default,
        ColumnFamily::Metadata,
        ColumnFamily::Windows,
        ColumnFamily::LatestTimestamps,
    ];

    /// Stable name used in changelog headers.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::Default => "default",
            ColumnFamily::Metadata => "metadata",
            ColumnFamily::Windows => "windows",
            ColumnFamily::LatestTimestamps => "latest-timestamps",
        }
    }

    /// Parse a changelog header value back into a column family.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(ColumnFamily::Default),
            "metadata" => Some(ColumnFamily::Metadata),
            "windows" => Some(ColumnFamily::Windows),
            "latest-timestamps" => Some(ColumnFamily::LatestTimestamps),
            _ => None,
        }
    }
}

/// One mutation inside a WAL batch. `value: None` is a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalOp {
    /// Target column family
    pub cf: ColumnFamily,
    /// Key bytes
    pub key: Vec<u8>,
    /// Value bytes, or `None` for a delete
    pub value: Option<Vec<u8>>,
}

/// Ordered batch of mutations applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WalOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        WriteBatch::default()
    }

    /// Buffer a put.
    pub fn put(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WalOp {
            cf,
            key: key.into(),
            value: Some(value.into()),
        });
    }

    /// Buffer a delete.
    pub fn delete(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>) {
        self.ops.push(WalOp {
            cf,
            key: key.into(),
            value: None,
        });
    }

    /// Number of buffered mutations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The buffered mutations, in order.
    pub fn ops(&self) -> &[WalOp] {
        &self.ops
    }
}

type CfMap = BTreeMap<Vec<u8>, Vec<u8>>;

struct CfSet {
    default: CfMap,
    metadata: CfMap,
    windows: CfMap,
    latest_timestamps: CfMap,
}

impl CfSet {
    fn new() -> Self {
        CfSet {
            default: BTreeMap::new(),
            metadata: BTreeMap::new(),
            windows: BTreeMap::new(),
            latest_timestamps: BTreeMap::new(),
        }
    }

    fn map(&self, cf: ColumnFamily) -> &CfMap {
        match cf {
            ColumnFamily::Default => &self.default,
            ColumnFamily::Metadata => &self.metadata,
            ColumnFamily::Windows => &self.windows,
            ColumnFamily::LatestTimestamps => &self.latest_timestamps,
        }
    }

    fn map_mut(&mut self, cf: ColumnFamily) -> &mut CfMap {
        match cf {
            ColumnFamily::Default => &mut self.default,
            ColumnFamily::Metadata => &mut self.metadata,
            ColumnFamily::Windows => &mut self.windows,
            ColumnFamily::LatestTimestamps => &mut self.latest_timestamps,
        }
    }

    fn apply(&mut self, ops: &[WalOp]) {
        for op in ops {
            let map = self.map_mut(op.cf);
            match &op.value {
                Some(value) => {
                    map.insert(op.key.clone(), value.clone());
                }
                None => {
                    map.remove(&op.key);
                }
            }
        }
    }
}

/// Embedded ordered key-value engine.
///
/// Durable when opened with a path (WAL-backed), volatile otherwise.
pub struct KvEngine {
    cfs: RwLock<CfSet>,
    wal: Option<Mutex<WalWriter>>,
    path: Option<PathBuf>,
}

impl KvEngine {
    /// Open a durable engine rooted at `dir`.
    ///
    /// Replays `dir/wal` before returning; the rebuilt state corresponds
    /// to a prefix of committed batches (never a partial batch).
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let wal_path = dir.join("wal");

        let mut cfs = CfSet::new();
        let batches = read_wal(&wal_path)?;
        let replayed = batches.len();
        for batch in &batches {
            cfs.apply(batch);
        }
        if replayed > 0 {
            debug!(path = %wal_path.display(), batches = replayed, "replayed WAL");
        }

        let writer = WalWriter::open(&wal_path)?;
        Ok(KvEngine {
            cfs: RwLock::new(cfs),
            wal: Some(Mutex::new(writer)),
            path: Some(dir.to_path_buf()),
        })
    }

    /// Open a volatile engine (no disk, state starts empty).
    pub fn in_memory() -> Self {
        KvEngine {
            cfs: RwLock::new(CfSet::new()),
            wal: None,
            path: None,
        }
    }

    /// Whether this engine persists across restarts.
    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    /// Directory backing this engine, if durable.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read a key from a column family.
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Vec<u8>> {
        self.cfs.read().map(cf).get(key).cloned()
    }

    /// Apply a batch atomically: WAL append + fsync, then visibility.
    pub fn write_batch(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if let Some(wal) = &self.wal {
            wal.lock().append(batch.ops())?;
        }
        self.cfs.write().apply(batch.ops());
        Ok(())
    }

    /// Ordered scan of keys starting with `prefix`.
    pub fn range_prefix(&self, cf: ColumnFamily, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let guard = self.cfs.read();
        guard
            .map(cf)
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Full ordered dump of a column family.
    pub fn dump(&self, cf: ColumnFamily) -> Vec<(Vec<u8>, Vec<u8>)> {
        let guard = self.cfs.read();
        guard.map(cf).iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Number of live keys in a column family.
    pub fn len(&self, cf: ColumnFamily) -> usize {
        self.cfs.read().map(cf).len()
    }

    /// Whether a column family has no live keys.
    pub fn is_empty(&self, cf: ColumnFamily) -> bool {
        self.len(cf) == 0
    }
}
