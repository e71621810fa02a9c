//! Store: registry and factory of partitions for one logical state store.
//!
//! All partitions of a store share the same backend kind and changelog
//! configuration. Assignment is idempotent; revocation refuses while a
//! transaction is open.

use crate::changelog::ChangelogProducerFactory;
use crate::engine::KvEngine;
use crate::partition::StorePartition;
use dashmap::DashMap;
use rivulet_core::{Result, StateError};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Backend kind shared by all partitions of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendKind {
    /// Disk-backed, write-ahead logged engine
    Durable,
    /// In-process engine; state does not survive restart
    Volatile,
}

impl FromStr for StoreBackendKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "durable" => Ok(StoreBackendKind::Durable),
            "volatile" => Ok(StoreBackendKind::Volatile),
            other => Err(StateError::invalid_config(format!(
                "invalid store type \"{}\"; allowed values: durable, volatile",
                other
            ))),
        }
    }
}

/// Registry of [`StorePartition`]s for one logical state store.
pub struct Store {
    name: String,
    topic: Option<String>,
    backend: StoreBackendKind,
    base_dir: Option<PathBuf>,
    changelog_producer_factory: Option<ChangelogProducerFactory>,
    partitions: DashMap<i32, Arc<StorePartition>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("backend", &self.backend)
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a store.
    ///
    /// A durable store needs `base_dir`; partition data lands at
    /// `<base_dir>/<name>/<partition>/`.
    pub fn new(
        name: impl Into<String>,
        topic: Option<String>,
        backend: StoreBackendKind,
        base_dir: Option<PathBuf>,
        changelog_producer_factory: Option<ChangelogProducerFactory>,
    ) -> Result<Self> {
        let name = name.into();
        if backend == StoreBackendKind::Durable && base_dir.is_none() {
            return Err(StateError::invalid_config(format!(
                "durable store \"{}\" requires a state directory",
                name
            )));
        }
        Ok(Store {
            name,
            topic,
            backend,
            base_dir,
            changelog_producer_factory,
            partitions: DashMap::new(),
        })
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source topic, `None` for a global store.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Backend kind shared by every partition.
    pub fn backend(&self) -> StoreBackendKind {
        self.backend
    }

    /// Whether mutations are mirrored to a changelog.
    pub fn uses_changelog(&self) -> bool {
        self.changelog_producer_factory.is_some()
    }

    /// Changelog topic name, if configured.
    pub fn changelog_name(&self) -> Option<&str> {
        self.changelog_producer_factory
            .as_ref()
            .map(|f| f.changelog_name())
    }

    fn partition_dir(&self, partition: i32) -> Option<PathBuf> {
        self.base_dir
            .as_ref()
            .map(|base| base.join(&self.name).join(partition.to_string()))
    }

    /// Assign a partition, creating it on first use.
    ///
    /// Idempotent: re-assigning an already-assigned partition returns the
    /// existing instance.
    pub fn assign_partition(&self, partition: i32) -> Result<Arc<StorePartition>> {
        let entry = self.partitions.entry(partition).or_try_insert_with(|| {
            let engine = match self.backend {
                StoreBackendKind::Durable => {
                    let dir = self
                        .partition_dir(partition)
                        .expect("durable store has a base dir");
                    KvEngine::open(&dir)?
                }
                StoreBackendKind::Volatile => KvEngine::in_memory(),
            };
            let changelog_producer = self
                .changelog_producer_factory
                .as_ref()
                .map(|factory| factory.get_partition_producer(partition));

            debug!(store = %self.name, partition, "store partition assigned");
            Ok::<_, StateError>(Arc::new(StorePartition::new(
                self.name.clone(),
                self.topic.clone(),
                partition,
                engine,
                changelog_producer,
            )))
        })?;
        Ok(entry.value().clone())
    }

    /// Revoke a partition, releasing its resources.
    ///
    /// Fails with `PartitionStoreIsUsed` while a transaction is open.
    /// Revoking an unassigned partition is a no-op.
    pub fn revoke_partition(&self, partition: i32) -> Result<()> {
        if let Some(entry) = self.partitions.get(&partition) {
            if entry.value().has_open_transaction() {
                return Err(StateError::partition_store_is_used(format!(
                    "store \"{}\" partition {} has an open transaction",
                    self.name, partition
                )));
            }
        }
        if self.partitions.remove(&partition).is_some() {
            info!(store = %self.name, partition, "store partition revoked");
        }
        Ok(())
    }

    /// Currently assigned partition numbers, sorted.
    pub fn partitions(&self) -> Vec<i32> {
        let mut out: Vec<i32> = self.partitions.iter().map(|e| *e.key()).collect();
        out.sort_unstable();
        out
    }

    /// Assigned partition, if any.
    pub fn partition(&self, partition: i32) -> Option<Arc<StorePartition>> {
        self.partitions.get(&partition).map(|e| e.value().clone())
    }

    /// Whether any partition is assigned.
    pub fn has_active_partitions(&self) -> bool {
        !self.partitions.is_empty()
    }

    /// Revoke all partitions and release backend resources.
    pub fn close(&self) -> Result<()> {
        for partition in self.partitions() {
            self.revoke_partition(partition)?;
        }
        Ok(())
    }
}
