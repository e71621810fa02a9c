//! Changelog recovery.
//!
//! After a rebalance hands this instance a partition, its state must be
//! rebuilt before processing resumes. The recovery manager captures the
//! changelog highwater at assignment time, compares it with the store's
//! persisted changelog position, and, when behind, replays changelog
//! records sequentially into the store partition until the highwater is
//! reached.
//!
//! Because the changelog is partitioned identically to the source topic
//! and key→partition routing is stable, replay reproduces the exact write
//! order that produced the state. Compaction is harmless: only the latest
//! value per key is needed.
//!
//! `stop_recovery` halts replay cooperatively at a record boundary; the
//! position reached is already persisted by each applied record, so a
//! later assignment resumes instead of starting over.

use crate::partition::StorePartition;
use parking_lot::Mutex;
use rivulet_broker::ChangelogConsumer;
use rivulet_core::{changelog_topic_name, Result, StateError, TopicConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const REPLAY_BATCH_SIZE: usize = 256;

/// Per-partition recovery bookkeeping.
struct RecoveryPartition {
    store_name: String,
    changelog_name: String,
    partition: i32,
    store_partition: Arc<StorePartition>,
    changelog_highwater: i64,
    changelog_position: i64,
}

impl RecoveryPartition {
    fn needs_recovery(&self) -> bool {
        self.changelog_position < self.changelog_highwater
    }
}

/// Coordinates changelog topics and replay for all managed stores.
pub struct RecoveryManager {
    group_id: String,
    consumer: Arc<dyn ChangelogConsumer>,
    /// `(topic, store_name) → changelog topic name`
    changelogs: Mutex<HashMap<(Option<String>, String), String>>,
    assignments: Mutex<Vec<RecoveryPartition>>,
    running: AtomicBool,
}

impl RecoveryManager {
    /// Create a recovery manager for one consumer group.
    pub fn new(group_id: impl Into<String>, consumer: Arc<dyn ChangelogConsumer>) -> Self {
        RecoveryManager {
            group_id: group_id.into(),
            consumer,
            changelogs: Mutex::new(HashMap::new()),
            assignments: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Consumer group this manager recovers for.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Register (and create) the changelog topic for a store.
    ///
    /// The changelog mirrors the source topic's partition count and is
    /// compacted. Returns the changelog topic name.
    pub fn register_changelog(
        &self,
        topic_name: Option<&str>,
        store_name: &str,
        topic_config: Option<&TopicConfig>,
    ) -> Result<String> {
        let changelog_name = changelog_topic_name(&self.group_id, store_name, topic_name);
        let source_config = topic_config.cloned().unwrap_or_default();
        self.consumer
            .create_topic(&changelog_name, &TopicConfig::changelog_for(&source_config))?;

        self.changelogs.lock().insert(
            (topic_name.map(String::from), store_name.to_string()),
            changelog_name.clone(),
        );
        debug!(store = store_name, changelog = %changelog_name, "changelog registered");
        Ok(changelog_name)
    }

    /// Changelog topic registered for `(topic, store_name)`, if any.
    pub fn changelog_for(&self, topic: Option<&str>, store_name: &str) -> Option<String> {
        self.changelogs
            .lock()
            .get(&(topic.map(String::from), store_name.to_string()))
            .cloned()
    }

    /// Enroll the store partitions of a newly assigned source partition.
    ///
    /// Captures each changelog's highwater; partitions already caught up
    /// are not enrolled. `committed_offsets` carries the group's committed
    /// source offsets for sanity checking stored state.
    pub fn assign_partition(
        &self,
        topic: Option<&str>,
        partition: i32,
        committed_offsets: &HashMap<String, i64>,
        store_partitions: &HashMap<String, Arc<StorePartition>>,
    ) -> Result<()> {
        let mut assignments = self.assignments.lock();
        for (store_name, store_partition) in store_partitions {
            let Some(changelog_name) = self.changelog_for(topic, store_name) else {
                continue;
            };
            let highwater = self.consumer.high_watermark(&changelog_name, partition)?;
            let position = store_partition
                .changelog_offset()
                .map(|o| o + 1)
                .unwrap_or(0);

            if let (Some(source_topic), Some(processed)) =
                (topic, store_partition.processed_offset())
            {
                if let Some(committed) = committed_offsets.get(source_topic) {
                    if processed > *committed {
                        warn!(
                            store = %store_name,
                            partition,
                            processed,
                            committed,
                            "store is ahead of the committed source offset; \
                             processing will skip already-applied records"
                        );
                    }
                }
            }

            let entry = RecoveryPartition {
                store_name: store_name.clone(),
                changelog_name,
                partition,
                store_partition: store_partition.clone(),
                changelog_highwater: highwater,
                changelog_position: position,
            };
            if entry.needs_recovery() {
                info!(
                    store = %entry.store_name,
                    partition,
                    position = entry.changelog_position,
                    highwater = entry.changelog_highwater,
                    "partition enrolled for recovery"
                );
                assignments.push(entry);
            }
        }
        Ok(())
    }

    /// Abandon any pending replay for a revoked partition.
    pub fn revoke_partition(&self, partition: i32) {
        let mut assignments = self.assignments.lock();
        let before = assignments.len();
        assignments.retain(|a| a.partition != partition);
        if assignments.len() != before {
            info!(partition, "recovery abandoned for revoked partition");
        }
    }

    /// Whether any partition still needs recovery.
    pub fn has_assignments(&self) -> bool {
        !self.assignments.lock().is_empty()
    }

    /// Replay every enrolled partition up to its highwater.
    ///
    /// Normal consumption stays suspended while this runs; the method
    /// returns when all managed partitions are caught up or recovery was
    /// stopped. Replay errors are fatal to the partition: it stays
    /// enrolled (unavailable) and the error is surfaced.
    pub fn do_recovery(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        loop {
            if !self.running.load(Ordering::Acquire) {
                info!("recovery stopped before completion");
                return Ok(());
            }
            let Some(mut entry) = self.assignments.lock().pop() else {
                break;
            };
            match self.replay_partition(&mut entry) {
                Ok(true) => {
                    info!(
                        store = %entry.store_name,
                        partition = entry.partition,
                        highwater = entry.changelog_highwater,
                        "recovery complete"
                    );
                }
                Ok(false) => {
                    // Stopped mid-replay; keep the entry so a resumed
                    // recovery picks up from the persisted position.
                    self.assignments.lock().push(entry);
                }
                Err(e) => {
                    self.assignments.lock().push(entry);
                    return Err(e);
                }
            }
        }
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Request a cooperative halt of replay (shutdown path).
    pub fn stop_recovery(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Replay one partition. Returns `Ok(true)` when it reached the
    /// highwater, `Ok(false)` when stopped early.
    fn replay_partition(&self, entry: &mut RecoveryPartition) -> Result<bool> {
        let mut applied = 0usize;
        while entry.changelog_position < entry.changelog_highwater {
            if !self.running.load(Ordering::Acquire) {
                // Each applied record already persisted its offset; repeat
                // the write so resume is exact even with no progress made.
                if entry.changelog_position > 0 {
                    entry
                        .store_partition
                        .write_changelog_offset(entry.changelog_position - 1)?;
                }
                return Ok(false);
            }
            let records = self.consumer.fetch(
                &entry.changelog_name,
                entry.partition,
                entry.changelog_position,
                REPLAY_BATCH_SIZE,
            )?;
            if records.is_empty() {
                return Err(StateError::recovery_failed(format!(
                    "changelog {}[{}] ended at {} before highwater {}",
                    entry.changelog_name,
                    entry.partition,
                    entry.changelog_position,
                    entry.changelog_highwater
                )));
            }
            for record in &records {
                if record.offset >= entry.changelog_highwater {
                    break;
                }
                entry.store_partition.recover_from_changelog(record)?;
                entry.changelog_position = record.offset + 1;
                applied += 1;
            }
            debug!(
                store = %entry.store_name,
                partition = entry.partition,
                position = entry.changelog_position,
                applied,
                "replay progress"
            );
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KvEngine;
    use rivulet_broker::{InMemoryBroker, Producer};
    use rivulet_core::Headers;

    fn volatile_partition() -> Arc<StorePartition> {
        Arc::new(StorePartition::new(
            "s",
            Some("t".to_string()),
            0,
            KvEngine::in_memory(),
            None,
        ))
    }

    fn produce_changelog(
        broker: &InMemoryBroker,
        changelog: &str,
        key: &[u8],
        value: Option<&[u8]>,
    ) {
        broker
            .produce(changelog, Some(0), Some(key), value, &Headers::new(), 0)
            .unwrap()
            .wait()
            .unwrap();
    }

    fn setup() -> (Arc<InMemoryBroker>, RecoveryManager, String) {
        let broker = Arc::new(InMemoryBroker::new());
        let manager = RecoveryManager::new("g", broker.clone());
        let changelog = manager
            .register_changelog(Some("t"), "s", Some(&TopicConfig::with_partitions(1)))
            .unwrap();
        (broker, manager, changelog)
    }

    #[test]
    fn test_register_changelog_creates_compacted_mirror() {
        let (broker, _manager, changelog) = setup();
        let config = broker.topic_config(&changelog).unwrap();
        assert_eq!(config.num_partitions, 1);
        assert_eq!(
            config.cleanup_policy,
            rivulet_core::CleanupPolicy::Compact
        );
    }

    #[test]
    fn test_caught_up_partition_not_enrolled() {
        let (_broker, manager, _changelog) = setup();
        let partition = volatile_partition();
        let mut partitions = HashMap::new();
        partitions.insert("s".to_string(), partition);

        manager
            .assign_partition(Some("t"), 0, &HashMap::new(), &partitions)
            .unwrap();
        assert!(!manager.has_assignments());
    }

    #[test]
    fn test_replay_rebuilds_state_and_tombstones() {
        let (broker, manager, changelog) = setup();
        produce_changelog(&broker, &changelog, b"a", Some(b"1"));
        produce_changelog(&broker, &changelog, b"a", Some(b"2"));
        produce_changelog(&broker, &changelog, b"b", Some(b"3"));
        produce_changelog(&broker, &changelog, b"a", None);

        let partition = volatile_partition();
        let mut partitions = HashMap::new();
        partitions.insert("s".to_string(), partition.clone());
        manager
            .assign_partition(Some("t"), 0, &HashMap::new(), &partitions)
            .unwrap();
        assert!(manager.has_assignments());

        manager.do_recovery().unwrap();
        assert!(!manager.has_assignments());
        assert_eq!(partition.get(b"a"), None);
        assert_eq!(partition.get(b"b"), Some(b"3".to_vec()));
        assert_eq!(partition.changelog_offset(), Some(3));
    }

    #[test]
    fn test_replay_resumes_from_persisted_position() {
        let (broker, manager, changelog) = setup();
        produce_changelog(&broker, &changelog, b"a", Some(b"1"));
        produce_changelog(&broker, &changelog, b"b", Some(b"2"));

        let partition = volatile_partition();
        // Pretend offset 0 was already replayed in an earlier session.
        partition.write_changelog_offset(0).unwrap();

        let mut partitions = HashMap::new();
        partitions.insert("s".to_string(), partition.clone());
        manager
            .assign_partition(Some("t"), 0, &HashMap::new(), &partitions)
            .unwrap();
        manager.do_recovery().unwrap();

        // Only the second record was applied.
        assert_eq!(partition.get(b"a"), None);
        assert_eq!(partition.get(b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_revoke_abandons_replay() {
        let (broker, manager, changelog) = setup();
        produce_changelog(&broker, &changelog, b"a", Some(b"1"));

        let partition = volatile_partition();
        let mut partitions = HashMap::new();
        partitions.insert("s".to_string(), partition);
        manager
            .assign_partition(Some("t"), 0, &HashMap::new(), &partitions)
            .unwrap();
        assert!(manager.has_assignments());

        manager.revoke_partition(0);
        assert!(!manager.has_assignments());
    }

    #[test]
    fn test_two_replays_are_identical() {
        let (broker, manager, changelog) = setup();
        for i in 0..50u8 {
            let key = vec![b'k', i % 7];
            if i % 11 == 3 {
                produce_changelog(&broker, &changelog, &key, None);
            } else {
                produce_changelog(&broker, &changelog, &key, Some(&[i]));
            }
        }

        let replay = || {
            let partition = volatile_partition();
            let mut partitions = HashMap::new();
            partitions.insert("s".to_string(), partition.clone());
            manager
                .assign_partition(Some("t"), 0, &HashMap::new(), &partitions)
                .unwrap();
            manager.do_recovery().unwrap();
            partition
                .engine()
                .dump(crate::engine::ColumnFamily::Default)
        };

        assert_eq!(replay(), replay());
    }
}
