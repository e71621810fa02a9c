//! In-process broker
//!
//! `InMemoryBroker` backs tests and single-process pipelines with the same
//! contract a real broker client offers: per-partition append-only ordered
//! logs, delivery acknowledgements carrying assigned offsets, committed
//! offsets per consumer group, and highwater queries.
//!
//! Failure injection (`fail_next_produce`) makes broker-side produce
//! failures a first-class test input: the next produce to the marked topic
//! is accepted but its delivery future resolves with an error.

use crate::ack::{delivery_pair, DeliveryFuture, DeliveryReport, ProduceError};
use crate::consumer::ChangelogConsumer;
use crate::producer::Producer;
use dashmap::DashMap;
use parking_lot::Mutex;
use rivulet_core::{Headers, PolledRecord, Record, Result, StateError, TopicConfig, TopicPartition};
use rustc_hash::FxHasher;
use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

struct TopicLog {
    config: TopicConfig,
    partitions: Vec<Mutex<Vec<Record>>>,
    next_round_robin: AtomicUsize,
}

impl TopicLog {
    fn new(config: TopicConfig) -> Self {
        let partitions = (0..config.num_partitions.max(1))
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        TopicLog {
            config,
            partitions,
            next_round_robin: AtomicUsize::new(0),
        }
    }

    fn partition_for(&self, key: Option<&[u8]>) -> usize {
        match key {
            Some(key) => {
                let mut hasher = FxHasher::default();
                hasher.write(key);
                (hasher.finish() % self.partitions.len() as u64) as usize
            }
            None => self.next_round_robin.fetch_add(1, Ordering::Relaxed) % self.partitions.len(),
        }
    }
}

/// In-process broker with per-partition ordered logs
#[derive(Default)]
pub struct InMemoryBroker {
    topics: DashMap<String, TopicLog>,
    /// `(group, topic/partition) → committed offset`
    committed: DashMap<(String, TopicPartition), i64>,
    fail_next: Mutex<HashSet<String>>,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a topic exists
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Partition count of a topic, if it exists
    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.topics.get(topic).map(|t| t.partitions.len() as i32)
    }

    /// Configuration a topic was created with
    pub fn topic_config(&self, topic: &str) -> Option<TopicConfig> {
        self.topics.get(topic).map(|t| t.config.clone())
    }

    /// Committed offset for a consumer group on a partition
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.committed
            .get(&(group.to_string(), TopicPartition::new(topic, partition)))
            .map(|v| *v)
    }

    /// Commit a consumer group offset
    pub fn commit_offset(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.committed
            .insert((group.to_string(), TopicPartition::new(topic, partition)), offset);
    }

    /// Make the next produce to `topic` fail at delivery time
    pub fn fail_next_produce(&self, topic: &str) {
        self.fail_next.lock().insert(topic.to_string());
    }

    fn take_failure(&self, topic: &str) -> bool {
        self.fail_next.lock().remove(topic)
    }

    fn ensure_topic(&self, topic: &str) {
        if !self.topics.contains_key(topic) {
            debug!(topic, "auto-creating topic with default config");
            self.topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicLog::new(TopicConfig::default()));
        }
    }
}

impl Producer for InMemoryBroker {
    fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        headers: &Headers,
        timestamp_ms: i64,
    ) -> std::result::Result<DeliveryFuture, ProduceError> {
        self.ensure_topic(topic);
        let log = self
            .topics
            .get(topic)
            .ok_or_else(|| ProduceError::new(topic, "unknown topic"))?;

        let partition = match partition {
            Some(p) => {
                if p < 0 || p as usize >= log.partitions.len() {
                    return Err(ProduceError::new(
                        topic,
                        format!("partition {} out of range", p),
                    ));
                }
                p as usize
            }
            None => log.partition_for(key),
        };

        if self.take_failure(topic) {
            return Ok(DeliveryFuture::resolved(Err(ProduceError::new(
                topic,
                "injected delivery failure",
            ))));
        }

        let record = Record {
            key: key.map(|k| k.to_vec()),
            value: value.map(|v| v.to_vec()),
            timestamp_ms,
            headers: headers.clone(),
        };

        let (promise, future) = delivery_pair();
        let offset = {
            let mut partition_log = log.partitions[partition].lock();
            partition_log.push(record);
            (partition_log.len() - 1) as i64
        };
        promise.complete(Ok(DeliveryReport {
            topic: topic.to_string(),
            partition: partition as i32,
            offset,
        }));
        Ok(future)
    }

    fn flush(&self, _timeout: Duration) -> usize {
        // Deliveries are acknowledged synchronously; nothing stays in flight.
        0
    }
}

impl ChangelogConsumer for InMemoryBroker {
    fn create_topic(&self, name: &str, config: &TopicConfig) -> Result<()> {
        if let Some(existing) = self.topics.get(name) {
            if existing.config.num_partitions != config.num_partitions {
                return Err(StateError::invalid_config(format!(
                    "topic \"{}\" already exists with {} partitions (requested {})",
                    name,
                    existing.config.num_partitions,
                    config.num_partitions
                )));
            }
            return Ok(());
        }
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| TopicLog::new(config.clone()));
        Ok(())
    }

    fn high_watermark(&self, topic: &str, partition: i32) -> Result<i64> {
        let log = self
            .topics
            .get(topic)
            .ok_or_else(|| StateError::storage(format!("unknown topic \"{}\"", topic)))?;
        let partition_log = log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| StateError::storage(format!("unknown partition {}[{}]", topic, partition)))?;
        let len = partition_log.lock().len() as i64;
        Ok(len)
    }

    fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max: usize,
    ) -> Result<Vec<PolledRecord>> {
        let log = self
            .topics
            .get(topic)
            .ok_or_else(|| StateError::storage(format!("unknown topic \"{}\"", topic)))?;
        let partition_log = log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| StateError::storage(format!("unknown partition {}[{}]", topic, partition)))?;

        let guard = partition_log.lock();
        let start = offset.max(0) as usize;
        Ok(guard
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(i, record)| PolledRecord {
                topic: topic.to_string(),
                partition,
                offset: i as i64,
                record: record.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn produce_value(broker: &InMemoryBroker, topic: &str, partition: i32, value: &[u8]) -> i64 {
        broker
            .produce(
                topic,
                Some(partition),
                Some(b"k"),
                Some(value),
                &Headers::new(),
                0,
            )
            .unwrap()
            .wait()
            .unwrap()
            .offset
    }

    #[test]
    fn test_produce_assigns_sequential_offsets() {
        let broker = InMemoryBroker::new();
        broker
            .create_topic("t", &TopicConfig::with_partitions(1))
            .unwrap();
        assert_eq!(produce_value(&broker, "t", 0, b"a"), 0);
        assert_eq!(produce_value(&broker, "t", 0, b"b"), 1);
        assert_eq!(produce_value(&broker, "t", 0, b"c"), 2);
        assert_eq!(broker.high_watermark("t", 0).unwrap(), 3);
    }

    #[test]
    fn test_fetch_preserves_partition_order() {
        let broker = InMemoryBroker::new();
        broker
            .create_topic("t", &TopicConfig::with_partitions(2))
            .unwrap();
        produce_value(&broker, "t", 0, b"a");
        produce_value(&broker, "t", 0, b"b");
        produce_value(&broker, "t", 1, b"x");

        let records = broker.fetch("t", 0, 0, 100).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value(), Some(b"a".as_slice()));
        assert_eq!(records[1].value(), Some(b"b".as_slice()));
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[1].offset, 1);

        let records = broker.fetch("t", 0, 1, 100).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value(), Some(b"b".as_slice()));
    }

    #[test]
    fn test_key_routing_is_stable() {
        let broker = InMemoryBroker::new();
        broker
            .create_topic("t", &TopicConfig::with_partitions(4))
            .unwrap();
        let first = broker
            .produce("t", None, Some(b"machine-2"), Some(b"1"), &Headers::new(), 0)
            .unwrap()
            .wait()
            .unwrap()
            .partition;
        for _ in 0..10 {
            let p = broker
                .produce("t", None, Some(b"machine-2"), Some(b"1"), &Headers::new(), 0)
                .unwrap()
                .wait()
                .unwrap()
                .partition;
            assert_eq!(p, first);
        }
    }

    #[test]
    fn test_create_topic_idempotent_and_conflicting() {
        let broker = InMemoryBroker::new();
        let config = TopicConfig::with_partitions(3);
        broker.create_topic("t", &config).unwrap();
        broker.create_topic("t", &config).unwrap();

        let err = broker
            .create_topic("t", &TopicConfig::with_partitions(5))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_committed_offsets_per_group() {
        let broker = InMemoryBroker::new();
        broker.commit_offset("g1", "t", 0, 5);
        broker.commit_offset("g2", "t", 0, 9);
        assert_eq!(broker.committed_offset("g1", "t", 0), Some(5));
        assert_eq!(broker.committed_offset("g2", "t", 0), Some(9));
        assert_eq!(broker.committed_offset("g3", "t", 0), None);
    }

    #[test]
    fn test_fail_next_produce_resolves_future_with_error() {
        let broker = InMemoryBroker::new();
        broker
            .create_topic("t", &TopicConfig::with_partitions(1))
            .unwrap();
        broker.fail_next_produce("t");

        let future = broker
            .produce("t", Some(0), Some(b"k"), Some(b"v"), &Headers::new(), 0)
            .unwrap();
        assert!(future.wait().is_err());

        // Failure is consumed; the next produce succeeds.
        let future = broker
            .produce("t", Some(0), Some(b"k"), Some(b"v"), &Headers::new(), 0)
            .unwrap();
        assert!(future.wait().is_ok());
        // The failed record never landed in the log.
        assert_eq!(broker.high_watermark("t", 0).unwrap(), 1);
    }

    #[test]
    fn test_partition_out_of_range() {
        let broker = InMemoryBroker::new();
        broker
            .create_topic("t", &TopicConfig::with_partitions(1))
            .unwrap();
        assert!(broker
            .produce("t", Some(9), None, Some(b"v"), &Headers::new(), 0)
            .is_err());
    }
}
