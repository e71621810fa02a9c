//! Changelog emission.
//!
//! Every state mutation is mirrored to a compacted changelog topic whose
//! partition count and key space match the source topic 1:1. Records carry
//! a header identifying the originating store (and, for non-default column
//! families, the target family) so replay lands writes where they came
//! from. A `None` value is a tombstone.

use crate::engine::ColumnFamily;
use parking_lot::Mutex;
use rivulet_broker::{DeliveryFuture, ProduceError, Producer};
use rivulet_core::Headers;
use std::sync::Arc;
use std::time::Duration;

/// Header naming the store a changelog record belongs to.
pub const STORE_NAME_HEADER: &str = "__store_name__";

/// Header naming the column family for non-default writes.
pub const COLUMN_FAMILY_HEADER: &str = "__column_family__";

/// Header carrying the source offset whose effects the record mirrors.
///
/// Recovery restores the processed offset from it, so a rebuilt partition
/// resumes exactly where the original owner left off.
pub const PROCESSED_OFFSET_HEADER: &str = "__processed_offset__";

/// Builds per-partition changelog producers for one store.
///
/// The underlying broker producer is shared across stores; each
/// [`ChangelogProducer`] it hands out is pinned to a single changelog
/// partition so its writes stay totally ordered.
pub struct ChangelogProducerFactory {
    changelog_name: String,
    store_name: String,
    producer: Arc<dyn Producer>,
}

impl ChangelogProducerFactory {
    /// Create a factory for `changelog_name`, stamping `store_name` into
    /// every record header.
    pub fn new(
        changelog_name: impl Into<String>,
        store_name: impl Into<String>,
        producer: Arc<dyn Producer>,
    ) -> Self {
        ChangelogProducerFactory {
            changelog_name: changelog_name.into(),
            store_name: store_name.into(),
            producer,
        }
    }

    /// The changelog topic this factory produces to.
    pub fn changelog_name(&self) -> &str {
        &self.changelog_name
    }

    /// Producer bound to one changelog partition.
    pub fn get_partition_producer(&self, partition: i32) -> ChangelogProducer {
        ChangelogProducer {
            producer: self.producer.clone(),
            changelog_name: self.changelog_name.clone(),
            store_name: self.store_name.clone(),
            partition,
            in_flight: Mutex::new(Vec::new()),
        }
    }
}

/// Ordered producer for a single changelog partition.
pub struct ChangelogProducer {
    producer: Arc<dyn Producer>,
    changelog_name: String,
    store_name: String,
    partition: i32,
    in_flight: Mutex<Vec<DeliveryFuture>>,
}

impl ChangelogProducer {
    /// The changelog topic.
    pub fn changelog_name(&self) -> &str {
        &self.changelog_name
    }

    /// The changelog partition this producer is pinned to.
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Mirror one mutation. `value: None` produces a tombstone.
    ///
    /// The returned future resolves with the changelog offset assigned by
    /// the broker; the same future is also tracked here so a
    /// partition-specific [`flush`](Self::flush) is possible.
    pub fn produce(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        cf: ColumnFamily,
        timestamp_ms: i64,
        processed_offset: Option<i64>,
    ) -> Result<DeliveryFuture, ProduceError> {
        let mut headers = Headers::new();
        headers.insert(STORE_NAME_HEADER, self.store_name.as_bytes().to_vec());
        if cf != ColumnFamily::Default {
            headers.insert(COLUMN_FAMILY_HEADER, cf.name().as_bytes().to_vec());
        }
        if let Some(offset) = processed_offset {
            headers.insert(PROCESSED_OFFSET_HEADER, offset.to_le_bytes().to_vec());
        }

        let future = self.producer.produce(
            &self.changelog_name,
            Some(self.partition),
            Some(key),
            value,
            &headers,
            timestamp_ms,
        )?;
        self.in_flight.lock().push(future.clone());
        Ok(future)
    }

    /// Wait up to `timeout` for tracked deliveries; returns how many are
    /// still unresolved.
    pub fn flush(&self, timeout: Duration) -> usize {
        let futures = std::mem::take(&mut *self.in_flight.lock());
        let mut unresolved = Vec::new();
        for future in futures {
            if future.wait_timeout(timeout).is_none() {
                unresolved.push(future);
            }
        }
        let remaining = unresolved.len();
        self.in_flight.lock().extend(unresolved);
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_broker::{ChangelogConsumer, InMemoryBroker};
    use rivulet_core::TopicConfig;

    fn setup() -> (Arc<InMemoryBroker>, ChangelogProducer) {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .create_topic("changelog__g--t--s", &TopicConfig::with_partitions(2))
            .unwrap();
        let factory =
            ChangelogProducerFactory::new("changelog__g--t--s", "s", broker.clone());
        let producer = factory.get_partition_producer(1);
        (broker, producer)
    }

    #[test]
    fn test_records_carry_store_name_header() {
        let (broker, producer) = setup();
        producer
            .produce(b"k", Some(b"v"), ColumnFamily::Default, 5, Some(9))
            .unwrap()
            .wait()
            .unwrap();

        let records = broker.fetch("changelog__g--t--s", 1, 0, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].record.headers.get(STORE_NAME_HEADER),
            Some(b"s".as_slice())
        );
        assert_eq!(records[0].record.headers.get(COLUMN_FAMILY_HEADER), None);
    }

    #[test]
    fn test_non_default_family_recorded_in_header() {
        let (broker, producer) = setup();
        producer
            .produce(b"wk", Some(b"agg"), ColumnFamily::Windows, 5, None)
            .unwrap()
            .wait()
            .unwrap();

        let records = broker.fetch("changelog__g--t--s", 1, 0, 10).unwrap();
        assert_eq!(
            records[0].record.headers.get(COLUMN_FAMILY_HEADER),
            Some(b"windows".as_slice())
        );
    }

    #[test]
    fn test_tombstone_value_is_none() {
        let (broker, producer) = setup();
        producer
            .produce(b"k", None, ColumnFamily::Default, 0, None)
            .unwrap()
            .wait()
            .unwrap();
        let records = broker.fetch("changelog__g--t--s", 1, 0, 10).unwrap();
        assert!(records[0].record.is_tombstone());
    }

    #[test]
    fn test_ordered_offsets_within_partition() {
        let (_broker, producer) = setup();
        let a = producer
            .produce(b"a", Some(b"1"), ColumnFamily::Default, 0, None)
            .unwrap()
            .wait()
            .unwrap();
        let b = producer
            .produce(b"b", Some(b"2"), ColumnFamily::Default, 0, None)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(a.partition, 1);
        assert_eq!(b.offset, a.offset + 1);
    }

    #[test]
    fn test_flush_drains_in_flight() {
        let (_broker, producer) = setup();
        producer
            .produce(b"a", Some(b"1"), ColumnFamily::Default, 0, None)
            .unwrap();
        assert_eq!(producer.flush(Duration::from_millis(100)), 0);
    }
}
