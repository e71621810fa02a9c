//! Consumer-side contracts
//!
//! The broker client delivers records ordered within a partition and fires
//! assignment callbacks from its own threads. The runtime reacts through
//! [`PartitionEventListener`]; state recovery reads changelog partitions
//! through [`ChangelogConsumer`].

use rivulet_core::{PolledRecord, Result, TopicConfig};

/// Rebalance callbacks fired by the broker client
pub trait PartitionEventListener: Send + Sync {
    /// A partition was assigned to this instance
    fn on_assign(&self, topic: &str, partition: i32);

    /// A partition was revoked from this instance
    fn on_revoke(&self, topic: &str, partition: i32);
}

/// Ordered read access to changelog topics
///
/// Recovery replays a changelog partition from a stored position up to the
/// highwater captured at assignment time. Reads must preserve partition
/// order.
pub trait ChangelogConsumer: Send + Sync {
    /// Create (or verify) a topic; idempotent for identical configuration
    fn create_topic(&self, name: &str, config: &TopicConfig) -> Result<()>;

    /// End offset of a partition (offset the next record would get)
    fn high_watermark(&self, topic: &str, partition: i32) -> Result<i64>;

    /// Read up to `max` records starting at `offset`
    fn fetch(&self, topic: &str, partition: i32, offset: i64, max: usize)
        -> Result<Vec<PolledRecord>>;
}
