//! Producer contract
//!
//! The producer is shared across stores for changelog emission and by the
//! executor for output records, so implementations must be safe for
//! concurrent enqueue from multiple threads.

use crate::ack::{DeliveryFuture, ProduceError};
use rivulet_core::Headers;
use std::time::Duration;

/// Concurrent-safe record producer
pub trait Producer: Send + Sync {
    /// Enqueue a record for delivery
    ///
    /// `partition: None` routes by key hash (round-robin without a key).
    /// The returned future resolves when the broker acknowledges the
    /// record with its assigned offset.
    #[allow(clippy::too_many_arguments)]
    fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        headers: &Headers,
        timestamp_ms: i64,
    ) -> Result<DeliveryFuture, ProduceError>;

    /// Wait up to `timeout` for in-flight deliveries to settle
    ///
    /// Returns the number of records still unacknowledged afterwards.
    fn flush(&self, timeout: Duration) -> usize;
}
