//! Delivery acknowledgements
//!
//! Every produce returns a [`DeliveryFuture`] that resolves once the broker
//! has acknowledged (or rejected) the record. Futures are cheap shared
//! slots; cloning one observes the same resolution.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error reported for a failed produce
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("produce to \"{topic}\" failed: {reason}")]
pub struct ProduceError {
    /// Topic the produce targeted
    pub topic: String,
    /// Broker-reported reason
    pub reason: String,
}

impl ProduceError {
    /// Create a produce error
    pub fn new(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        ProduceError {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

/// Where an acknowledged record landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Destination topic
    pub topic: String,
    /// Destination partition
    pub partition: i32,
    /// Assigned offset
    pub offset: i64,
}

type DeliveryResult = Result<DeliveryReport, ProduceError>;

struct Slot {
    state: Mutex<Option<DeliveryResult>>,
    cond: Condvar,
}

/// Future side of a delivery acknowledgement
#[derive(Clone)]
pub struct DeliveryFuture {
    slot: Arc<Slot>,
}

/// Resolver side of a delivery acknowledgement
///
/// Held by the broker implementation; completing it wakes every waiter on
/// the paired future.
pub struct DeliveryPromise {
    slot: Arc<Slot>,
}

/// Create a linked promise/future pair
pub fn delivery_pair() -> (DeliveryPromise, DeliveryFuture) {
    let slot = Arc::new(Slot {
        state: Mutex::new(None),
        cond: Condvar::new(),
    });
    (
        DeliveryPromise { slot: slot.clone() },
        DeliveryFuture { slot },
    )
}

impl DeliveryPromise {
    /// Resolve the paired future
    pub fn complete(self, result: DeliveryResult) {
        let mut state = self.slot.state.lock();
        *state = Some(result);
        self.slot.cond.notify_all();
    }
}

impl DeliveryFuture {
    /// Block until the broker acknowledges or rejects the record
    pub fn wait(&self) -> DeliveryResult {
        let mut state = self.slot.state.lock();
        while state.is_none() {
            self.slot.cond.wait(&mut state);
        }
        state.clone().expect("resolved delivery slot")
    }

    /// Block up to `timeout`; `None` if the acknowledgement has not arrived
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DeliveryResult> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        while state.is_none() {
            if self.slot.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.clone()
    }

    /// Immediately-resolved future (used for already-acknowledged writes)
    pub fn resolved(result: DeliveryResult) -> Self {
        let (promise, future) = delivery_pair();
        promise.complete(result);
        future
    }
}
