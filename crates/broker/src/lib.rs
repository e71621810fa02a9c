//! Broker boundary for Rivulet
//!
//! The broker client proper (wire protocol, network I/O) is an external
//! collaborator; this crate pins down the fixed interfaces the runtime
//! relies on:
//!
//! - [`Producer`]: concurrent-safe produce with per-record delivery futures
//! - [`ChangelogConsumer`]: ordered reads and highwater queries used by
//!   state recovery
//! - [`PartitionEventListener`]: assign/revoke rebalance callbacks
//! - [`InMemoryBroker`]: an in-process implementation backing tests and
//!   single-process pipelines
//!
//! Records are ordered within a partition; there is no ordering guarantee
//! across partitions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod consumer;
pub mod inmem;
pub mod producer;

pub use ack::{DeliveryFuture, DeliveryReport, ProduceError};
pub use consumer::{ChangelogConsumer, PartitionEventListener};
pub use inmem::InMemoryBroker;
pub use producer::Producer;
