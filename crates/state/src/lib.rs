//! State subsystem for Rivulet
//!
//! This crate implements the stateful processing engine:
//!
//! - `engine`: embedded ordered key-value engine (write-ahead logged,
//!   column families for user data vs. engine metadata) plus a volatile
//!   in-memory variant with the same transactional contract
//! - `partition` / `transaction`: per-(topic, partition, store)
//!   transactional units with processed/changelog offset tracking
//! - `store` / `windowed`: registries of partitions for one logical state
//!   store, plain and time-bucketed
//! - `changelog` / `recovery`: mirroring every mutation to a compacted
//!   changelog topic and replaying it after rebalance
//! - `manager`: the coordinator reacting to partition assign/revoke

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod changelog;
pub mod engine;
pub mod manager;
pub mod partition;
pub mod recovery;
pub mod store;
pub mod transaction;
pub mod windowed;

pub use changelog::{
    ChangelogProducer, ChangelogProducerFactory, COLUMN_FAMILY_HEADER, PROCESSED_OFFSET_HEADER,
    STORE_NAME_HEADER,
};
pub use engine::{ColumnFamily, KvEngine, WriteBatch};
pub use manager::{StateStoreManager, StateStoreManagerConfig, DEFAULT_STATE_STORE_NAME};
pub use partition::StorePartition;
pub use recovery::RecoveryManager;
pub use store::{Store, StoreBackendKind};
pub use transaction::{PartitionTransaction, TransactionState};
pub use windowed::{WindowedStore, WindowedStorePartition};
