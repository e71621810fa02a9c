//! # Rivulet
//!
//! A stateful stream-processing runtime: records flow from a partitioned
//! ordered log through a declarative dataflow, with per-key local state in
//! transactional stores that are mirrored to compacted changelog topics
//! and rebuilt from them after rebalance.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rivulet::{
//!     Dataflow, InMemoryBroker, PipelineRunner, RecoveryManager,
//!     StateStoreManager, StateStoreManagerConfig,
//! };
//!
//! fn main() -> rivulet::Result<()> {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let recovery = Arc::new(RecoveryManager::new("alerter", broker.clone()));
//!     let manager = Arc::new(StateStoreManager::new(
//!         StateStoreManagerConfig {
//!             group_id: Some("alerter".into()),
//!             state_dir: Some("./state".into()),
//!             ..Default::default()
//!         },
//!         Some(broker.clone()),
//!         Some(recovery),
//!     ));
//!     manager.init()?;
//!
//!     let flow = Dataflow::from_topic("temperatures")
//!         .apply(|v| v["Temperature_C"].clone())
//!         .hopping_window(5000, 1000)?
//!         .mean()
//!         .current()
//!         .filter(|v| v["value"].as_f64().map_or(false, |t| t >= 90.0))
//!         .to_topic("temperature_alerts");
//!
//!     let mut runner = PipelineRunner::new(broker, manager, flow, "alerter")?;
//!     runner.on_assign(0)?;
//!     runner.run_until_idle()?;
//!     Ok(())
//! }
//! ```

pub use rivulet_broker::{
    ChangelogConsumer, DeliveryFuture, DeliveryReport, InMemoryBroker, PartitionEventListener,
    ProduceError, Producer,
};
pub use rivulet_core::{
    changelog_topic_name, CleanupPolicy, Codec, CodecKind, Headers, PolledRecord, Record, Result,
    StateError, TopicConfig, TopicPartition,
};
pub use rivulet_runtime::{
    AggKind, Dataflow, EmitMode, GeneratorSource, PipelineRunner, RecordMeta, ReplaySource,
    RunnerRebalanceListener, Source, SourceContext, SourceHandle, WindowAggregate, WindowDef,
    WindowKind,
};
pub use rivulet_state::{
    ChangelogProducer, ChangelogProducerFactory, ColumnFamily, KvEngine, PartitionTransaction,
    RecoveryManager, StateStoreManager, StateStoreManagerConfig, Store, StoreBackendKind,
    StorePartition, TransactionState, WindowedStore, WindowedStorePartition, WriteBatch,
    COLUMN_FAMILY_HEADER, DEFAULT_STATE_STORE_NAME, PROCESSED_OFFSET_HEADER, STORE_NAME_HEADER,
};
