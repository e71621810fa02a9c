//! Pipeline execution.
//!
//! One logical processing loop per owned partition, driven cooperatively.
//! Per input record, in order: run the transformation chain (state writes
//! accumulate in per-store transactions, outputs are buffered), produce
//! changelog entries, await broker acknowledgement, commit the store
//! transactions, produce the buffered outputs, and finally commit the
//! consumer offset. A failure at any step rolls back open transactions,
//! drops buffered outputs, revokes the partition, and surfaces a fatal
//! error. Offsets commit last, so crash recovery replays the last
//! uncommitted batch.

use crate::dataflow::{Dataflow, Op, RecordMeta};
use crate::windows::{window_result, EmitMode, WindowAggregate};
use parking_lot::Mutex;
use rivulet_broker::{ChangelogConsumer, InMemoryBroker, PartitionEventListener, Producer};
use rivulet_core::{Headers, PolledRecord, Result, StateError, TopicConfig};
use rivulet_state::{PartitionTransaction, StateStoreManager, StorePartition, TransactionState};
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

const POLL_BATCH_SIZE: usize = 64;

/// Drives a [`Dataflow`] over the partitions assigned to this instance.
pub struct PipelineRunner {
    broker: Arc<InMemoryBroker>,
    manager: Arc<StateStoreManager>,
    flow: Dataflow,
    group_id: String,
    /// Next offset to poll, per owned partition.
    positions: BTreeMap<i32, i64>,
}

impl PipelineRunner {
    /// Wire a runner: registers the chain's stores and creates its output
    /// topics.
    pub fn new(
        broker: Arc<InMemoryBroker>,
        manager: Arc<StateStoreManager>,
        flow: Dataflow,
        group_id: impl Into<String>,
    ) -> Result<Self> {
        flow.register_stores(&manager)?;
        for topic in flow.output_topics() {
            broker.create_topic(topic, &TopicConfig::default())?;
        }
        Ok(PipelineRunner {
            broker,
            manager,
            flow,
            group_id: group_id.into(),
            positions: BTreeMap::new(),
        })
    }

    /// Partitions currently owned by this runner.
    pub fn assigned_partitions(&self) -> Vec<i32> {
        self.positions.keys().copied().collect()
    }

    /// React to a partition assignment.
    ///
    /// Fans out to the state store manager and runs recovery to completion
    /// before the partition becomes pollable.
    pub fn on_assign(&mut self, partition: i32) -> Result<()> {
        let topic = self.flow.topic().to_string();
        let committed = self.broker.committed_offset(&self.group_id, &topic, partition);

        let mut committed_offsets = HashMap::new();
        if let Some(offset) = committed {
            committed_offsets.insert(topic.clone(), offset);
        }
        self.manager
            .on_partition_assign(Some(&topic), partition, &committed_offsets)?;

        if self.manager.recovery_required() {
            info!(topic = %topic, partition, "recovering state before processing");
            self.manager.do_recovery()?;
        }

        self.positions.insert(partition, committed.unwrap_or(0));
        debug!(topic = %topic, partition, "partition assigned to executor");
        Ok(())
    }

    /// React to a partition revocation.
    ///
    /// Any open transaction was already rolled back by the failing path;
    /// replay in progress is abandoned by the manager.
    pub fn on_revoke(&mut self, partition: i32) -> Result<()> {
        self.positions.remove(&partition);
        self.manager
            .on_partition_revoke(Some(self.flow.topic()), partition)
    }

    /// Poll each owned partition once and process what arrived.
    ///
    /// Returns the number of records processed. A fatal record error
    /// revokes its partition and is surfaced.
    pub fn poll_once(&mut self) -> Result<usize> {
        let topic = self.flow.topic().to_string();
        let mut processed = 0usize;
        for partition in self.assigned_partitions() {
            let position = self.positions[&partition];
            let records = self
                .broker
                .fetch(&topic, partition, position, POLL_BATCH_SIZE)?;
            for record in records {
                if let Err(e) = self.process_record(&record) {
                    error!(
                        topic = %topic,
                        partition,
                        offset = record.offset,
                        error = %e,
                        "fatal record failure; revoking partition"
                    );
                    let _ = self.on_revoke(partition);
                    return Err(e);
                }
                self.positions.insert(partition, record.offset + 1);
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Poll until no partition yields records.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        let mut total = 0usize;
        loop {
            let processed = self.poll_once()?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    fn store_partition(&self, store_name: &str, partition: i32) -> Result<Arc<StorePartition>> {
        let topic = self.flow.topic();
        let handle = if let Ok(store) = self.manager.get_store(Some(topic), store_name) {
            store.partition(partition)
        } else {
            self.manager
                .get_windowed_store(topic, store_name)?
                .partition(partition)
                .map(|w| w.inner().clone())
        };
        handle.ok_or_else(|| {
            StateError::storage(format!(
                "store \"{}\" has no assigned partition {}",
                store_name, partition
            ))
        })
    }

    /// Whether every store already durably applied this record.
    fn already_processed(&self, record: &PolledRecord) -> Result<bool> {
        let store_names = self.manager.store_names(Some(&record.topic));
        if store_names.is_empty() {
            return Ok(false);
        }
        for name in &store_names {
            let partition = self.store_partition(name, record.partition)?;
            match partition.processed_offset() {
                Some(processed) if record.offset <= processed => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn process_record(&mut self, record: &PolledRecord) -> Result<()> {
        if self.already_processed(record)? {
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "skipping record already applied to every store"
            );
            self.commit_consumer_offset(record);
            return Ok(());
        }

        let mut txs: BTreeMap<String, PartitionTransaction> = BTreeMap::new();
        let mut outputs: Vec<(String, Value)> = Vec::new();
        let result = self.run_chain(record, &mut txs, &mut outputs);

        match result {
            Ok(()) => {
                self.commit_record(record, txs, outputs)?;
                Ok(())
            }
            Err(e) => {
                for tx in txs.values_mut() {
                    if tx.state() == TransactionState::Active {
                        let _ = tx.rollback();
                    }
                }
                Err(e)
            }
        }
    }

    fn run_chain(
        &self,
        record: &PolledRecord,
        txs: &mut BTreeMap<String, PartitionTransaction>,
        outputs: &mut Vec<(String, Value)>,
    ) -> Result<()> {
        let meta = RecordMeta {
            key: record.record.key.clone(),
            timestamp_ms: record.timestamp_ms(),
            headers: record.record.headers.clone(),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        };
        let value = match record.value() {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => Value::Null,
        };
        let mut items = vec![value];

        for op in self.flow.ops() {
            match op {
                Op::Apply(f) => {
                    items = items.into_iter().map(f).collect();
                }
                Op::ApplyWithMeta(f) => {
                    items = items.into_iter().map(|v| f(v, &meta)).collect();
                }
                Op::Filter(f) => {
                    items.retain(|v| f(v));
                }
                Op::FilterWithMeta(f) => {
                    items.retain(|v| f(v, &meta));
                }
                Op::Fold { store, init, fold } => {
                    let key = stateful_key(&meta)?;
                    let partition = self.store_partition(store, record.partition)?;
                    let tx = tx_for(txs, store, &partition, meta.timestamp_ms)?;
                    let mut next = Vec::with_capacity(items.len());
                    for item in items {
                        let state = match tx.get(key)? {
                            Some(bytes) => serde_json::from_slice(&bytes)?,
                            None => init.clone(),
                        };
                        let folded = fold(state, item);
                        tx.put(key.to_vec(), serde_json::to_vec(&folded)?)?;
                        next.push(folded);
                    }
                    items = next;
                }
                Op::WindowedAgg { store, def, agg, emit } => {
                    let key = stateful_key(&meta)?;
                    let windowed = self
                        .manager
                        .get_windowed_store(&record.topic, store)?
                        .partition(record.partition)
                        .ok_or_else(|| {
                            StateError::storage(format!(
                                "windowed store \"{}\" has no assigned partition {}",
                                store, record.partition
                            ))
                        })?;
                    let inner = windowed.inner().clone();
                    let tx = tx_for(txs, store, &inner, meta.timestamp_ms)?;

                    let mut next = Vec::new();
                    for item in items {
                        let folded = item.as_f64().ok_or_else(|| {
                            StateError::serialization(
                                "windowed aggregation over a non-numeric value",
                            )
                        })?;
                        for (start, end) in def.bounds(meta.timestamp_ms) {
                            let mut aggregate = match windowed.get_window(tx, key, start, end)? {
                                Some(bytes) => bincode::deserialize::<WindowAggregate>(&bytes)?,
                                None => WindowAggregate::default(),
                            };
                            aggregate.fold(folded);
                            windowed.update_window(
                                tx,
                                key,
                                start,
                                end,
                                &bincode::serialize(&aggregate)?,
                                meta.timestamp_ms,
                            )?;
                            if *emit == EmitMode::Current {
                                next.push(window_result(start, end, aggregate.result(*agg)));
                            }
                        }
                    }
                    if *emit == EmitMode::Final {
                        let watermark = windowed
                            .latest_timestamp(tx, key)?
                            .unwrap_or(meta.timestamp_ms);
                        for expired in windowed.expire_windows(tx, key, watermark)? {
                            let aggregate: WindowAggregate =
                                bincode::deserialize(&expired.value)?;
                            next.push(window_result(
                                expired.start_ms,
                                expired.end_ms,
                                aggregate.result(*agg),
                            ));
                        }
                    }
                    items = next;
                }
                Op::ToTopic(topic) => {
                    for item in &items {
                        outputs.push((topic.clone(), item.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Commit order per input record: changelog entries, broker acks,
    /// store transactions, output records, consumer offset.
    fn commit_record(
        &self,
        record: &PolledRecord,
        mut txs: BTreeMap<String, PartitionTransaction>,
        outputs: Vec<(String, Value)>,
    ) -> Result<()> {
        for tx in txs.values_mut() {
            tx.produce_changelog(record.offset)?;
        }
        for tx in txs.values_mut() {
            tx.commit(record.offset)?;
        }

        for (topic, value) in outputs {
            let bytes = serde_json::to_vec(&value)?;
            let future = self
                .broker
                .produce(
                    &topic,
                    None,
                    record.key(),
                    Some(&bytes),
                    &Headers::new(),
                    record.timestamp_ms(),
                )
                .map_err(|e| StateError::state_transaction(format!("output produce failed: {}", e)))?;
            future
                .wait()
                .map_err(|e| StateError::state_transaction(format!("output delivery failed: {}", e)))?;
        }

        self.commit_consumer_offset(record);
        Ok(())
    }

    fn commit_consumer_offset(&self, record: &PolledRecord) {
        // Committed offset is the next offset to consume.
        self.broker.commit_offset(
            &self.group_id,
            &record.topic,
            record.partition,
            record.offset + 1,
        );
    }
}

/// Adapter exposing a shared runner as broker rebalance callbacks.
///
/// The broker client fires assign/revoke from its own threads; this
/// adapter serializes them onto the runner. Callback failures cannot be
/// propagated to the broker, so they are logged and the partition is left
/// unowned.
pub struct RunnerRebalanceListener {
    runner: Arc<Mutex<PipelineRunner>>,
}

impl RunnerRebalanceListener {
    /// Wrap a shared runner.
    pub fn new(runner: Arc<Mutex<PipelineRunner>>) -> Self {
        RunnerRebalanceListener { runner }
    }
}

impl PartitionEventListener for RunnerRebalanceListener {
    fn on_assign(&self, topic: &str, partition: i32) {
        let mut runner = self.runner.lock();
        if runner.flow.topic() != topic {
            return;
        }
        if let Err(e) = runner.on_assign(partition) {
            error!(topic, partition, error = %e, "partition assignment failed");
        }
    }

    fn on_revoke(&self, topic: &str, partition: i32) {
        let mut runner = self.runner.lock();
        if runner.flow.topic() != topic {
            return;
        }
        if let Err(e) = runner.on_revoke(partition) {
            error!(topic, partition, error = %e, "partition revocation failed");
        }
    }
}

fn stateful_key(meta: &RecordMeta) -> Result<&[u8]> {
    meta.key.as_deref().ok_or_else(|| {
        StateError::state_transaction("record without a key reached a stateful operator")
    })
}

fn tx_for<'a>(
    txs: &'a mut BTreeMap<String, PartitionTransaction>,
    store: &str,
    partition: &Arc<StorePartition>,
    timestamp_ms: i64,
) -> Result<&'a mut PartitionTransaction> {
    match txs.entry(store.to_string()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let mut tx = partition.begin()?;
            tx.set_timestamp(timestamp_ms);
            Ok(entry.insert(tx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_state::{StateStoreManagerConfig, StoreBackendKind};
    use serde_json::json;

    fn setup(flow: Dataflow) -> (Arc<InMemoryBroker>, Arc<StateStoreManager>, PipelineRunner) {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .create_topic(flow.topic(), &TopicConfig::with_partitions(1))
            .unwrap();
        let manager = Arc::new(StateStoreManager::new(
            StateStoreManagerConfig {
                default_backend: Some(StoreBackendKind::Volatile),
                ..Default::default()
            },
            None,
            None,
        ));
        let runner = PipelineRunner::new(broker.clone(), manager.clone(), flow, "g").unwrap();
        (broker, manager, runner)
    }

    fn produce_json(broker: &InMemoryBroker, topic: &str, key: &[u8], value: &Value, ts: i64) {
        broker
            .produce(
                topic,
                Some(0),
                Some(key),
                Some(&serde_json::to_vec(value).unwrap()),
                &Headers::new(),
                ts,
            )
            .unwrap()
            .wait()
            .unwrap();
    }

    #[test]
    fn test_stateless_map_filter_to_topic() {
        let flow = Dataflow::from_topic("in")
            .apply(|v| json!(v.as_i64().unwrap() * 2))
            .filter(|v| v.as_i64().unwrap() > 4)
            .to_topic("out");
        let (broker, _manager, mut runner) = setup(flow);

        runner.on_assign(0).unwrap();
        for i in 1..=3 {
            produce_json(&broker, "in", b"k", &json!(i), i);
        }
        assert_eq!(runner.run_until_idle().unwrap(), 3);

        let out = broker.fetch("out", 0, 0, 10).unwrap();
        let values: Vec<i64> = out
            .iter()
            .map(|r| serde_json::from_slice::<Value>(r.value().unwrap()).unwrap())
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![6]);
    }

    #[test]
    fn test_fold_accumulates_per_key() {
        let flow = Dataflow::from_topic("in").fold("totals", json!(0), |state, item| {
            json!(state.as_i64().unwrap() + item.as_i64().unwrap())
        });
        let (broker, manager, mut runner) = setup(flow);

        runner.on_assign(0).unwrap();
        produce_json(&broker, "in", b"a", &json!(5), 1);
        produce_json(&broker, "in", b"a", &json!(7), 2);
        produce_json(&broker, "in", b"b", &json!(1), 3);
        runner.run_until_idle().unwrap();

        let store = manager.get_store(Some("in"), "totals").unwrap();
        let partition = store.partition(0).unwrap();
        let stored: Value =
            serde_json::from_slice(&partition.get(b"a").unwrap()).unwrap();
        assert_eq!(stored, json!(12));
        let stored: Value =
            serde_json::from_slice(&partition.get(b"b").unwrap()).unwrap();
        assert_eq!(stored, json!(1));
        assert_eq!(partition.processed_offset(), Some(2));
    }

    #[test]
    fn test_consumer_offset_committed_after_processing() {
        let flow = Dataflow::from_topic("in").apply(|v| v);
        let (broker, _manager, mut runner) = setup(flow);
        runner.on_assign(0).unwrap();
        produce_json(&broker, "in", b"k", &json!(1), 1);
        runner.run_until_idle().unwrap();
        assert_eq!(broker.committed_offset("g", "in", 0), Some(1));
    }

    #[test]
    fn test_reassignment_resumes_from_committed_offset() {
        let flow = Dataflow::from_topic("in").to_topic("out");
        let (broker, _manager, mut runner) = setup(flow);
        runner.on_assign(0).unwrap();
        produce_json(&broker, "in", b"k", &json!(1), 1);
        runner.run_until_idle().unwrap();
        runner.on_revoke(0).unwrap();

        // New records while unassigned; reassignment picks up after the
        // committed offset without reprocessing the first record.
        produce_json(&broker, "in", b"k", &json!(2), 2);
        runner.on_assign(0).unwrap();
        runner.run_until_idle().unwrap();
        assert_eq!(broker.high_watermark("out", 0).unwrap(), 2);
    }

    #[test]
    fn test_stale_record_skipped_for_caught_up_store() {
        let flow = Dataflow::from_topic("in").fold("totals", json!(0), |state, item| {
            json!(state.as_i64().unwrap() + item.as_i64().unwrap())
        });
        let (broker, manager, mut runner) = setup(flow);
        runner.on_assign(0).unwrap();
        produce_json(&broker, "in", b"a", &json!(5), 1);
        runner.run_until_idle().unwrap();

        // Simulate a restart that lost the committed consumer offset but
        // kept store state: the record must not be applied twice.
        runner.positions.insert(0, 0);
        runner.run_until_idle().unwrap();

        let store = manager.get_store(Some("in"), "totals").unwrap();
        let stored: Value = serde_json::from_slice(
            &store.partition(0).unwrap().get(b"a").unwrap(),
        )
        .unwrap();
        assert_eq!(stored, json!(5));
    }

    #[test]
    fn test_rebalance_listener_routes_callbacks() {
        let flow = Dataflow::from_topic("in").to_topic("out");
        let (broker, _manager, runner) = setup(flow);
        let runner = Arc::new(Mutex::new(runner));
        let listener = RunnerRebalanceListener::new(runner.clone());

        listener.on_assign("in", 0);
        listener.on_assign("unrelated", 3);
        assert_eq!(runner.lock().assigned_partitions(), vec![0]);

        produce_json(&broker, "in", b"k", &json!(1), 1);
        runner.lock().run_until_idle().unwrap();
        assert_eq!(broker.high_watermark("out", 0).unwrap(), 1);

        listener.on_revoke("in", 0);
        assert!(runner.lock().assigned_partitions().is_empty());
    }

    #[test]
    fn test_keyless_record_fails_stateful_chain() {
        let flow = Dataflow::from_topic("in").fold("totals", json!(0), |s, _| s);
        let (broker, _manager, mut runner) = setup(flow);
        runner.on_assign(0).unwrap();
        broker
            .produce("in", Some(0), None, Some(b"1"), &Headers::new(), 1)
            .unwrap()
            .wait()
            .unwrap();
        let err = runner.run_until_idle().unwrap_err();
        assert!(matches!(err, StateError::StateTransactionError { .. }));
        // The failing partition was revoked.
        assert!(runner.assigned_partitions().is_empty());
    }
}
