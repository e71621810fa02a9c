//! Pluggable record sources.
//!
//! A source synthesizes records into the pipeline, bypassing a real
//! consumer. It declares its topic (whose partition count may depend on
//! the input shape), runs on its own thread until its input is exhausted
//! or it is stopped, and must honor the shutdown timeout for cooperative
//! stop.
//!
//! [`ReplaySource`] optionally preserves original inter-record delays:
//! pacing is tracked per partition (the tracker resets when emission
//! switches partition), so replay timing is accurate within a partition
//! while interleaving across partitions is not bounded. Its `run` makes a
//! single ordered pass over its input and returns: sources over finite
//! inputs are single-shot, and the running flag only serves early
//! shutdown.

use rivulet_broker::{ChangelogConsumer, Producer};
use rivulet_core::{Record, Result, StateError, TopicConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Execution context handed to a running source.
pub struct SourceContext {
    topic: String,
    producer: Arc<dyn Producer>,
    running: Arc<AtomicBool>,
}

impl SourceContext {
    /// Topic this source produces to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the source should keep running.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Produce one record, waiting for broker acknowledgement.
    pub fn produce(&self, partition: Option<i32>, record: &Record) -> Result<()> {
        let future = self
            .producer
            .produce(
                &self.topic,
                partition,
                record.key.as_deref(),
                record.value.as_deref(),
                &record.headers,
                record.timestamp_ms,
            )
            .map_err(|e| StateError::storage(e.to_string()))?;
        future
            .wait()
            .map_err(|e| StateError::storage(e.to_string()))?;
        Ok(())
    }

    /// Wait for outstanding deliveries to settle.
    pub fn flush(&self, timeout: Duration) -> usize {
        self.producer.flush(timeout)
    }
}

/// A record producer feeding the pipeline.
pub trait Source: Send {
    /// Source name (also the default topic name).
    fn name(&self) -> &str;

    /// Declared topic and configuration; the partition count may depend
    /// on the input shape.
    fn default_topic(&self) -> (String, TopicConfig);

    /// Emit records until the input is exhausted or `ctx.running()` turns
    /// false.
    fn run(&mut self, ctx: &SourceContext) -> Result<()>;

    /// How long a cooperative stop may take before the source thread is
    /// abandoned.
    fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Handle to a source running on its own thread.
pub struct SourceHandle {
    name: String,
    topic: String,
    running: Arc<AtomicBool>,
    done: mpsc::Receiver<Result<()>>,
    thread: Option<thread::JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl SourceHandle {
    /// Create the source's topic and start it on a new thread.
    pub fn spawn<S, B>(mut source: S, broker: Arc<B>) -> Result<SourceHandle>
    where
        S: Source + 'static,
        B: Producer + ChangelogConsumer + Send + Sync + 'static,
    {
        let (topic, config) = source.default_topic();
        broker.create_topic(&topic, &config)?;

        let name = source.name().to_string();
        let shutdown_timeout = source.shutdown_timeout();
        let running = Arc::new(AtomicBool::new(true));
        let producer: Arc<dyn Producer> = broker;
        let ctx = SourceContext {
            topic: topic.clone(),
            producer,
            running: running.clone(),
        };

        let (done_tx, done) = mpsc::channel();
        let thread_name = format!("source-{}", name);
        let thread = thread::Builder::new().name(thread_name).spawn(move || {
            let result = source.run(&ctx);
            let _ = done_tx.send(result);
        })?;
        info!(source = %name, topic = %topic, "source started");

        Ok(SourceHandle {
            name,
            topic,
            running,
            done,
            thread: Some(thread),
            shutdown_timeout,
        })
    }

    /// Source name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topic the source produces to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Block until the source finishes its input.
    pub fn wait(&mut self) -> Result<()> {
        let result = self
            .done
            .recv()
            .map_err(|_| StateError::storage("source thread terminated abnormally"))?;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        result
    }

    /// Cooperative stop: clear the running flag and wait up to the
    /// source's shutdown timeout before abandoning the thread.
    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        match self.done.recv_timeout(self.shutdown_timeout) {
            Ok(result) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                result
            }
            Err(_) => {
                warn!(
                    source = %self.name,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "source did not stop within the shutdown timeout; abandoning"
                );
                self.thread.take();
                Ok(())
            }
        }
    }
}

/// Replays pre-partitioned records, optionally preserving the original
/// inter-record delays per partition.
pub struct ReplaySource {
    name: String,
    partitions: BTreeMap<i32, Vec<Record>>,
    as_replay: bool,
    shutdown_timeout: Duration,
    previous_timestamp: Option<i64>,
    previous_partition: Option<i32>,
}

impl ReplaySource {
    /// Create a replay source over records grouped by partition.
    pub fn new(name: impl Into<String>, partitions: BTreeMap<i32, Vec<Record>>) -> Self {
        ReplaySource {
            name: name.into(),
            partitions,
            as_replay: true,
            shutdown_timeout: Duration::from_secs(10),
            previous_timestamp: None,
            previous_partition: None,
        }
    }

    /// Emit as fast as possible instead of reproducing delays.
    pub fn without_replay_pacing(mut self) -> Self {
        self.as_replay = false;
        self
    }

    /// Override the cooperative stop timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Reset the pacing tracker when emission switches partition.
    fn check_partition_switch(&mut self, partition: i32) {
        if self.previous_partition != Some(partition) {
            self.previous_timestamp = None;
            self.previous_partition = Some(partition);
            debug!(partition, "beginning replay of partition");
        }
    }

    /// Sleep for the timestamp delta since the previous record.
    fn replay_delay(&mut self, timestamp_ms: i64) {
        if let Some(previous) = self.previous_timestamp {
            let delta = timestamp_ms - previous;
            if delta > 0 {
                thread::sleep(Duration::from_millis(delta as u64));
            }
        }
        self.previous_timestamp = Some(timestamp_ms);
    }
}

impl Source for ReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_topic(&self) -> (String, TopicConfig) {
        // Partition count follows the input fan-out.
        let num_partitions = self
            .partitions
            .keys()
            .max()
            .map(|max| max + 1)
            .unwrap_or(1);
        (self.name.clone(), TopicConfig::with_partitions(num_partitions))
    }

    fn run(&mut self, ctx: &SourceContext) -> Result<()> {
        let partitions = std::mem::take(&mut self.partitions);
        for (partition, records) in &partitions {
            self.check_partition_switch(*partition);
            for record in records {
                if !ctx.running() {
                    return Ok(());
                }
                if self.as_replay {
                    self.replay_delay(record.timestamp_ms);
                }
                ctx.produce(Some(*partition), record)?;
            }
        }
        ctx.flush(self.shutdown_timeout);
        Ok(())
    }

    fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

/// Emits records from a generator closure until it returns `None`.
pub struct GeneratorSource<F> {
    name: String,
    interval: Duration,
    generate: F,
}

impl<F> GeneratorSource<F>
where
    F: FnMut(u64) -> Option<Record> + Send,
{
    /// Create a generator source emitting every `interval`.
    pub fn new(name: impl Into<String>, interval: Duration, generate: F) -> Self {
        GeneratorSource {
            name: name.into(),
            interval,
            generate,
        }
    }
}

impl<F> Source for GeneratorSource<F>
where
    F: FnMut(u64) -> Option<Record> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn default_topic(&self) -> (String, TopicConfig) {
        (self.name.clone(), TopicConfig::default())
    }

    fn run(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut emitted = 0u64;
        while ctx.running() {
            let Some(record) = (self.generate)(emitted) else {
                break;
            };
            ctx.produce(None, &record)?;
            emitted += 1;
            if !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }
        debug!(source = %self.name, emitted, "generator finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_broker::InMemoryBroker;

    fn records(values: &[(i64, &[u8])]) -> Vec<Record> {
        values
            .iter()
            .map(|(ts, v)| Record::new(b"k".to_vec(), v.to_vec(), *ts))
            .collect()
    }

    #[test]
    fn test_replay_source_single_pass() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut partitions = BTreeMap::new();
        partitions.insert(0, records(&[(1, b"a"), (2, b"b")]));
        partitions.insert(1, records(&[(1, b"x")]));

        let source = ReplaySource::new("replayed", partitions).without_replay_pacing();
        let mut handle = SourceHandle::spawn(source, broker.clone()).unwrap();
        handle.wait().unwrap();

        assert_eq!(broker.partition_count("replayed"), Some(2));
        assert_eq!(broker.high_watermark("replayed", 0).unwrap(), 2);
        assert_eq!(broker.high_watermark("replayed", 1).unwrap(), 1);
    }

    #[test]
    fn test_replay_pacing_reproduces_small_delays() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut partitions = BTreeMap::new();
        partitions.insert(0, records(&[(0, b"a"), (30, b"b")]));

        let source = ReplaySource::new("paced", partitions);
        let started = std::time::Instant::now();
        let mut handle = SourceHandle::spawn(source, broker).unwrap();
        handle.wait().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pacing_tracker_resets_across_partitions() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut partitions = BTreeMap::new();
        // Partition 1 starts far earlier than partition 0 ends; without
        // the reset the negative delta math would be fed a stale previous
        // timestamp from the other partition.
        partitions.insert(0, records(&[(10_000, b"a")]));
        partitions.insert(1, records(&[(0, b"x"), (10, b"y")]));

        let source = ReplaySource::new("multi", partitions);
        let started = std::time::Instant::now();
        let mut handle = SourceHandle::spawn(source, broker).unwrap();
        handle.wait().unwrap();
        // Only the 10ms intra-partition delta should have been slept.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_generator_source_stops_on_none() {
        let broker = Arc::new(InMemoryBroker::new());
        let source = GeneratorSource::new("gen", Duration::ZERO, |n| {
            (n < 5).then(|| Record::new(b"k".to_vec(), vec![n as u8], n as i64))
        });
        let mut handle = SourceHandle::spawn(source, broker.clone()).unwrap();
        handle.wait().unwrap();
        assert_eq!(broker.high_watermark("gen", 0).unwrap(), 5);
    }

    #[test]
    fn test_cooperative_stop_interrupts_generator() {
        let broker = Arc::new(InMemoryBroker::new());
        let source = GeneratorSource::new("endless", Duration::from_millis(1), |n| {
            Some(Record::new(b"k".to_vec(), vec![(n % 250) as u8], n as i64))
        });
        let mut handle = SourceHandle::spawn(source, broker.clone()).unwrap();
        thread::sleep(Duration::from_millis(20));
        handle.stop().unwrap();
        let after_stop = broker.high_watermark("endless", 0).unwrap();
        thread::sleep(Duration::from_millis(20));
        // No further emission once stopped.
        assert_eq!(broker.high_watermark("endless", 0).unwrap(), after_stop);
    }
}
