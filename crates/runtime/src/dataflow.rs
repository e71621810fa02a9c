//! Declarative dataflow.
//!
//! A [`Dataflow`] is a chain of transformations over JSON record values,
//! built fluently and interpreted by the executor:
//!
//! ```ignore
//! let flow = Dataflow::from_topic("temperatures")
//!     .apply(|v| v["Temperature_C"].clone())
//!     .hopping_window(5000, 1000)?
//!     .mean()
//!     .current()
//!     .filter_with_metadata(|v, meta| should_alert(v, meta))
//!     .to_topic("temperature_alerts");
//! ```
//!
//! Stateless steps never touch stores. Keyed folds read and write a named
//! plain store; windowed aggregates read and write a windowed store whose
//! name is derived from the window parameters. Window parameters are
//! validated when the window step is built.

use crate::windows::{AggKind, EmitMode, WindowDef};
use rivulet_core::{Headers, Result};
use rivulet_state::StateStoreManager;
use serde_json::Value;

/// Metadata of the input record, for metadata-aware steps.
#[derive(Debug, Clone)]
pub struct RecordMeta {
    /// Record key
    pub key: Option<Vec<u8>>,
    /// Record timestamp in milliseconds
    pub timestamp_ms: i64,
    /// Record headers
    pub headers: Headers,
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Source offset
    pub offset: i64,
}

type ApplyFn = Box<dyn Fn(Value) -> Value + Send + Sync>;
type ApplyMetaFn = Box<dyn Fn(Value, &RecordMeta) -> Value + Send + Sync>;
type FilterFn = Box<dyn Fn(&Value) -> bool + Send + Sync>;
type FilterMetaFn = Box<dyn Fn(&Value, &RecordMeta) -> bool + Send + Sync>;
type FoldFn = Box<dyn Fn(Value, Value) -> Value + Send + Sync>;

pub(crate) enum Op {
    Apply(ApplyFn),
    ApplyWithMeta(ApplyMetaFn),
    Filter(FilterFn),
    FilterWithMeta(FilterMetaFn),
    Fold {
        store: String,
        init: Value,
        fold: FoldFn,
    },
    WindowedAgg {
        store: String,
        def: WindowDef,
        agg: AggKind,
        emit: EmitMode,
    },
    ToTopic(String),
}

/// Declarative chain of transformations over one source topic.
pub struct Dataflow {
    topic: String,
    ops: Vec<Op>,
}

impl Dataflow {
    /// Start a dataflow consuming `topic`.
    pub fn from_topic(topic: impl Into<String>) -> Self {
        Dataflow {
            topic: topic.into(),
            ops: Vec::new(),
        }
    }

    /// Source topic of the chain.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Stateless map over the record value.
    pub fn apply<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.ops.push(Op::Apply(Box::new(f)));
        self
    }

    /// Stateless map with access to record metadata.
    pub fn apply_with_metadata<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &RecordMeta) -> Value + Send + Sync + 'static,
    {
        self.ops.push(Op::ApplyWithMeta(Box::new(f)));
        self
    }

    /// Drop values for which `f` returns `false`.
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.ops.push(Op::Filter(Box::new(f)));
        self
    }

    /// Filter with access to record metadata.
    pub fn filter_with_metadata<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &RecordMeta) -> bool + Send + Sync + 'static,
    {
        self.ops.push(Op::FilterWithMeta(Box::new(f)));
        self
    }

    /// Keyed aggregate over a named store.
    ///
    /// For each record, the stored state for the record key (or `init`) is
    /// folded with the incoming value; the result is written back and
    /// becomes the value flowing downstream.
    pub fn fold<F>(mut self, store: impl Into<String>, init: Value, f: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        self.ops.push(Op::Fold {
            store: store.into(),
            init,
            fold: Box::new(f),
        });
        self
    }

    /// Tumbling window of `duration_ms`.
    pub fn tumbling_window(self, duration_ms: i64) -> Result<WindowBuilder> {
        Ok(WindowBuilder {
            flow: self,
            def: WindowDef::tumbling(duration_ms)?,
        })
    }

    /// Hopping window of `duration_ms`, advancing every `step_ms`.
    pub fn hopping_window(self, duration_ms: i64, step_ms: i64) -> Result<WindowBuilder> {
        Ok(WindowBuilder {
            flow: self,
            def: WindowDef::hopping(duration_ms, step_ms)?,
        })
    }

    /// Sliding window of `duration_ms` per event.
    pub fn sliding_window(self, duration_ms: i64) -> Result<WindowBuilder> {
        Ok(WindowBuilder {
            flow: self,
            def: WindowDef::sliding(duration_ms)?,
        })
    }

    /// Produce values to an output topic.
    pub fn to_topic(mut self, topic: impl Into<String>) -> Self {
        self.ops.push(Op::ToTopic(topic.into()));
        self
    }

    /// Output topics named by the chain.
    pub fn output_topics(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::ToTopic(topic) => Some(topic.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Register every store the chain touches with the manager.
    ///
    /// Fold stores register as plain stores; window steps register
    /// windowed stores carrying their grace period. Idempotent, like the
    /// underlying registrations.
    pub fn register_stores(&self, manager: &StateStoreManager) -> Result<()> {
        for op in &self.ops {
            match op {
                Op::Fold { store, .. } => {
                    manager.register_store(Some(&self.topic), store, None, None)?;
                }
                Op::WindowedAgg { store, def, .. } => {
                    manager.register_windowed_store(&self.topic, store, def.grace_ms)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// A window step waiting for its aggregation.
pub struct WindowBuilder {
    flow: Dataflow,
    def: WindowDef,
}

impl WindowBuilder {
    /// Keep windows open `grace_ms` past the watermark.
    pub fn with_grace(mut self, grace_ms: i64) -> Result<Self> {
        self.def = self.def.with_grace(grace_ms)?;
        Ok(self)
    }

    /// Count records per window.
    pub fn count(self) -> WindowEmitBuilder {
        self.agg(AggKind::Count)
    }

    /// Sum numeric values per window.
    pub fn sum(self) -> WindowEmitBuilder {
        self.agg(AggKind::Sum)
    }

    /// Mean of numeric values per window.
    pub fn mean(self) -> WindowEmitBuilder {
        self.agg(AggKind::Mean)
    }

    fn agg(self, agg: AggKind) -> WindowEmitBuilder {
        WindowEmitBuilder {
            flow: self.flow,
            def: self.def,
            agg,
        }
    }
}

/// A windowed aggregation waiting for its emission policy.
pub struct WindowEmitBuilder {
    flow: Dataflow,
    def: WindowDef,
    agg: AggKind,
}

impl WindowEmitBuilder {
    /// Emit the updated aggregate on every record.
    pub fn current(self) -> Dataflow {
        self.emit(EmitMode::Current)
    }

    /// Emit once per window, when it closes past the watermark.
    pub fn final_(self) -> Dataflow {
        self.emit(EmitMode::Final)
    }

    fn emit(mut self, emit: EmitMode) -> Dataflow {
        let store = self.def.store_name(self.agg);
        self.flow.ops.push(Op::WindowedAgg {
            store,
            def: self.def,
            agg: self.agg,
            emit,
        });
        self.flow
    }
}
