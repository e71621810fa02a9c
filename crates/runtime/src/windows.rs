//! Window definitions, bucket derivation, and aggregate state.
//!
//! The windowed store holds whatever buckets the executor writes; this
//! module decides what those buckets are. A record's timestamp maps to:
//!
//! - **tumbling** (`step == duration`): exactly one bucket
//! - **hopping** (`step < duration`): every window containing the
//!   timestamp, one per step
//! - **sliding**: a per-event window `[ts - duration, ts]`
//!
//! Aggregates are folded counts/sums; the mean is derived at emission.

use rivulet_core::{Result, StateError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Window shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Back-to-back fixed buckets (`step == duration`)
    Tumbling,
    /// Overlapping fixed buckets (`step < duration`)
    Hopping,
    /// Per-event trailing window
    Sliding,
}

impl WindowKind {
    fn name(&self) -> &'static str {
        match self {
            WindowKind::Tumbling => "tumbling",
            WindowKind::Hopping => "hopping",
            WindowKind::Sliding => "sliding",
        }
    }
}

/// Emission policy for windowed aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// Emit the updated aggregate on every record
    Current,
    /// Emit once, when the window closes past the watermark
    Final,
}

/// Aggregation applied inside each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    /// Number of records
    Count,
    /// Sum of numeric values
    Sum,
    /// Arithmetic mean of numeric values
    Mean,
}

impl AggKind {
    fn name(&self) -> &'static str {
        match self {
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Mean => "mean",
        }
    }
}

/// Static window metadata for one windowed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDef {
    /// Window shape
    pub kind: WindowKind,
    /// Window length in milliseconds
    pub duration_ms: i64,
    /// Hop between window starts in milliseconds
    pub step_ms: i64,
    /// Extra time windows stay open past the watermark
    pub grace_ms: i64,
}

impl WindowDef {
    /// Tumbling window: one bucket per `duration_ms`.
    pub fn tumbling(duration_ms: i64) -> Result<Self> {
        WindowDef {
            kind: WindowKind::Tumbling,
            duration_ms,
            step_ms: duration_ms,
            grace_ms: 0,
        }
        .validated()
    }

    /// Hopping window: `duration_ms` long, advancing every `step_ms`.
    pub fn hopping(duration_ms: i64, step_ms: i64) -> Result<Self> {
        WindowDef {
            kind: WindowKind::Hopping,
            duration_ms,
            step_ms,
            grace_ms: 0,
        }
        .validated()
    }

    /// Sliding window: `[ts - duration_ms, ts]` per event.
    pub fn sliding(duration_ms: i64) -> Result<Self> {
        WindowDef {
            kind: WindowKind::Sliding,
            duration_ms,
            step_ms: duration_ms,
            grace_ms: 0,
        }
        .validated()
    }

    /// Keep windows open `grace_ms` past the watermark.
    pub fn with_grace(mut self, grace_ms: i64) -> Result<Self> {
        self.grace_ms = grace_ms;
        self.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.duration_ms <= 0 {
            return Err(StateError::invalid_config(
                "window duration must be positive",
            ));
        }
        if self.step_ms <= 0 {
            return Err(StateError::invalid_config("window step must be positive"));
        }
        if self.step_ms > self.duration_ms {
            return Err(StateError::invalid_config(
                "window step must not exceed duration",
            ));
        }
        if self.kind == WindowKind::Tumbling && self.step_ms != self.duration_ms {
            return Err(StateError::invalid_config(
                "tumbling windows require step == duration",
            ));
        }
        if self.grace_ms < 0 {
            return Err(StateError::invalid_config("grace must not be negative"));
        }
        Ok(self)
    }

    /// Buckets a record timestamp falls into, ascending by start.
    pub fn bounds(&self, timestamp_ms: i64) -> Vec<(i64, i64)> {
        match self.kind {
            WindowKind::Tumbling => {
                let start = timestamp_ms.div_euclid(self.duration_ms) * self.duration_ms;
                vec![(start, start + self.duration_ms)]
            }
            WindowKind::Hopping => {
                let mut out = Vec::new();
                let mut start = timestamp_ms.div_euclid(self.step_ms) * self.step_ms;
                while start > timestamp_ms - self.duration_ms {
                    out.push((start, start + self.duration_ms));
                    start -= self.step_ms;
                }
                out.reverse();
                out
            }
            WindowKind::Sliding => {
                vec![(timestamp_ms - self.duration_ms, timestamp_ms)]
            }
        }
    }

    /// Deterministic store name for this window and aggregation.
    pub fn store_name(&self, agg: AggKind) -> String {
        format!(
            "{}_window_{}_{}_{}",
            self.kind.name(),
            self.duration_ms,
            self.step_ms,
            agg.name()
        )
    }
}

/// Folded per-window state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    /// Records folded into the window
    pub count: u64,
    /// Sum of folded numeric values
    pub sum: f64,
}

impl WindowAggregate {
    /// Fold one value into the aggregate.
    pub fn fold(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
    }

    /// Final value under an aggregation kind.
    pub fn result(&self, agg: AggKind) -> Value {
        match agg {
            AggKind::Count => json!(self.count),
            AggKind::Sum => json!(self.sum),
            AggKind::Mean => {
                if self.count == 0 {
                    Value::Null
                } else {
                    json!(self.sum / self.count as f64)
                }
            }
        }
    }
}

/// The record emitted for a window: `{"start", "end", "value"}`.
pub fn window_result(start_ms: i64, end_ms: i64, value: Value) -> Value {
    json!({ "start": start_ms, "end": end_ms, "value": value })
}
