//! Rivulet runtime: dataflow, executor, and sources.
//!
//! A pipeline is a source (or broker topic), a declarative chain of
//! transformations over JSON values, and optional sinks back to the log:
//!
//! - `dataflow`: the declarative chain (map/filter, keyed folds, windowed
//!   aggregates, output topics)
//! - `windows`: bucket derivation and aggregate state for tumbling,
//!   hopping, and sliding windows
//! - `executor`: the per-partition processing loop tying records, store
//!   transactions, changelog acks, output records, and consumer offsets
//!   together in commit order
//! - `source`: pluggable record producers feeding the pipeline, with
//!   cooperative shutdown and optional timestamp-preserving replay

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dataflow;
pub mod executor;
pub mod source;
pub mod windows;

pub use dataflow::{Dataflow, RecordMeta};
pub use executor::{PipelineRunner, RunnerRebalanceListener};
pub use source::{GeneratorSource, ReplaySource, Source, SourceContext, SourceHandle};
pub use windows::{AggKind, EmitMode, WindowAggregate, WindowDef, WindowKind};
