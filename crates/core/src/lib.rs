//! Core types for Rivulet
//!
//! This crate defines the vocabulary shared by every layer of the runtime:
//! - Records and headers as they cross the broker boundary
//! - Topic/partition identities and topic configuration
//! - The unified error type surfaced by the state subsystem
//! - Value codecs (enumerated formats, rejected at construction when unknown)
//!
//! Nothing in this crate touches disk or the broker; it is pure data.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod record;
pub mod topic;

pub use codec::{Codec, CodecKind, JsonCodec, MsgpackCodec};
pub use error::{Result, StateError};
pub use record::{Headers, PolledRecord, Record};
pub use topic::{changelog_topic_name, CleanupPolicy, TopicConfig, TopicPartition};
