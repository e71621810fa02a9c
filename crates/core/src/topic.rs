//! Topic identities and configuration
//!
//! Changelog topics are named deterministically from the consumer group,
//! the source topic, and the store name, so that every instance of a
//! deployment derives the same name without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(topic, partition)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a topic/partition pair
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        TopicPartition {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Log cleanup policy for a topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupPolicy {
    /// Segments are deleted by retention
    #[default]
    Delete,
    /// The log is compacted down to the latest value per key
    Compact,
}

/// Topic creation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Number of partitions
    pub num_partitions: i32,
    /// Replication factor (informational for the in-process broker)
    pub replication_factor: i32,
    /// Cleanup policy
    pub cleanup_policy: CleanupPolicy,
}

impl Default for TopicConfig {
    fn default() -> Self {
        TopicConfig {
            num_partitions: 1,
            replication_factor: 1,
            cleanup_policy: CleanupPolicy::Delete,
        }
    }
}

impl TopicConfig {
    /// Config with a partition count and defaults otherwise
    pub fn with_partitions(num_partitions: i32) -> Self {
        TopicConfig {
            num_partitions,
            ..Default::default()
        }
    }

    /// Changelog config mirroring a source topic: same partition count,
    /// compacted
    pub fn changelog_for(source: &TopicConfig) -> Self {
        TopicConfig {
            num_partitions: source.num_partitions,
            replication_factor: source.replication_factor,
            cleanup_policy: CleanupPolicy::Compact,
        }
    }
}

/// Deterministic changelog topic name for `(group_id, store_name, source_topic)`
///
/// A `None` source topic denotes a global store and uses the literal
/// `global` in place of the topic name.
pub fn changelog_topic_name(
    group_id: &str,
    store_name: &str,
    source_topic: Option<&str>,
) -> String {
    format!(
        "changelog__{}--{}--{}",
        group_id,
        source_topic.unwrap_or("global"),
        store_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("events", 3);
        assert_eq!(tp.to_string(), "events[3]");
    }

    #[test]
    fn test_changelog_name_deterministic() {
        let a = changelog_topic_name("alerter", "default", Some("temps"));
        let b = changelog_topic_name("alerter", "default", Some("temps"));
        assert_eq!(a, b);
        assert_eq!(a, "changelog__alerter--temps--default");
    }

    #[test]
    fn test_changelog_name_global_store() {
        let name = changelog_topic_name("g", "lookup", None);
        assert_eq!(name, "changelog__g--global--lookup");
    }

    #[test]
    fn test_changelog_name_distinguishes_stores() {
        let a = changelog_topic_name("g", "s1", Some("t"));
        let b = changelog_topic_name("g", "s2", Some("t"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_changelog_config_mirrors_source() {
        let source = TopicConfig::with_partitions(6);
        let changelog = TopicConfig::changelog_for(&source);
        assert_eq!(changelog.num_partitions, 6);
        assert_eq!(changelog.cleanup_policy, CleanupPolicy::Compact);
    }
}
