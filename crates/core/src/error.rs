//! Error types for the Rivulet state subsystem
//!
//! `StateError` is the unified error type surfaced at the state boundary.
//! We use `thiserror` for automatic `Display` and `Error` implementations.
//!
//! ## Error Categories
//!
//! - **Configuration**: unknown store type / format, conflicting
//!   registration. Detected synchronously at registration time.
//! - **Lifecycle**: operating on a store with active partitions, missing
//!   recovery manager, unregistered store lookups.
//! - **Transaction**: offset regression, busy partitions, commit failures.
//!   These roll back the transaction and are fatal to the partition.
//! - **Recovery**: changelog read or deserialization failures. The partition
//!   stays unavailable until resolved.
//! - **Engine**: storage, serialization, corruption, I/O.

use std::io;
use thiserror::Error;

/// Result type alias for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Unified error type for the state subsystem
#[derive(Debug, Error)]
pub enum StateError {
    // =========================================================================
    // Configuration errors
    // =========================================================================
    /// Invalid or conflicting configuration supplied at registration time
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong with the configuration
        message: String,
    },

    // =========================================================================
    // Lifecycle errors
    // =========================================================================
    /// Lookup of a store that was never registered
    #[error("store \"{store_name}\" (topic {topic:?}) is not registered")]
    StoreNotRegistered {
        /// Requested store name
        store_name: String,
        /// Topic the store was looked up under (`None` for global stores)
        topic: Option<String>,
    },

    /// A windowed store was registered over an existing store name
    #[error("store \"{store_name}\" already exists on topic {topic:?}; choose a unique window name")]
    WindowedStoreAlreadyRegistered {
        /// Conflicting store name
        store_name: String,
        /// Topic the conflict occurred on
        topic: Option<String>,
    },

    /// A partition (or the whole store set) is still in active use
    #[error("partition store is used: {reason}")]
    PartitionStoreIsUsed {
        /// Why the operation was refused
        reason: String,
    },

    /// Recovery was requested but no recovery manager is configured
    #[error("a recovery manager is required for this operation")]
    MissingRecoveryManager,

    // =========================================================================
    // Transaction errors
    // =========================================================================
    /// A second transaction was opened on a partition with one in flight
    #[error("store \"{store_name}\" partition {partition} already has an open transaction")]
    BusyTransaction {
        /// Store the partition belongs to
        store_name: String,
        /// Partition number
        partition: i32,
    },

    /// Commit was attempted with an offset older than the stored one
    #[error("offset regression: stored processed offset {stored}, got {requested}")]
    OffsetRegression {
        /// Offset currently persisted for the partition
        stored: i64,
        /// Offset the commit attempted to write
        requested: i64,
    },

    /// A state transaction failed; the partition must be re-assigned
    #[error("state transaction failed: {reason}")]
    StateTransactionError {
        /// What failed during the transaction
        reason: String,
    },

    /// Operation on a transaction that already completed
    #[error("transaction is no longer active (already {state})")]
    InvalidStoreTransactionState {
        /// Terminal state the transaction is in
        state: String,
    },

    // =========================================================================
    // Recovery errors
    // =========================================================================
    /// Changelog replay failed; no partial state is exposed
    #[error("recovery failed: {reason}")]
    RecoveryFailed {
        /// What went wrong during replay
        reason: String,
    },

    // =========================================================================
    // Engine errors
    // =========================================================================
    /// Low-level storage failure
    #[error("storage error: {message}")]
    Storage {
        /// Error message
        message: String,
    },

    /// Failed to serialize or deserialize data
    #[error("serialization error: {message}")]
    Serialization {
        /// What went wrong
        message: String,
    },

    /// Data integrity check failed
    #[error("corruption detected: {message}")]
    Corruption {
        /// Description of the corruption
        message: String,
    },

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StateError {
    /// Create an `InvalidConfig` error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        StateError::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a `StoreNotRegistered` error
    pub fn store_not_registered(store_name: impl Into<String>, topic: Option<&str>) -> Self {
        StateError::StoreNotRegistered {
            store_name: store_name.into(),
            topic: topic.map(String::from),
        }
    }

    /// Create a `WindowedStoreAlreadyRegistered` error
    pub fn windowed_store_already_registered(
        store_name: impl Into<String>,
        topic: Option<&str>,
    ) -> Self {
        StateError::WindowedStoreAlreadyRegistered {
            store_name: store_name.into(),
            topic: topic.map(String::from),
        }
    }

    /// Create a `PartitionStoreIsUsed` error
    pub fn partition_store_is_used(reason: impl Into<String>) -> Self {
        StateError::PartitionStoreIsUsed {
            reason: reason.into(),
        }
    }

    /// Create an `OffsetRegression` error
    pub fn offset_regression(stored: i64, requested: i64) -> Self {
        StateError::OffsetRegression { stored, requested }
    }

    /// Create a `StateTransactionError`
    pub fn state_transaction(reason: impl Into<String>) -> Self {
        StateError::StateTransactionError {
            reason: reason.into(),
        }
    }

    /// Create an `InvalidStoreTransactionState` error
    pub fn invalid_transaction_state(state: impl Into<String>) -> Self {
        StateError::InvalidStoreTransactionState {
            state: state.into(),
        }
    }

    /// Create a `RecoveryFailed` error
    pub fn recovery_failed(reason: impl Into<String>) -> Self {
        StateError::RecoveryFailed {
            reason: reason.into(),
        }
    }

    /// Create a `Storage` error
    pub fn storage(message: impl Into<String>) -> Self {
        StateError::Storage {
            message: message.into(),
        }
    }

    /// Create a `Serialization` error
    pub fn serialization(message: impl Into<String>) -> Self {
        StateError::Serialization {
            message: message.into(),
        }
    }

    /// Create a `Corruption` error
    pub fn corruption(message: impl Into<String>) -> Self {
        StateError::Corruption {
            message: message.into(),
        }
    }

    /// Whether this error was produced by configuration validation
    pub fn is_config(&self) -> bool {
        matches!(self, StateError::InvalidConfig { .. })
    }

    /// Whether this error is a lifecycle violation (wrong call, wrong time)
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            StateError::StoreNotRegistered { .. }
                | StateError::WindowedStoreAlreadyRegistered { .. }
                | StateError::PartitionStoreIsUsed { .. }
                | StateError::MissingRecoveryManager
        )
    }

    /// Whether this error is fatal to the partition it occurred on
    ///
    /// Fatal errors roll back the current transaction and unassign the
    /// partition so the broker can hand it to a peer that will recover
    /// from the changelog.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StateError::StateTransactionError { .. }
                | StateError::RecoveryFailed { .. }
                | StateError::Storage { .. }
                | StateError::Corruption { .. }
                | StateError::Io(_)
        )
    }
}

impl From<bincode::Error> for StateError {
    fn from(e: bincode::Error) -> Self {
        StateError::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization {
            message: format!("JSON error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_offset_regression() {
        let err = StateError::offset_regression(10, 4);
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn test_display_store_not_registered() {
        let err = StateError::store_not_registered("default", Some("events"));
        assert!(err.to_string().contains("default"));
        assert!(err.to_string().contains("events"));
    }

    #[test]
    fn test_classification() {
        assert!(StateError::invalid_config("bad store type").is_config());
        assert!(StateError::store_not_registered("s", None).is_lifecycle());
        assert!(StateError::partition_store_is_used("active partitions").is_lifecycle());
        assert!(StateError::MissingRecoveryManager.is_lifecycle());
        assert!(StateError::state_transaction("changelog produce failed").is_fatal());
        assert!(StateError::recovery_failed("bad record").is_fatal());
        assert!(StateError::corruption("crc mismatch").is_fatal());

        assert!(!StateError::offset_regression(5, 1).is_fatal());
        assert!(!StateError::invalid_config("x").is_lifecycle());
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing wal");
        let err: StateError = io_err.into();
        assert!(matches!(err, StateError::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_bincode() {
        let invalid = vec![0xFFu8; 3];
        let result: std::result::Result<String, bincode::Error> = bincode::deserialize(&invalid);
        let err: StateError = result.unwrap_err().into();
        assert!(matches!(err, StateError::Serialization { .. }));
    }

    #[test]
    fn test_invalid_transaction_state_message() {
        let err = StateError::invalid_transaction_state("committed");
        assert!(err.to_string().contains("already committed"));
    }
}
