//! State store manager.
//!
//! The coordinator between partition lifecycle and registered stores:
//! reacts to rebalance callbacks, fans assignment/revocation out to every
//! store registered under the affected topic, enlists the recovery
//! manager, and owns the on-disk state directory.
//!
//! Directory convention: `<state_dir>/<group_id>/<store_name>/<partition>/`.
//! The group id isolates deployments sharing one state root.
//!
//! The manager owns all process-wide state; there are no hidden
//! singletons. Tests instantiate fresh managers with isolated state dirs.

use crate::changelog::ChangelogProducerFactory;
use crate::recovery::RecoveryManager;
use crate::store::{Store, StoreBackendKind};
use crate::windowed::WindowedStore;
use parking_lot::Mutex;
use rivulet_broker::Producer;
use rivulet_core::{Result, StateError, TopicConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Store name used when the caller does not supply one.
pub const DEFAULT_STATE_STORE_NAME: &str = "default";

/// Construction parameters for [`StateStoreManager`].
#[derive(Debug, Clone, Default)]
pub struct StateStoreManagerConfig {
    /// Consumer group id; appended to `state_dir` when both are set
    pub group_id: Option<String>,
    /// Root directory for durable store state
    pub state_dir: Option<PathBuf>,
    /// Backend used when registration does not name one
    pub default_backend: Option<StoreBackendKind>,
}

enum RegisteredStore {
    Plain(Arc<Store>),
    Windowed(Arc<WindowedStore>),
}

impl RegisteredStore {
    fn has_active_partitions(&self) -> bool {
        match self {
            RegisteredStore::Plain(s) => s.has_active_partitions(),
            RegisteredStore::Windowed(s) => s.store().has_active_partitions(),
        }
    }

    fn assign_partition(&self, partition: i32) -> Result<Arc<crate::StorePartition>> {
        match self {
            RegisteredStore::Plain(s) => s.assign_partition(partition),
            RegisteredStore::Windowed(s) => {
                Ok(s.assign_partition(partition)?.inner().clone())
            }
        }
    }

    fn revoke_partition(&self, partition: i32) -> Result<()> {
        match self {
            RegisteredStore::Plain(s) => s.revoke_partition(partition),
            RegisteredStore::Windowed(s) => s.revoke_partition(partition),
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            RegisteredStore::Plain(s) => s.close(),
            RegisteredStore::Windowed(s) => s.close(),
        }
    }
}

/// Coordinator of all state stores against partition lifecycle.
pub struct StateStoreManager {
    state_dir: Option<PathBuf>,
    default_backend: StoreBackendKind,
    producer: Option<Arc<dyn Producer>>,
    recovery_manager: Option<Arc<RecoveryManager>>,
    stores: Mutex<HashMap<Option<String>, HashMap<String, RegisteredStore>>>,
}

impl StateStoreManager {
    /// Create a manager.
    ///
    /// Changelogs are set up for newly registered stores only when both a
    /// producer and a recovery manager are supplied.
    pub fn new(
        config: StateStoreManagerConfig,
        producer: Option<Arc<dyn Producer>>,
        recovery_manager: Option<Arc<RecoveryManager>>,
    ) -> Self {
        let state_dir = config.state_dir.map(|dir| match &config.group_id {
            Some(group_id) => dir.join(group_id),
            None => dir,
        });
        StateStoreManager {
            state_dir,
            default_backend: config.default_backend.unwrap_or(StoreBackendKind::Durable),
            producer,
            recovery_manager,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Effective state directory (already group-scoped), if configured.
    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    /// Backend used when registration does not name one.
    pub fn default_backend(&self) -> StoreBackendKind {
        self.default_backend
    }

    /// Whether changelog topics are in use.
    pub fn using_changelogs(&self) -> bool {
        self.recovery_manager.is_some() && self.producer.is_some()
    }

    /// Whether a recovery pass is pending.
    pub fn recovery_required(&self) -> bool {
        self.recovery_manager
            .as_ref()
            .map(|rm| rm.has_assignments())
            .unwrap_or(false)
    }

    /// Run pending recovery to completion.
    pub fn do_recovery(&self) -> Result<()> {
        match &self.recovery_manager {
            Some(rm) => rm.do_recovery(),
            None => Err(StateError::MissingRecoveryManager),
        }
    }

    /// Stop a running recovery (shutdown path).
    pub fn stop_recovery(&self) -> Result<()> {
        match &self.recovery_manager {
            Some(rm) => {
                rm.stop_recovery();
                Ok(())
            }
            None => Err(StateError::MissingRecoveryManager),
        }
    }

    fn setup_changelog(
        &self,
        topic: Option<&str>,
        store_name: &str,
        topic_config: Option<&TopicConfig>,
    ) -> Result<Option<ChangelogProducerFactory>> {
        let (Some(rm), Some(producer)) = (&self.recovery_manager, &self.producer) else {
            return Ok(None);
        };
        debug!(store = store_name, ?topic, "registering changelog for store");
        let changelog_name = rm.register_changelog(topic, store_name, topic_config)?;
        Ok(Some(ChangelogProducerFactory::new(
            changelog_name,
            store_name,
            producer.clone(),
        )))
    }

    /// Register a state store.
    ///
    /// Idempotent for identical parameters; re-registration with a
    /// different backend (or over a windowed store) is a configuration
    /// error.
    pub fn register_store(
        &self,
        topic: Option<&str>,
        store_name: &str,
        backend: Option<StoreBackendKind>,
        topic_config: Option<&TopicConfig>,
    ) -> Result<()> {
        let backend = backend.unwrap_or(self.default_backend);
        let mut stores = self.stores.lock();
        let topic_stores = stores.entry(topic.map(String::from)).or_default();

        if let Some(existing) = topic_stores.get(store_name) {
            return match existing {
                RegisteredStore::Plain(store) if store.backend() == backend => Ok(()),
                RegisteredStore::Plain(store) => Err(StateError::invalid_config(format!(
                    "store \"{}\" already registered with backend {:?}",
                    store_name,
                    store.backend()
                ))),
                RegisteredStore::Windowed(_) => Err(StateError::invalid_config(format!(
                    "store \"{}\" already registered as a windowed store",
                    store_name
                ))),
            };
        }

        let factory = self.setup_changelog(topic, store_name, topic_config)?;
        let store = Store::new(
            store_name,
            topic.map(String::from),
            backend,
            self.state_dir.clone(),
            factory,
        )?;
        info!(store = store_name, ?topic, ?backend, "state store registered");
        topic_stores.insert(store_name.to_string(), RegisteredStore::Plain(Arc::new(store)));
        Ok(())
    }

    /// Register a windowed state store.
    ///
    /// Rejects the registration when any store with the same name already
    /// exists on the topic; windowed stores need a unique name.
    pub fn register_windowed_store(
        &self,
        topic: &str,
        store_name: &str,
        grace_ms: i64,
    ) -> Result<()> {
        let mut stores = self.stores.lock();
        let topic_stores = stores.entry(Some(topic.to_string())).or_default();
        if topic_stores.contains_key(store_name) {
            return Err(StateError::windowed_store_already_registered(
                store_name,
                Some(topic),
            ));
        }

        let factory = self.setup_changelog(Some(topic), store_name, None)?;
        let store = WindowedStore::new(
            store_name,
            Some(topic.to_string()),
            self.state_dir.clone(),
            factory,
            grace_ms,
        )?;
        info!(store = store_name, topic, grace_ms, "windowed store registered");
        topic_stores.insert(
            store_name.to_string(),
            RegisteredStore::Windowed(Arc::new(store)),
        );
        Ok(())
    }

    /// Get a registered plain store.
    pub fn get_store(&self, topic: Option<&str>, store_name: &str) -> Result<Arc<Store>> {
        let stores = self.stores.lock();
        match stores
            .get(&topic.map(String::from))
            .and_then(|m| m.get(store_name))
        {
            Some(RegisteredStore::Plain(store)) => Ok(store.clone()),
            _ => Err(StateError::store_not_registered(store_name, topic)),
        }
    }

    /// Get a registered windowed store.
    pub fn get_windowed_store(
        &self,
        topic: &str,
        store_name: &str,
    ) -> Result<Arc<WindowedStore>> {
        let stores = self.stores.lock();
        match stores
            .get(&Some(topic.to_string()))
            .and_then(|m| m.get(store_name))
        {
            Some(RegisteredStore::Windowed(store)) => Ok(store.clone()),
            _ => Err(StateError::store_not_registered(store_name, Some(topic))),
        }
    }

    /// Names of stores registered under a topic.
    pub fn store_names(&self, topic: Option<&str>) -> Vec<String> {
        let stores = self.stores.lock();
        let mut names: Vec<String> = stores
            .get(&topic.map(String::from))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Assign a partition on every store registered under `topic`.
    ///
    /// Returns the assigned store partitions by store name and enlists
    /// the recovery manager when one is configured.
    pub fn on_partition_assign(
        &self,
        topic: Option<&str>,
        partition: i32,
        committed_offsets: &HashMap<String, i64>,
    ) -> Result<HashMap<String, Arc<crate::StorePartition>>> {
        let mut assigned = HashMap::new();
        {
            let stores = self.stores.lock();
            if let Some(topic_stores) = stores.get(&topic.map(String::from)) {
                for (name, store) in topic_stores {
                    assigned.insert(name.clone(), store.assign_partition(partition)?);
                }
            }
        }
        if let Some(rm) = &self.recovery_manager {
            if !assigned.is_empty() {
                rm.assign_partition(topic, partition, committed_offsets, &assigned)?;
            }
        }
        Ok(assigned)
    }

    /// Revoke a partition on every store registered under `topic`.
    ///
    /// Any replay in progress for the partition is abandoned first.
    pub fn on_partition_revoke(&self, topic: Option<&str>, partition: i32) -> Result<()> {
        let stores = self.stores.lock();
        let Some(topic_stores) = stores.get(&topic.map(String::from)) else {
            return Ok(());
        };
        if topic_stores.is_empty() {
            return Ok(());
        }
        if let Some(rm) = &self.recovery_manager {
            rm.revoke_partition(partition);
        }
        for store in topic_stores.values() {
            store.revoke_partition(partition)?;
        }
        Ok(())
    }

    /// Delete all on-disk state.
    ///
    /// Refused while any store has assigned partitions. Removes the
    /// group-scoped state directory only, leaving sibling groups intact.
    pub fn clear_stores(&self) -> Result<()> {
        let stores = self.stores.lock();
        let in_use = stores
            .values()
            .flat_map(|m| m.values())
            .any(|s| s.has_active_partitions());
        if in_use {
            return Err(StateError::partition_store_is_used(
                "cannot clear stores with active partitions assigned",
            ));
        }
        if let Some(dir) = &self.state_dir {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
                info!(dir = %dir.display(), "removed state directory");
            }
        }
        Ok(())
    }

    /// Create the state directory.
    pub fn init(&self) -> Result<()> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        info!(dir = %dir.display(), "initializing state directory");
        if dir.exists() {
            if !dir.is_dir() {
                return Err(StateError::invalid_config(format!(
                    "state path \"{}\" exists but is not a directory",
                    dir.display()
                )));
            }
            debug!(dir = %dir.display(), "state directory already exists");
        } else {
            std::fs::create_dir_all(dir)?;
            debug!(dir = %dir.display(), "created state directory");
        }
        Ok(())
    }

    /// Close every registered store.
    pub fn close(&self) -> Result<()> {
        let stores = self.stores.lock();
        for topic_stores in stores.values() {
            for store in topic_stores.values() {
                store.close()?;
            }
        }
        Ok(())
    }
}
