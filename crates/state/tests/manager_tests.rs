//! Manager lifecycle tests: registration, assignment fan-out, revocation
//! guards, and state directory isolation.

use anyhow::Result;
use rivulet_broker::InMemoryBroker;
use rivulet_core::StateError;
use rivulet_state::{
    RecoveryManager, StateStoreManager, StateStoreManagerConfig, StoreBackendKind,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn durable_manager(state_dir: &Path, group_id: &str) -> StateStoreManager {
    StateStoreManager::new(
        StateStoreManagerConfig {
            group_id: Some(group_id.to_string()),
            state_dir: Some(state_dir.to_path_buf()),
            default_backend: Some(StoreBackendKind::Durable),
        },
        None,
        None,
    )
}

fn changelog_manager(state_dir: &Path, group_id: &str) -> (Arc<InMemoryBroker>, StateStoreManager) {
    let broker = Arc::new(InMemoryBroker::new());
    let recovery = Arc::new(RecoveryManager::new(group_id, broker.clone()));
    let manager = StateStoreManager::new(
        StateStoreManagerConfig {
            group_id: Some(group_id.to_string()),
            state_dir: Some(state_dir.to_path_buf()),
            default_backend: Some(StoreBackendKind::Durable),
        },
        Some(broker.clone()),
        Some(recovery),
    );
    (broker, manager)
}

#[test]
fn test_registration_is_idempotent_and_guarded() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = durable_manager(dir.path(), "g");
    manager.init()?;

    manager.register_store(Some("t"), "s", None, None)?;
    manager.register_store(Some("t"), "s", None, None)?;
    assert_eq!(manager.store_names(Some("t")), vec!["s"]);

    // A windowed store may not shadow an existing store name on the topic.
    let err = manager.register_windowed_store("t", "s", 0).unwrap_err();
    assert!(matches!(
        err,
        StateError::WindowedStoreAlreadyRegistered { .. }
    ));
    Ok(())
}

#[test]
fn test_windowed_then_plain_conflict() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = durable_manager(dir.path(), "g");
    manager.init()?;

    manager.register_windowed_store("t", "w", 0)?;
    let err = manager
        .register_store(Some("t"), "w", None, None)
        .unwrap_err();
    assert!(err.is_config());
    Ok(())
}

#[test]
fn test_assignment_fans_out_to_every_registered_store() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = durable_manager(dir.path(), "g");
    manager.init()?;

    manager.register_store(Some("t"), "aggregates", None, None)?;
    manager.register_store(Some("t"), "lookups", None, None)?;
    manager.register_windowed_store("t", "hourly", 0)?;

    let assigned = manager.on_partition_assign(Some("t"), 2, &HashMap::new())?;
    let mut names: Vec<&String> = assigned.keys().collect();
    names.sort();
    assert_eq!(names, vec!["aggregates", "hourly", "lookups"]);
    for partition in assigned.values() {
        assert_eq!(partition.partition(), 2);
    }

    // A second assign returns the same partition instances.
    let again = manager.on_partition_assign(Some("t"), 2, &HashMap::new())?;
    assert!(Arc::ptr_eq(&assigned["aggregates"], &again["aggregates"]));
    Ok(())
}

#[test]
fn test_revoke_mid_transaction_rolls_back_cleanly() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = durable_manager(dir.path(), "g");
    manager.init()?;
    manager.register_store(Some("t"), "s", None, None)?;

    let assigned = manager.on_partition_assign(Some("t"), 0, &HashMap::new())?;
    let partition = assigned["s"].clone();

    let mut tx = partition.begin()?;
    tx.put(b"k".to_vec(), b"1".to_vec())?;

    // Revocation refuses while the transaction is open.
    let err = manager.on_partition_revoke(Some("t"), 0).unwrap_err();
    assert!(matches!(err, StateError::PartitionStoreIsUsed { .. }));

    // Roll back and revoke; a later reassignment observes no write.
    tx.rollback()?;
    drop(tx);
    drop(partition);
    manager.on_partition_revoke(Some("t"), 0)?;

    let assigned = manager.on_partition_assign(Some("t"), 0, &HashMap::new())?;
    assert_eq!(assigned["s"].get(b"k"), None);
    Ok(())
}

#[test]
fn test_clear_stores_guard_and_removal() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = durable_manager(dir.path(), "g");
    manager.init()?;
    manager.register_store(Some("t"), "s", None, None)?;
    manager.on_partition_assign(Some("t"), 0, &HashMap::new())?;

    let err = manager.clear_stores().unwrap_err();
    assert!(matches!(err, StateError::PartitionStoreIsUsed { .. }));

    manager.on_partition_revoke(Some("t"), 0)?;
    manager.clear_stores()?;
    assert!(!dir.path().join("g").exists());
    Ok(())
}

#[test]
fn test_group_ids_isolate_state_dirs() -> Result<()> {
    let dir = TempDir::new()?;

    let manager_a = durable_manager(dir.path(), "group-a");
    let manager_b = durable_manager(dir.path(), "group-b");
    manager_a.init()?;
    manager_b.init()?;
    manager_a.register_store(Some("t"), "s", None, None)?;
    manager_b.register_store(Some("t"), "s", None, None)?;

    // Write through group A.
    let assigned = manager_a.on_partition_assign(Some("t"), 0, &HashMap::new())?;
    let mut tx = assigned["s"].begin()?;
    tx.put(b"k".to_vec(), b"a-data".to_vec())?;
    tx.commit(0)?;
    drop(assigned);
    manager_a.on_partition_revoke(Some("t"), 0)?;

    // Clearing group B leaves group A's state intact.
    manager_b.clear_stores()?;
    assert!(dir.path().join("group-a").exists());
    assert!(!dir.path().join("group-b").exists());

    let assigned = manager_a.on_partition_assign(Some("t"), 0, &HashMap::new())?;
    assert_eq!(assigned["s"].get(b"k"), Some(b"a-data".to_vec()));
    Ok(())
}

#[test]
fn test_init_rejects_non_directory_path() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("g"), b"not a directory")?;
    let manager = durable_manager(dir.path(), "g");
    let err = manager.init().unwrap_err();
    assert!(err.is_config());
    Ok(())
}

#[test]
fn test_changelog_setup_on_registration() -> Result<()> {
    let dir = TempDir::new()?;
    let (broker, manager) = changelog_manager(dir.path(), "g");
    manager.init()?;
    assert!(manager.using_changelogs());

    manager.register_store(
        Some("t"),
        "s",
        None,
        Some(&rivulet_core::TopicConfig::with_partitions(3)),
    )?;

    let changelog = rivulet_core::changelog_topic_name("g", "s", Some("t"));
    assert_eq!(broker.partition_count(&changelog), Some(3));
    assert_eq!(
        broker.topic_config(&changelog).unwrap().cleanup_policy,
        rivulet_core::CleanupPolicy::Compact
    );
    Ok(())
}

#[test]
fn test_close_revokes_all_stores() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = durable_manager(dir.path(), "g");
    manager.init()?;
    manager.register_store(Some("t"), "s1", None, None)?;
    manager.register_store(Some("u"), "s2", None, None)?;
    manager.on_partition_assign(Some("t"), 0, &HashMap::new())?;
    manager.on_partition_assign(Some("u"), 0, &HashMap::new())?;

    manager.close()?;
    assert!(manager.get_store(Some("t"), "s1")?.partitions().is_empty());
    assert!(manager.get_store(Some("u"), "s2")?.partitions().is_empty());
    Ok(())
}
