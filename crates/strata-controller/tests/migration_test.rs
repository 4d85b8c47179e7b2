//! Cross-cluster store migration, end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use strata_controller::{ControllerError, MigrationMonitor, UpdateStoreParams};
use strata_core::VersionStatus;

const KEY_SCHEMA: &str = "\"long\"";
const VALUE_SCHEMA: &str =
    r#"{"type":"record","name":"Metric","fields":[{"name":"value","type":"double"}]}"#;

#[tokio::test]
async fn migration_flips_discovery_once_destination_catches_up() {
    let h = common::controller(&["clusterA", "clusterB"]).await;
    let engine = &h.engine;

    engine
        .create_store("clusterA", "m", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    engine
        .add_value_schema(
            "clusterA",
            "m",
            r#"{"type":"record","name":"Metric","fields":[
                {"name":"value","type":"double"},
                {"name":"unit","type":"string","default":""}]}"#,
        )
        .await
        .unwrap();
    common::push(&h, "clusterA", "m", "p-a1").await;

    engine.migrate_store("clusterA", "clusterB", "m").await.unwrap();

    // The clone matches the source: same schemas under the same ids, fresh
    // version numbering, migrating on both sides.
    let src = engine.get_store("clusterA", "m").await.unwrap().unwrap();
    let dest = engine.get_store("clusterB", "m").await.unwrap().unwrap();
    assert!(src.migrating);
    assert!(dest.migrating);
    assert_eq!(dest.largest_used_version_number, 0);
    assert!(dest.versions.is_empty());
    let src_schemas = engine.get_value_schemas("clusterA", "m").await.unwrap();
    let dest_schemas = engine.get_value_schemas("clusterB", "m").await.unwrap();
    assert_eq!(src_schemas, dest_schemas);

    // Discovery still points at the source.
    let (cluster, _) = engine.discover_cluster("m").await.unwrap();
    assert_eq!(cluster, "clusterA");

    let monitor = Arc::new(
        MigrationMonitor::new(Arc::clone(&h.engine)).with_interval(Duration::from_millis(50)),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = monitor.start(shutdown_rx);

    // Nothing flips while the destination has no online version.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (cluster, _) = engine.discover_cluster("m").await.unwrap();
    assert_eq!(cluster, "clusterA");

    // A successful push on the destination completes the migration.
    let v = common::push(&h, "clusterB", "m", "p-b1").await;
    assert_eq!(v.number, 1);

    let mut flipped = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (cluster, _) = engine.discover_cluster("m").await.unwrap();
        if cluster == "clusterB" {
            flipped = true;
            break;
        }
    }
    assert!(flipped, "discovery should flip to the destination");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn migration_rejects_same_cluster_and_existing_destination() {
    let h = common::controller(&["clusterA", "clusterB"]).await;
    let engine = &h.engine;

    engine
        .create_store("clusterA", "m", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();

    let err = engine.migrate_store("clusterA", "clusterA", "m").await.unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));

    engine.migrate_store("clusterA", "clusterB", "m").await.unwrap();
    let err = engine.migrate_store("clusterA", "clusterB", "m").await.unwrap_err();
    assert!(matches!(err, ControllerError::StoreAlreadyExists(_)));
}

#[tokio::test]
async fn migrating_store_rejects_general_updates() {
    let h = common::controller(&["clusterA", "clusterB"]).await;
    let engine = &h.engine;

    engine
        .create_store("clusterA", "m", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    engine.migrate_store("clusterA", "clusterB", "m").await.unwrap();

    let err = engine
        .update_store(
            "clusterA",
            "m",
            UpdateStoreParams {
                owner: Some("other".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));

    // Readability and writeability stay controllable during migration.
    engine
        .update_store(
            "clusterA",
            "m",
            UpdateStoreParams {
                readability: Some(false),
                writeability: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn deleting_migrated_source_keeps_discovery_row() {
    let h = common::controller(&["clusterA", "clusterB"]).await;
    let engine = &h.engine;

    engine
        .create_store("clusterA", "m", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    common::push(&h, "clusterA", "m", "p-a1").await;
    engine.migrate_store("clusterA", "clusterB", "m").await.unwrap();

    // Destination catches up and discovery flips.
    common::push(&h, "clusterB", "m", "p-b1").await;
    let dest = engine.get_store("clusterB", "m").await.unwrap().unwrap();
    assert_eq!(dest.version_status(1), VersionStatus::Online);
    engine.update_cluster_discovery("m", "clusterA", "clusterB").await.unwrap();

    // Deleting the source store must not tear down the discovery row the
    // destination is serving from.
    engine
        .update_store(
            "clusterA",
            "m",
            UpdateStoreParams {
                readability: Some(false),
                writeability: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    engine
        .delete_store("clusterA", "m", strata_core::Store::IGNORE_VERSION)
        .await
        .unwrap();

    assert!(!engine.has_store("clusterA", "m").await.unwrap());
    let (cluster, _) = engine.discover_cluster("m").await.unwrap();
    assert_eq!(cluster, "clusterB");
    assert!(engine.has_store("clusterB", "m").await.unwrap());
}
