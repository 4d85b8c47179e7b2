//! End-to-end lifecycle coverage against in-memory backends.

mod common;

use strata_cluster::ResourceCoordinator;
use strata_controller::{ControllerError, UpdateStoreParams};
use strata_core::{topics, Store, VersionStatus};
use strata_topics::TopicManager;

const KEY_SCHEMA: &str = "\"long\"";
const VALUE_SCHEMA: &str = "\"string\"";

#[tokio::test]
async fn happy_push_with_idempotent_increment() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();

    let v1 = engine
        .increment_version_idempotent("cluster1", "orders", "p-1", 4, 3, true, false, true)
        .await
        .unwrap();
    assert_eq!(v1.number, 1);
    assert_eq!(v1.status, VersionStatus::Started);

    // The version topic and coordinator resource exist with the push framing.
    assert!(h.topics.contains_topic("orders_v1").await.unwrap());
    assert!(h.coordinator.has_resource("cluster1", "orders_v1").await.unwrap());

    // End of push moves the version to Pushed; it is not serving yet.
    engine.on_push_job_completed("cluster1", "orders", 1).await.unwrap();
    let store = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    assert_eq!(store.version_status(1), VersionStatus::Pushed);
    assert_eq!(store.current_version, Store::NON_EXISTING_VERSION);
    assert_eq!(
        h.topics.writer().message_kinds("orders_v1").await.unwrap(),
        vec!["START_OF_PUSH", "END_OF_PUSH"]
    );

    // Going online requires the replicas to have reported in.
    let err = engine.on_push_completed("cluster1", "orders", 1).await.unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));

    common::report_replicas_online(&h, "cluster1", &v1).await;
    engine.on_push_completed("cluster1", "orders", 1).await.unwrap();
    let store = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    assert_eq!(store.version_status(1), VersionStatus::Online);
    assert_eq!(store.current_version, 1);

    engine
        .set_store_current_version("cluster1", "orders", 1)
        .await
        .unwrap();

    // The same push id never allocates a second version.
    let again = engine
        .increment_version_idempotent("cluster1", "orders", "p-1", 4, 3, true, false, true)
        .await
        .unwrap();
    assert_eq!(again.number, 1);
    let store = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    assert_eq!(store.versions.len(), 1);
    assert_eq!(store.largest_used_version_number, 1);
}

#[tokio::test]
async fn delete_refuses_enabled_store_and_graveyard_survives_recreate() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    common::push(&h, "cluster1", "orders", "p-1").await;

    let err = engine
        .delete_store("cluster1", "orders", Store::IGNORE_VERSION)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));

    engine
        .set_store_read_writeability("cluster1", "orders", false)
        .await
        .unwrap();
    engine
        .delete_store("cluster1", "orders", Store::IGNORE_VERSION)
        .await
        .unwrap();
    assert!(!engine.has_store("cluster1", "orders").await.unwrap());

    // The version topic was deprecated, not deleted.
    assert!(h
        .topics
        .is_topic_truncated("orders_v1", engine.config().deprecated_topic_max_retention_ms)
        .await
        .unwrap());

    // Recreation resumes version numbering above the buried largest.
    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    let store = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    assert_eq!(store.largest_used_version_number, 1);
    let v2 = engine
        .increment_version_idempotent("cluster1", "orders", "p-2", 4, 3, true, false, true)
        .await
        .unwrap();
    assert_eq!(v2.number, 2);
}

#[tokio::test]
async fn largest_used_override_cannot_regress() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    common::push(&h, "cluster1", "orders", "p-1").await;
    common::push(&h, "cluster1", "orders", "p-2").await;
    engine
        .set_store_read_writeability("cluster1", "orders", false)
        .await
        .unwrap();

    let err = engine.delete_store("cluster1", "orders", 1).await.unwrap_err();
    assert!(matches!(err, ControllerError::Fatal(_)));

    // An override above the stored value is honored and buried.
    engine.delete_store("cluster1", "orders", 10).await.unwrap();
    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    let store = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    assert_eq!(store.largest_used_version_number, 10);
}

#[tokio::test]
async fn value_schema_registration_laws() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();

    // Registering the creation schema again is idempotent.
    let entry = engine
        .add_value_schema("cluster1", "orders", VALUE_SCHEMA)
        .await
        .unwrap();
    assert_eq!(entry.id, 1);

    let err = engine
        .add_value_schema("cluster1", "orders", "\"int\"")
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::SchemaIncompatible(_)));

    // A record store evolves compatibly to the next id.
    let v1 = r#"{"type":"record","name":"Order","fields":[{"name":"id","type":"string"}]}"#;
    let v2 = r#"{"type":"record","name":"Order","fields":[
        {"name":"id","type":"string"},{"name":"total","type":"long","default":0}]}"#;
    engine
        .create_store("cluster1", "orders-rec", "team", KEY_SCHEMA, v1)
        .await
        .unwrap();
    assert_eq!(
        engine.add_value_schema("cluster1", "orders-rec", v1).await.unwrap().id,
        1
    );
    assert_eq!(
        engine.add_value_schema("cluster1", "orders-rec", v2).await.unwrap().id,
        2
    );
    assert_eq!(
        engine
            .get_value_schema_id("cluster1", "orders-rec", v1)
            .await
            .unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn cleanup_check_ignores_version_topics_but_not_rt() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    h.topics.create_topic("widgets_v1", 1, 1, None).await.unwrap();
    engine
        .check_resource_cleanup_before_store_creation("cluster1", "widgets", true)
        .await
        .unwrap();

    h.topics.create_topic("widgets_rt", 1, 1, None).await.unwrap();
    let err = engine
        .check_resource_cleanup_before_store_creation("cluster1", "widgets", true)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));
}

#[tokio::test]
async fn cleanup_check_sees_resources_unless_skipped() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    h.coordinator
        .add_resource(
            "cluster1",
            &strata_cluster::ResourceSpec {
                name: "widgets_v1".to_string(),
                partition_count: 1,
                replication_factor: 1,
                state_model: strata_cluster::StateModel::OnlineOffline,
                rebalancer: strata_cluster::Rebalancer::DelayedAuto,
                min_active_replicas: 0,
            },
        )
        .await
        .unwrap();

    let err = engine
        .check_resource_cleanup_before_store_creation("cluster1", "widgets", true)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));

    engine
        .check_resource_cleanup_before_store_creation("cluster1", "widgets", false)
        .await
        .unwrap();
}

#[tokio::test]
async fn hybrid_store_guards() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    engine
        .update_store(
            "cluster1",
            "orders",
            UpdateStoreParams {
                hybrid_rewind_seconds: Some(86_400),
                hybrid_offset_lag_threshold: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = engine
        .update_store(
            "cluster1",
            "orders",
            UpdateStoreParams {
                partition_count: Some(16),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));

    let before = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    let err = engine
        .update_store(
            "cluster1",
            "orders",
            UpdateStoreParams {
                incremental_push_enabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));

    // The failed update left no trace.
    let after = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    assert_eq!(before, after);
    assert!(!after.incremental_push_enabled);
    assert!(after.is_hybrid());
}

#[tokio::test]
async fn update_rollback_restores_earlier_fields() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();

    // Owner would change first, then the negative quota is rejected; the
    // pre-image restore must roll the owner back too.
    let err = engine
        .update_store(
            "cluster1",
            "orders",
            UpdateStoreParams {
                owner: Some("other-team".to_string()),
                read_quota_cu: Some(-5),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));
    let store = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    assert_eq!(store.owner, "team");
}

#[tokio::test]
async fn retire_deprecates_topics_without_versions() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    for n in 1..=4 {
        common::push(&h, "cluster1", "orders", &format!("p-{n}")).await;
    }

    engine.retire_old_store_versions("cluster1", "orders").await.unwrap();

    let store = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    let numbers: Vec<i32> = store.versions.iter().map(|v| v.number).collect();
    assert_eq!(numbers, vec![3, 4], "current plus one backup survive");

    // Every orders version topic is either live or deprecated.
    let threshold = engine.config().deprecated_topic_max_retention_ms;
    for topic in h.topics.list_topics().await.unwrap() {
        let Some(owner) = topics::parse_store_from_version_topic(&topic) else {
            continue;
        };
        if owner != "orders" {
            continue;
        }
        let number = topics::parse_version_from_version_topic(&topic).unwrap();
        let truncated = h.topics.is_topic_truncated(&topic, threshold).await.unwrap();
        assert_eq!(
            store.versions.iter().any(|v| v.number == number),
            !truncated,
            "topic {topic} must be live or truncated"
        );
    }
}

#[tokio::test]
async fn current_version_cannot_be_deleted_directly() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    common::push(&h, "cluster1", "orders", "p-1").await;
    common::push(&h, "cluster1", "orders", "p-2").await;

    let err = engine
        .delete_old_version("cluster1", "orders", 2)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)));

    engine.delete_old_version("cluster1", "orders", 1).await.unwrap();
    // Deleting it again is a logged no-op.
    engine.delete_old_version("cluster1", "orders", 1).await.unwrap();

    let store = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    assert_eq!(store.versions.len(), 1);
    assert_eq!(store.largest_used_version_number, 2);
}

#[tokio::test]
async fn end_of_push_guards() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    common::push(&h, "cluster1", "orders", "p-1").await;
    let v2 = engine
        .increment_version_idempotent("cluster1", "orders", "p-2", 4, 3, true, false, false)
        .await
        .unwrap();

    let err = engine
        .write_end_of_push("cluster1", "orders", 1, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)), "serving version");

    let err = engine
        .write_end_of_push("cluster1", "orders", 9, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::VersionNotFound { .. }));

    engine
        .write_end_of_push("cluster1", "orders", v2.number, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_version_creation_compensates() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();

    // Ask for more replicas than there are nodes: assignment cannot complete.
    let err = engine
        .add_version("cluster1", "orders", "p-1", None, 4, 5, true, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::AssignmentTimeout { .. }));

    // The compensation removed the version, but the number stays burned.
    let store = engine.get_store("cluster1", "orders").await.unwrap().unwrap();
    assert!(store.versions.is_empty());
    assert_eq!(store.largest_used_version_number, 1);
    assert!(!h.coordinator.has_resource("cluster1", "orders_v1").await.unwrap());

    let v2 = engine
        .increment_version_idempotent("cluster1", "orders", "p-2", 4, 3, true, false, false)
        .await
        .unwrap();
    assert_eq!(v2.number, 2);
}

#[tokio::test]
async fn version_number_hint_collisions_are_rejected() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    common::push(&h, "cluster1", "orders", "p-1").await;

    let err = engine
        .add_version("cluster1", "orders", "p-x", Some(1), 4, 3, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::VersionAlreadyExists { .. }));
}

#[tokio::test]
async fn real_time_topic_requires_hybrid_initialized_store() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    let err = engine.ensure_real_time_topic("cluster1", "orders").await.unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)), "not hybrid");

    engine
        .update_store(
            "cluster1",
            "orders",
            UpdateStoreParams {
                hybrid_rewind_seconds: Some(60),
                hybrid_offset_lag_threshold: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = engine.ensure_real_time_topic("cluster1", "orders").await.unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)), "no partitions yet");

    common::push(&h, "cluster1", "orders", "p-1").await;
    let topic = engine.ensure_real_time_topic("cluster1", "orders").await.unwrap();
    assert_eq!(topic, "orders_rt");
    assert!(h.topics.contains_topic("orders_rt").await.unwrap());
    // Idempotent.
    assert_eq!(
        engine.ensure_real_time_topic("cluster1", "orders").await.unwrap(),
        "orders_rt"
    );
}

#[tokio::test]
async fn operations_require_leadership() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    let err = engine
        .create_store("cluster9", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::NotLeader { .. }));
}

#[tokio::test]
async fn incremental_push_version_rules() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();

    let err = engine
        .get_incremental_push_version("cluster1", "orders")
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)), "not enabled");

    engine
        .update_store(
            "cluster1",
            "orders",
            UpdateStoreParams {
                incremental_push_enabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = engine
        .get_incremental_push_version("cluster1", "orders")
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict(_)), "no versions yet");

    common::push(&h, "cluster1", "orders", "p-1").await;
    let version = engine
        .get_incremental_push_version("cluster1", "orders")
        .await
        .unwrap();
    assert_eq!(version.number, 1);
}

#[tokio::test]
async fn store_statuses_reflect_replication() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    let statuses = engine.get_all_store_statuses("cluster1").await.unwrap();
    assert_eq!(
        statuses.get("orders").unwrap().to_string(),
        "UNAVAILABLE",
        "no current version yet"
    );

    // A completed push has every replica online.
    let v1 = common::push(&h, "cluster1", "orders", "p-1").await;
    let resource = strata_core::topics::compose_version_topic("orders", v1.number);
    let statuses = engine.get_all_store_statuses("cluster1").await.unwrap();
    assert_eq!(statuses.get("orders").unwrap().to_string(), "FULLY_REPLICATED");

    // Losing one replica of a partition drops below the version's own
    // replication factor; losing all of them degrades the partition.
    h.coordinator
        .set_replica_state(
            "cluster1",
            &resource,
            0,
            "node-0",
            strata_cluster::ReplicaState::Offline,
        )
        .await
        .unwrap();
    let statuses = engine.get_all_store_statuses("cluster1").await.unwrap();
    assert_eq!(statuses.get("orders").unwrap().to_string(), "UNDER_REPLICATED");

    for node in 1..3 {
        h.coordinator
            .set_replica_state(
                "cluster1",
                &resource,
                0,
                &format!("node-{node}"),
                strata_cluster::ReplicaState::Offline,
            )
            .await
            .unwrap();
    }
    let statuses = engine.get_all_store_statuses("cluster1").await.unwrap();
    assert_eq!(statuses.get("orders").unwrap().to_string(), "DEGRADED");
}

#[tokio::test]
async fn discovery_and_execution_ids() {
    let h = common::controller(&["cluster1"]).await;
    let engine = &h.engine;

    engine
        .create_store("cluster1", "orders", "team", KEY_SCHEMA, VALUE_SCHEMA)
        .await
        .unwrap();
    let (cluster, d2) = engine.discover_cluster("orders").await.unwrap();
    assert_eq!(cluster, "cluster1");
    assert_eq!(d2, "d2-cluster1");

    let err = engine.discover_cluster("ghost").await.unwrap_err();
    assert!(matches!(err, ControllerError::StoreNotFound(_)));

    assert_eq!(
        engine.get_last_succeeded_execution_id("cluster1").await.unwrap(),
        -1
    );
    engine.update_execution_id("cluster1", 41).await.unwrap();
    engine.update_execution_id("cluster1", 40).await.unwrap();
    assert_eq!(
        engine.get_last_succeeded_execution_id("cluster1").await.unwrap(),
        41
    );

    engine.skip_admin_message("cluster1", 17);
    assert_eq!(engine.admin_offset_to_skip("cluster1"), Some(17));
}
