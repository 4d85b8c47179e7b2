//! Shared harness: a controller with in-memory backends leading the given
//! clusters, with a few storage nodes registered per cluster.

use std::sync::Arc;
use std::time::Duration;

use strata_cluster::{
    MastershipController, ReplicaState, ResourceCoordinator, SqliteResourceCoordinator,
};
use strata_controller::{ControllerConfig, LifecycleEngine};
use strata_metadata::SqliteMetadataStore;
use strata_topics::SqliteTopicManager;

pub struct Harness {
    pub engine: Arc<LifecycleEngine>,
    pub coordinator: Arc<SqliteResourceCoordinator>,
    pub topics: Arc<SqliteTopicManager>,
}

pub async fn controller(clusters: &[&str]) -> Harness {
    let metadata = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
    let topics = Arc::new(SqliteTopicManager::new_in_memory().await.unwrap());
    let coordinator = Arc::new(SqliteResourceCoordinator::new_in_memory().await.unwrap());

    let mastership = Arc::new(
        MastershipController::new(
            "controller-1",
            "strata-controllers",
            1,
            Arc::clone(&coordinator) as Arc<dyn ResourceCoordinator>,
        )
        .with_timing(
            Duration::from_secs(2),
            Duration::from_millis(50),
            Duration::from_secs(30),
        ),
    );

    let mut config = ControllerConfig::default();
    config.clusters = clusters.iter().map(|c| c.to_string()).collect();
    config.cluster_to_d2 = clusters
        .iter()
        .map(|c| (c.to_string(), format!("d2-{c}")))
        .collect();
    config.offline_push_wait_ms = 2_000;

    let engine = Arc::new(LifecycleEngine::new(
        config,
        metadata,
        Arc::clone(&topics) as Arc<dyn strata_topics::TopicManager>,
        topics.writer(),
        Arc::clone(&coordinator) as Arc<dyn ResourceCoordinator>,
        mastership,
    ));

    for cluster in clusters {
        engine.start_cluster(cluster).await.unwrap();
        for i in 0..3 {
            coordinator
                .register_participant(cluster, &format!("node-{i}"))
                .await
                .unwrap();
        }
    }

    Harness {
        engine,
        coordinator,
        topics,
    }
}

/// Report every replica of a version's resource as online.
pub async fn report_replicas_online(
    harness: &Harness,
    cluster: &str,
    version: &strata_core::Version,
) {
    let resource = version.topic_name();
    for partition in 0..version.partition_count {
        for node in 0..3 {
            harness
                .coordinator
                .set_replica_state(
                    cluster,
                    &resource,
                    partition,
                    &format!("node-{node}"),
                    ReplicaState::Online,
                )
                .await
                .unwrap();
        }
    }
}

/// Run a full push cycle: allocate a version for the push id, finish the
/// push job, and drive the version online once its replicas report in.
pub async fn push(
    harness: &Harness,
    cluster: &str,
    store: &str,
    push_id: &str,
) -> strata_core::Version {
    let version = harness
        .engine
        .increment_version_idempotent(cluster, store, push_id, 4, 3, true, false, true)
        .await
        .unwrap();
    harness
        .engine
        .on_push_job_completed(cluster, store, version.number)
        .await
        .unwrap();
    report_replicas_online(harness, cluster, &version).await;
    harness
        .engine
        .on_push_completed(cluster, store, version.number)
        .await
        .unwrap();
    version
}
