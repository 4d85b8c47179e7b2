//! Admin mastership over managed clusters.
//!
//! Every controller process attaches to a meta-cluster whose resources are
//! the managed clusters themselves, one single-partition leader/standby
//! resource per cluster. Whichever controller holds the lease on a cluster's
//! partition is that cluster's admin leader; all admin operations check
//! leadership first and standbys refuse them.
//!
//! Held leases are renewed by a background task well inside their duration.
//! A renewal failure (lease lost to another controller) demotes this node
//! immediately: the cached lease is dropped and `is_leader` turns false.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::{
    ClusterManagerConfig, LeaderLease, Rebalancer, ResourceCoordinator, ResourceSpec, StateModel,
};

/// One partition per managed cluster in the meta-cluster.
pub const META_CLUSTER_PARTITION_COUNT: i32 = 1;

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(300);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEWAL_INTERVAL: Duration = Duration::from_secs(10);

pub struct MastershipController {
    controller_id: String,
    meta_cluster: String,
    meta_cluster_replicas: i32,
    coordinator: Arc<dyn ResourceCoordinator>,
    leases: Arc<RwLock<HashMap<String, LeaderLease>>>,
    renewal_handle: RwLock<Option<JoinHandle<()>>>,
    join_timeout: Duration,
    poll_interval: Duration,
    lease_duration: Duration,
}

impl MastershipController {
    pub fn new(
        controller_id: impl Into<String>,
        meta_cluster: impl Into<String>,
        meta_cluster_replicas: i32,
        coordinator: Arc<dyn ResourceCoordinator>,
    ) -> Self {
        Self {
            controller_id: controller_id.into(),
            meta_cluster: meta_cluster.into(),
            meta_cluster_replicas,
            coordinator,
            leases: Arc::new(RwLock::new(HashMap::new())),
            renewal_handle: RwLock::new(None),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            poll_interval: JOIN_POLL_INTERVAL,
            lease_duration: LEASE_DURATION,
        }
    }

    /// Shrink the timing constants, for tests.
    pub fn with_timing(
        mut self,
        join_timeout: Duration,
        poll_interval: Duration,
        lease_duration: Duration,
    ) -> Self {
        self.join_timeout = join_timeout;
        self.poll_interval = poll_interval;
        self.lease_duration = lease_duration;
        self
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    /// Create the meta-cluster if required.
    pub async fn ensure_meta_cluster(&self) -> Result<()> {
        self.coordinator
            .ensure_cluster(&self.meta_cluster, &ClusterManagerConfig::meta_cluster())
            .await
    }

    /// Idempotently create a managed cluster plus its meta-cluster resource.
    pub async fn register_cluster(
        &self,
        cluster: &str,
        config: &ClusterManagerConfig,
    ) -> Result<()> {
        self.coordinator.ensure_cluster(cluster, config).await?;

        let spec = ResourceSpec {
            name: cluster.to_string(),
            partition_count: META_CLUSTER_PARTITION_COUNT,
            replication_factor: self.meta_cluster_replicas,
            state_model: StateModel::LeaderStandby,
            rebalancer: Rebalancer::DelayedAuto,
            min_active_replicas: self.meta_cluster_replicas,
        };
        match self.coordinator.add_resource(&self.meta_cluster, &spec).await {
            Ok(()) => {
                info!(cluster = %cluster, "Registered cluster in meta-cluster");
                Ok(())
            }
            Err(ClusterError::ResourceAlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Enable this controller for the cluster's partition and block until it
    /// becomes the admin leader, or fail with `JoinTimeout`.
    pub async fn start(&self, cluster: &str) -> Result<()> {
        self.coordinator
            .enable_partition(&self.meta_cluster, &self.controller_id, cluster, 0, true)
            .await?;

        let started = Instant::now();
        loop {
            match self
                .coordinator
                .acquire_leader_lease(
                    &self.meta_cluster,
                    cluster,
                    &self.controller_id,
                    self.lease_duration.as_millis() as i64,
                )
                .await
            {
                Ok(lease) => {
                    info!(
                        cluster = %cluster,
                        controller = %self.controller_id,
                        epoch = lease.epoch,
                        "Became admin leader"
                    );
                    self.leases.write().await.insert(cluster.to_string(), lease);
                    return Ok(());
                }
                Err(ClusterError::LeaseHeldByOther { holder, .. }) => {
                    if started.elapsed() >= self.join_timeout {
                        return Err(ClusterError::JoinTimeout {
                            cluster: cluster.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    debug!(
                        cluster = %cluster,
                        holder = %holder,
                        "Standing by for admin leadership"
                    );
                    sleep(self.poll_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether this controller currently leads the cluster. Answers from the
    /// cached lease; an expired cache entry means leadership is gone even if
    /// the renewal task has not noticed yet.
    pub async fn is_leader(&self, cluster: &str) -> bool {
        let leases = self.leases.read().await;
        leases
            .get(cluster)
            .map(|lease| lease.expires_at > chrono::Utc::now().timestamp_millis())
            .unwrap_or(false)
    }

    /// Clusters this controller currently leads.
    pub async fn led_clusters(&self) -> Vec<String> {
        let now = chrono::Utc::now().timestamp_millis();
        self.leases
            .read()
            .await
            .iter()
            .filter(|(_, lease)| lease.expires_at > now)
            .map(|(cluster, _)| cluster.clone())
            .collect()
    }

    /// Disable this controller for the cluster's partition and hand
    /// leadership back.
    pub async fn stop(&self, cluster: &str) -> Result<()> {
        self.coordinator
            .enable_partition(&self.meta_cluster, &self.controller_id, cluster, 0, false)
            .await?;
        if self.leases.write().await.remove(cluster).is_some() {
            self.coordinator
                .release_leader_lease(&self.meta_cluster, cluster, &self.controller_id)
                .await?;
            info!(cluster = %cluster, controller = %self.controller_id, "Released admin leadership");
        }
        Ok(())
    }

    /// Start the background lease renewal task.
    pub async fn start_renewal_task(&self) {
        let coordinator = Arc::clone(&self.coordinator);
        let leases = Arc::clone(&self.leases);
        let controller_id = self.controller_id.clone();
        let meta_cluster = self.meta_cluster.clone();
        let lease_duration_ms = self.lease_duration.as_millis() as i64;
        let interval = RENEWAL_INTERVAL.min(self.lease_duration / 3);

        let handle = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let held: Vec<String> = leases.read().await.keys().cloned().collect();
                for cluster in held {
                    match coordinator
                        .acquire_leader_lease(
                            &meta_cluster,
                            &cluster,
                            &controller_id,
                            lease_duration_ms,
                        )
                        .await
                    {
                        Ok(lease) => {
                            leases.write().await.insert(cluster, lease);
                        }
                        Err(e) => {
                            warn!(
                                cluster = %cluster,
                                controller = %controller_id,
                                error = %e,
                                "Lost admin leadership"
                            );
                            leases.write().await.remove(&cluster);
                        }
                    }
                }
            }
        });

        *self.renewal_handle.write().await = Some(handle);
    }

    /// Stop the renewal task. Held leases are left to expire.
    pub async fn stop_renewal_task(&self) {
        if let Some(handle) = self.renewal_handle.write().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteResourceCoordinator;

    async fn setup(controller_id: &str) -> (MastershipController, Arc<SqliteResourceCoordinator>) {
        let coordinator = Arc::new(SqliteResourceCoordinator::new_in_memory().await.unwrap());
        let mastership = MastershipController::new(
            controller_id,
            "strata-controllers",
            1,
            Arc::clone(&coordinator) as Arc<dyn ResourceCoordinator>,
        )
        .with_timing(
            Duration::from_millis(400),
            Duration::from_millis(50),
            Duration::from_secs(30),
        );
        mastership.ensure_meta_cluster().await.unwrap();
        mastership
            .register_cluster("cluster1", &ClusterManagerConfig::meta_cluster())
            .await
            .unwrap();
        (mastership, coordinator)
    }

    #[tokio::test]
    async fn start_acquires_leadership() {
        let (mastership, _) = setup("controller-a").await;
        assert!(!mastership.is_leader("cluster1").await);
        mastership.start("cluster1").await.unwrap();
        assert!(mastership.is_leader("cluster1").await);
        assert_eq!(mastership.led_clusters().await, vec!["cluster1".to_string()]);
    }

    #[tokio::test]
    async fn second_controller_times_out_while_leader_holds() {
        let (a, coordinator) = setup("controller-a").await;
        a.start("cluster1").await.unwrap();

        let b = MastershipController::new(
            "controller-b",
            "strata-controllers",
            1,
            coordinator as Arc<dyn ResourceCoordinator>,
        )
        .with_timing(
            Duration::from_millis(200),
            Duration::from_millis(50),
            Duration::from_secs(30),
        );
        let err = b.start("cluster1").await.unwrap_err();
        assert!(matches!(err, ClusterError::JoinTimeout { .. }));
        assert!(!b.is_leader("cluster1").await);
    }

    #[tokio::test]
    async fn stop_hands_over_leadership() {
        let (a, coordinator) = setup("controller-a").await;
        a.start("cluster1").await.unwrap();
        a.stop("cluster1").await.unwrap();
        assert!(!a.is_leader("cluster1").await);

        let b = MastershipController::new(
            "controller-b",
            "strata-controllers",
            1,
            coordinator as Arc<dyn ResourceCoordinator>,
        )
        .with_timing(
            Duration::from_millis(400),
            Duration::from_millis(50),
            Duration::from_secs(30),
        );
        b.start("cluster1").await.unwrap();
        assert!(b.is_leader("cluster1").await);
    }

    #[tokio::test]
    async fn register_cluster_is_idempotent() {
        let (mastership, _) = setup("controller-a").await;
        mastership
            .register_cluster("cluster1", &ClusterManagerConfig::meta_cluster())
            .await
            .unwrap();
    }
}
