//! Per-cluster dependency graph.
//!
//! A [`ClusterResources`] bundle is built when this controller becomes a
//! cluster's admin leader and dropped when it goes back to standby: the
//! cluster's lock pair, its push monitor, and its effective config. The
//! engine resolves the bundle on every operation, so an op against a cluster
//! this controller never led (or no longer leads) fails fast.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::{ControllerError, Result};
use crate::push_monitor::PushMonitor;

pub struct ClusterResources {
    pub cluster: String,
    /// Coarse per-cluster metadata operation lock: lifecycle mutations take
    /// it in write mode, read-only listings in read mode. Held across
    /// coordinator and topic-manager calls on purpose, so a version add
    /// appears atomic to every other admin.
    pub metadata_lock: RwLock<()>,
    /// Finer store-repository lock, held only around read-modify-CAS cycles
    /// against the metadata store.
    pub repository_lock: Mutex<()>,
    pub push_monitor: PushMonitor,
}

impl ClusterResources {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            metadata_lock: RwLock::new(()),
            repository_lock: Mutex::new(()),
            push_monitor: PushMonitor::new(),
        }
    }
}

/// Process-wide registry of led clusters.
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<String, Arc<ClusterResources>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install resources on the standby -> leader transition.
    pub async fn install(&self, cluster: &str) -> Arc<ClusterResources> {
        let resources = Arc::new(ClusterResources::new(cluster));
        self.clusters
            .write()
            .await
            .insert(cluster.to_string(), Arc::clone(&resources));
        info!(cluster = %cluster, "Installed cluster resources");
        resources
    }

    /// Tear down resources on the leader -> standby transition.
    pub async fn remove(&self, cluster: &str) {
        if self.clusters.write().await.remove(cluster).is_some() {
            info!(cluster = %cluster, "Removed cluster resources");
        }
    }

    pub async fn get(&self, cluster: &str) -> Result<Arc<ClusterResources>> {
        self.clusters
            .read()
            .await
            .get(cluster)
            .cloned()
            .ok_or_else(|| ControllerError::ClusterNotInitialized(cluster.to_string()))
    }

    pub async fn installed(&self) -> Vec<String> {
        self.clusters.read().await.keys().cloned().collect()
    }
}
