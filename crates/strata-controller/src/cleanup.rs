//! Deletion and reconciliation paths: version deletion, store deletion,
//! retirement of old backup versions, topic truncation, and the pre-creation
//! cleanup check.
//!
//! Every step is individually idempotent. A failure between steps leaves a
//! state a later `retire_old_store_versions` or a recreate-after-delete pass
//! can converge from.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use strata_cluster::ParticipantMessage;
use strata_core::{topics, GraveyardEntry, Store};

use crate::engine::LifecycleEngine;
use crate::error::{ControllerError, Result};
use crate::resources::ClusterResources;

impl LifecycleEngine {
    // ---- single version deletion ----

    /// Drop a version's resource, kill its push, remove it from the store,
    /// and deprecate its topic.
    pub async fn delete_one_store_version(
        &self,
        cluster: &str,
        store_name: &str,
        version_number: i32,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.delete_one_store_version_inner(&res, store_name, version_number)
            .await
    }

    pub(crate) async fn delete_one_store_version_inner(
        &self,
        res: &ClusterResources,
        store_name: &str,
        version_number: i32,
    ) -> Result<()> {
        let cluster = res.cluster.clone();
        let resource = topics::compose_version_topic(store_name, version_number);
        info!(cluster = %cluster, resource = %resource, "Deleting store version");

        self.coordinator.drop_resource(&cluster, &resource).await?;
        self.coordinator
            .send_message_to_participants(
                &cluster,
                &ParticipantMessage::KillPush {
                    resource: resource.clone(),
                },
                1,
            )
            .await?;

        let store = self.store_required(&cluster, store_name).await?;
        if store.is_hybrid() && !store.migrating {
            // Topic-level cleanup of a migrating store is deferred to the
            // first push after migration completes.
            res.push_monitor.stop_buffer_replay(&resource).await;
        }

        let had_version = store.contains_version(version_number);
        if had_version {
            self.store_metadata_update(res, store_name, |s| {
                s.delete_version(version_number);
                Ok(())
            })
            .await?;
        } else {
            warn!(
                store = %store_name,
                version = version_number,
                "Version already absent, probably deleted earlier"
            );
        }

        if had_version && !store.migrating {
            self.truncate_topic(&resource).await?;
        }
        res.push_monitor.stop_monitor(&resource).await;
        Ok(())
    }

    /// Delete an old backup version. The serving version is protected.
    pub async fn delete_old_version(
        &self,
        cluster: &str,
        store_name: &str,
        version_number: i32,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;

        let store = self.store_required(cluster, store_name).await?;
        if store.current_version == version_number {
            return Err(ControllerError::Conflict(format!(
                "version {version_number} is currently serving store {store_name} and cannot be deleted"
            )));
        }
        if !store.contains_version(version_number) {
            warn!(
                store = %store_name,
                version = version_number,
                "Ignoring deletion of a version the store does not hold"
            );
            return Ok(());
        }
        self.delete_one_store_version_inner(&res, store_name, version_number)
            .await
    }

    // ---- full deletion ----

    /// Delete every version of a disabled store and reset its serving
    /// version.
    pub async fn delete_all_versions(&self, cluster: &str, store_name: &str) -> Result<Vec<i32>> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        let store = self.store_required(cluster, store_name).await?;
        check_deletion_preconditions(&store)?;
        self.delete_all_versions_inner(&res, store_name).await
    }

    pub(crate) async fn delete_all_versions_inner(
        &self,
        res: &ClusterResources,
        store_name: &str,
    ) -> Result<Vec<i32>> {
        // Reset the serving version first: if the store is re-enabled later
        // with all versions gone, routers must not see a stale current.
        let snapshot = self
            .store_metadata_update(res, store_name, |store| {
                store.current_version = Store::NON_EXISTING_VERSION;
                Ok(())
            })
            .await?;

        let numbers: Vec<i32> = snapshot.versions.iter().map(|v| v.number).collect();
        for number in &numbers {
            self.delete_one_store_version_inner(res, store_name, *number).await?;
        }
        info!(
            cluster = %res.cluster,
            store = %store_name,
            versions = numbers.len(),
            "Deleted all versions"
        );
        Ok(numbers)
    }

    /// Delete a store whose reads and writes are both disabled, moving its
    /// largest used version number to the graveyard.
    pub async fn delete_store(
        &self,
        cluster: &str,
        store_name: &str,
        largest_used_version_override: i32,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.delete_store_inner(&res, store_name, largest_used_version_override)
            .await
    }

    pub(crate) async fn delete_store_inner(
        &self,
        res: &ClusterResources,
        store_name: &str,
        largest_used_version_override: i32,
    ) -> Result<()> {
        let cluster = res.cluster.clone();
        info!(cluster = %cluster, store = %store_name, "Deleting store");

        {
            let _repo = res.repository_lock.lock().await;
            let versioned = self
                .metadata
                .load_store(&cluster, store_name)
                .await?
                .ok_or_else(|| ControllerError::StoreNotFound(store_name.to_string()))?;
            let mut store = versioned.store;
            check_deletion_preconditions(&store)?;

            if largest_used_version_override != Store::IGNORE_VERSION {
                if largest_used_version_override < store.largest_used_version_number {
                    return Err(ControllerError::Fatal(format!(
                        "largest used version override {largest_used_version_override} regresses below {} for store {store_name}",
                        store.largest_used_version_number
                    )));
                }
                store.largest_used_version_number = largest_used_version_override;
            }

            // Flag the discovery row so a half-finished deletion is
            // recognizable (and finishable) later. During migration the row
            // already points at the other cluster and must survive.
            match self.metadata.get_store_config(store_name).await? {
                Some(mut config) if config.cluster == cluster => {
                    config.deleting = true;
                    self.metadata.put_store_config(&config).await?;
                }
                Some(config) => {
                    warn!(
                        store = %store_name,
                        discovered_cluster = %config.cluster,
                        "Keeping discovery row: it points at another cluster"
                    );
                }
                None => {
                    warn!(store = %store_name, "No discovery row found while deleting");
                }
            }
            self.metadata
                .update_store(&cluster, &store, versioned.row_version)
                .await?;
        }

        self.delete_all_versions_inner(res, store_name).await?;
        self.truncate_topic(&topics::compose_real_time_topic(store_name)).await?;

        let remnant = self.store_required(&cluster, store_name).await?;
        self.truncate_old_topics(&remnant, true).await?;

        self.metadata
            .put_graveyard(&GraveyardEntry {
                store_name: store_name.to_string(),
                largest_used_version_number: remnant.largest_used_version_number,
            })
            .await?;

        {
            let _repo = res.repository_lock.lock().await;
            self.metadata.delete_store(&cluster, store_name).await?;
            self.metadata.delete_schemas(&cluster, store_name).await?;
        }

        if let Some(config) = self.metadata.get_store_config(store_name).await? {
            if config.deleting {
                self.metadata.delete_store_config(store_name).await?;
            }
        }
        info!(cluster = %cluster, store = %store_name, "Deleted store");
        Ok(())
    }

    // ---- retirement ----

    /// Delete every version the store's preservation rule marks as
    /// retireable, then deprecate any version topic with no corresponding
    /// version left.
    pub async fn retire_old_store_versions(&self, cluster: &str, store_name: &str) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;

        let store = self.store_required(cluster, store_name).await?;
        let to_delete = store.retrieve_versions_to_delete(self.config.min_versions_to_preserve);
        for version in &to_delete {
            self.delete_one_store_version_inner(&res, store_name, version.number)
                .await?;
            info!(
                store = %store_name,
                version = version.number,
                "Retired store version"
            );
        }
        if !to_delete.is_empty() {
            info!(
                store = %store_name,
                retired = to_delete.len(),
                "Retired old store versions"
            );
        }

        let store = self.store_required(cluster, store_name).await?;
        self.truncate_old_topics(&store, false).await
    }

    // ---- topic truncation ----

    /// Deprecate a topic by dropping its retention. Missing topics are a
    /// no-op.
    pub(crate) async fn truncate_topic(&self, topic: &str) -> Result<()> {
        self.topics
            .truncate(topic, self.config.deprecated_topic_retention_ms)
            .await?;
        Ok(())
    }

    /// Deprecate leaked version topics of a store: all of them on store
    /// deletion, otherwise only those without a corresponding live version.
    pub(crate) async fn truncate_old_topics(
        &self,
        store: &Store,
        for_store_deletion: bool,
    ) -> Result<()> {
        if store.migrating {
            info!(store = %store.name, "Store is migrating, skipping topic cleanup");
            return Ok(());
        }

        let live_versions: HashSet<i32> = store.versions.iter().map(|v| v.number).collect();
        let all_topics = self.topics.list_topics().await?;
        let mut related: Vec<(String, i32)> = all_topics
            .into_iter()
            .filter_map(|t| {
                let store_name = topics::parse_store_from_version_topic(&t)?.to_string();
                let number = topics::parse_version_from_version_topic(&t)?;
                (store_name == store.name).then_some((t, number))
            })
            .collect();
        if related.is_empty() {
            debug!(store = %store.name, "No old version topics found");
            return Ok(());
        }

        let mut to_truncate: Vec<(String, i32)> = if for_store_deletion {
            related
        } else {
            related.retain(|(_, number)| !live_versions.contains(number));
            // Spare the most recent unused topics when configured: slow
            // consumers may still be draining them.
            related.sort_by(|a, b| b.1.cmp(&a.1));
            related
                .into_iter()
                .skip(self.config.min_unused_topics_to_preserve as usize)
                .collect()
        };
        to_truncate.sort_by_key(|(_, number)| *number);

        for (topic, _) in &to_truncate {
            self.truncate_topic(topic).await?;
        }
        if !to_truncate.is_empty() {
            info!(
                store = %store.name,
                truncated = to_truncate.len(),
                "Deprecated old version topics"
            );
        }
        Ok(())
    }

    // ---- pre-creation check ----

    /// Verify nothing of a previous incarnation of the store lingers before
    /// creating it: discovery row, registry row, real-time topics (the
    /// store's and its system store's), and coordinator resources. Version
    /// topics are tolerated; deprecated ones may legitimately outlive their
    /// store for a while.
    pub async fn check_resource_cleanup_before_store_creation(
        &self,
        cluster: &str,
        store_name: &str,
        include_coordinator: bool,
    ) -> Result<()> {
        self.require_leader(cluster).await?;

        if let Some(config) = self.metadata.get_store_config(store_name).await? {
            return Err(ControllerError::Conflict(format!(
                "store {store_name} still exists in cluster {}",
                config.cluster
            )));
        }
        if self.metadata.has_store(cluster, store_name).await? {
            return Err(ControllerError::Conflict(format!(
                "store {store_name} still exists in cluster {cluster}"
            )));
        }

        let system_store = format!("{}{store_name}", topics::SYSTEM_STORE_PREFIX);
        for topic in self.topics.list_topics().await? {
            if let Some(owner) = topics::parse_store_from_version_topic(&topic) {
                if owner == store_name || owner == system_store {
                    info!(
                        topic = %topic,
                        store = %store_name,
                        "Ignoring lingering version topic during pre-creation check"
                    );
                }
                continue;
            }
            if let Some(owner) = topics::parse_store_from_real_time_topic(&topic) {
                if owner == store_name || owner == system_store {
                    return Err(ControllerError::Conflict(format!(
                        "topic {topic} still exists for store {store_name}"
                    )));
                }
            }
        }

        if include_coordinator {
            for resource in self.coordinator.list_resources(cluster).await? {
                if let Some(owner) = topics::parse_store_from_version_topic(&resource) {
                    if owner == store_name || owner == system_store {
                        return Err(ControllerError::Conflict(format!(
                            "resource {resource} still exists for store {store_name}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_deletion_preconditions(store: &Store) -> Result<()> {
    if store.enable_reads || store.enable_writes {
        return Err(ControllerError::Conflict(format!(
            "store {} has not been disabled; both reads and writes must be off before deletion",
            store.name
        )));
    }
    Ok(())
}

/// Background loop retiring old backup versions across every led cluster.
pub struct BackupVersionCleanupTask {
    engine: Arc<LifecycleEngine>,
    check_interval: Duration,
}

impl BackupVersionCleanupTask {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        let check_interval =
            Duration::from_millis(engine.config().backup_cleanup_interval_ms);
        Self {
            engine,
            check_interval,
        }
    }

    pub fn with_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Run until the shutdown receiver fires, draining the current pass.
    pub fn start(self: Arc<Self>, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.check_interval);
            let mut shutdown_rx = shutdown_rx;
            info!(interval = ?self.check_interval, "Backup version cleanup started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cleanup_pass().await {
                            error!(error = %e, "Backup version cleanup pass failed");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Backup version cleanup shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn run_cleanup_pass(&self) -> Result<()> {
        for cluster in self.engine.registry.installed().await {
            if !self.engine.is_leader(&cluster).await {
                continue;
            }
            let stores = self.engine.metadata.list_stores(&cluster).await?;
            for store in stores {
                if let Err(e) = self
                    .engine
                    .retire_old_store_versions(&cluster, &store.name)
                    .await
                {
                    warn!(
                        cluster = %cluster,
                        store = %store.name,
                        error = %e,
                        "Failed to retire old versions"
                    );
                }
            }
        }
        Ok(())
    }
}
