//! Cross-cluster store migration.
//!
//! Migration clones a store (attributes and schemas, not data) into the
//! destination cluster and flags both sides as migrating; discovery keeps
//! pointing at the source. A fresh push cycle on the destination rebuilds
//! the data, and the background [`MigrationMonitor`] flips discovery to the
//! destination once it serves a version at least as new as the source's
//! latest online version. Source-side topic and resource cleanup stays
//! deferred until the migrating flag is cleared.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use strata_core::{Store, VersionStatus};

use crate::engine::LifecycleEngine;
use crate::error::{ControllerError, Result};
use crate::update::UpdateStoreParams;

impl LifecycleEngine {
    /// Clone `store_name` from `src_cluster` into `dest_cluster` and begin
    /// migration. Both clusters must be led by this controller.
    pub async fn migrate_store(
        &self,
        src_cluster: &str,
        dest_cluster: &str,
        store_name: &str,
    ) -> Result<()> {
        if src_cluster == dest_cluster {
            return Err(ControllerError::Conflict(
                "source and destination cluster cannot be the same".to_string(),
            ));
        }
        self.require_leader(src_cluster).await?;
        self.require_leader(dest_cluster).await?;

        let src_store = self.store_required(src_cluster, store_name).await?;
        let key_schema = self
            .metadata
            .key_schema(src_cluster, store_name)
            .await?
            .ok_or_else(|| {
                ControllerError::SchemaNotFound(format!("key schema of store {store_name}"))
            })?;
        let value_schemas = self.metadata.value_schemas(src_cluster, store_name).await?;

        self.clone_store(dest_cluster, &src_store, &key_schema.schema, &value_schemas)
            .await?;

        // Discovery stays on the source; the monitor flips it when the
        // destination catches up.
        let mut config = self
            .metadata
            .get_store_config(store_name)
            .await?
            .ok_or_else(|| ControllerError::StoreNotFound(store_name.to_string()))?;
        config.migration_src_cluster = Some(src_cluster.to_string());
        config.migration_dest_cluster = Some(dest_cluster.to_string());
        self.metadata.put_store_config(&config).await?;

        // The destination restarts version numbering so the next push cycle
        // rebuilds it from scratch.
        self.update_store(
            dest_cluster,
            store_name,
            UpdateStoreParams {
                largest_used_version_number: Some(0),
                migrating: Some(true),
                ..Default::default()
            },
        )
        .await?;
        self.update_store(
            src_cluster,
            store_name,
            UpdateStoreParams {
                migrating: Some(true),
                ..Default::default()
            },
        )
        .await?;

        info!(
            store = %store_name,
            src = %src_cluster,
            dest = %dest_cluster,
            "Started store migration"
        );
        Ok(())
    }

    /// Create the destination replica of a migrating store: same attributes,
    /// same schemas under their original ids, no versions.
    async fn clone_store(
        &self,
        dest_cluster: &str,
        src_store: &Store,
        key_schema: &str,
        value_schemas: &[strata_metadata::SchemaEntry],
    ) -> Result<()> {
        let store_name = &src_store.name;
        let res = self.require_leader(dest_cluster).await?;
        let _lock = res.metadata_lock.write().await;

        if let Some(config) = self.metadata.get_store_config(store_name).await? {
            if config.cluster == dest_cluster {
                return Err(ControllerError::StoreAlreadyExists(store_name.clone()));
            }
        }

        let mut cloned = Store::new(store_name.clone(), src_store.owner.clone(), strata_core::now_ms());
        cloned.largest_used_version_number = self
            .metadata
            .largest_used_version_from_graveyard(store_name)
            .await?;
        {
            let _repo = res.repository_lock.lock().await;
            self.metadata.add_store(dest_cluster, &cloned).await?;
            if self.metadata.get_store_config(store_name).await?.is_none() {
                warn!(
                    store = %store_name,
                    "Expected a discovery row for the migrating store, creating one"
                );
                self.metadata
                    .put_store_config(&strata_core::StoreConfig::new(
                        store_name.clone(),
                        dest_cluster,
                    ))
                    .await?;
            }
        }

        self.metadata
            .init_key_schema(dest_cluster, store_name, key_schema)
            .await?;
        for entry in value_schemas {
            self.metadata
                .add_value_schema_with_id(dest_cluster, store_name, &entry.schema, entry.id)
                .await?;
        }
        drop(_lock);

        // Copy the remaining attributes through the regular update path.
        self.update_store(
            dest_cluster,
            store_name,
            UpdateStoreParams::from_store(src_store),
        )
        .await?;
        info!(store = %store_name, dest = %dest_cluster, "Cloned store for migration");
        Ok(())
    }

    /// Point discovery for a store at a new cluster.
    pub async fn update_cluster_discovery(
        &self,
        store_name: &str,
        old_cluster: &str,
        new_cluster: &str,
    ) -> Result<()> {
        let mut config = self
            .metadata
            .get_store_config(store_name)
            .await?
            .ok_or_else(|| ControllerError::StoreNotFound(store_name.to_string()))?;
        if config.cluster != old_cluster {
            return Err(ControllerError::Conflict(format!(
                "store {store_name} is expected in cluster {old_cluster} but discovery points at {}",
                config.cluster
            )));
        }
        config.cluster = new_cluster.to_string();
        self.metadata.put_store_config(&config).await?;
        info!(
            store = %store_name,
            old = %old_cluster,
            new = %new_cluster,
            "Updated cluster discovery"
        );
        Ok(())
    }
}

/// Background loop that completes migrations by flipping discovery.
///
/// Each pass swallows its errors: a broken iteration must never stop the
/// monitor.
pub struct MigrationMonitor {
    engine: Arc<LifecycleEngine>,
    check_interval: Duration,
}

impl MigrationMonitor {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        let check_interval =
            Duration::from_millis(engine.config().migration_monitor_interval_ms);
        Self {
            engine,
            check_interval,
        }
    }

    pub fn with_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn start(self: Arc<Self>, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.check_interval);
            let mut shutdown_rx = shutdown_rx;
            info!(interval = ?self.check_interval, "Store migration monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_monitor_pass().await {
                            error!(error = %e, "Store migration monitor pass failed");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Store migration monitor shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn run_monitor_pass(&self) -> Result<()> {
        let engine = &self.engine;
        for cluster in engine.registry.installed().await {
            if !engine.is_leader(&cluster).await {
                continue;
            }
            let stores = engine.metadata.list_stores(&cluster).await?;
            for store in stores.into_iter().filter(|s| s.migrating) {
                if let Err(e) = self.check_one_migration(&cluster, &store).await {
                    warn!(
                        cluster = %cluster,
                        store = %store.name,
                        error = %e,
                        "Migration check failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn check_one_migration(&self, cluster: &str, store: &Store) -> Result<()> {
        let engine = &self.engine;
        let Some(config) = engine.metadata.get_store_config(&store.name).await? else {
            return Ok(());
        };
        let (Some(src), Some(dest)) = (
            config.migration_src_cluster.clone(),
            config.migration_dest_cluster.clone(),
        ) else {
            return Ok(());
        };

        // Either side's leader could run this check; the destination does.
        if cluster != dest {
            return Ok(());
        }
        if config.cluster == dest {
            return Ok(());
        }

        let src_store = engine
            .metadata
            .get_store(&src, &store.name)
            .await?
            .ok_or_else(|| ControllerError::StoreNotFound(store.name.clone()))?;
        let src_latest_online = src_store
            .versions
            .iter()
            .filter(|v| v.status == VersionStatus::Online)
            .map(|v| v.number)
            .max();

        let Some(src_latest_online) = src_latest_online else {
            warn!(
                store = %store.name,
                src = %src,
                "Source store has no online versions; flipping discovery cannot make it worse"
            );
            engine
                .update_cluster_discovery(&store.name, &src, &dest)
                .await?;
            return Ok(());
        };

        let dest_store = engine
            .metadata
            .get_store(&dest, &store.name)
            .await?
            .ok_or_else(|| ControllerError::StoreNotFound(store.name.clone()))?;
        let dest_ready = dest_store.versions.iter().any(|v| {
            v.status == VersionStatus::Online && v.number >= src_latest_online
        });

        if dest_ready {
            info!(
                store = %store.name,
                dest = %dest,
                "Destination replica is ready, updating cluster discovery"
            );
            // New clients discover the destination; existing clients must
            // re-resolve.
            engine
                .update_cluster_discovery(&store.name, &src, &dest)
                .await?;
        }
        Ok(())
    }
}
