//! Parameterized store updates.
//!
//! All nullable options are applied in one fixed order under the store write
//! lock. If any sub-update is rejected, the pre-image of the store is
//! restored and the error re-raised, so a partially applied update is never
//! observable.

use tracing::{error, info};

use strata_core::{CompressionStrategy, HybridStoreConfig, Store};

use crate::engine::LifecycleEngine;
use crate::error::{ControllerError, Result};
use crate::resources::ClusterResources;

/// Nullable update options; `None` leaves the attribute untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateStoreParams {
    pub owner: Option<String>,
    pub readability: Option<bool>,
    pub writeability: Option<bool>,
    pub partition_count: Option<i32>,
    pub storage_quota_bytes: Option<i64>,
    pub read_quota_cu: Option<i64>,
    pub current_version: Option<i32>,
    pub largest_used_version_number: Option<i32>,
    pub hybrid_rewind_seconds: Option<i64>,
    pub hybrid_offset_lag_threshold: Option<i64>,
    pub access_controlled: Option<bool>,
    pub compression_strategy: Option<CompressionStrategy>,
    pub chunking_enabled: Option<bool>,
    pub single_get_router_cache_enabled: Option<bool>,
    pub batch_get_router_cache_enabled: Option<bool>,
    pub batch_get_limit: Option<i32>,
    pub num_versions_to_preserve: Option<i32>,
    pub incremental_push_enabled: Option<bool>,
    pub migrating: Option<bool>,
}

impl UpdateStoreParams {
    /// Copy the attributes of an existing store into update params, used to
    /// clone a store across clusters during migration.
    pub fn from_store(store: &Store) -> Self {
        Self {
            owner: Some(store.owner.clone()),
            readability: Some(store.enable_reads),
            writeability: Some(store.enable_writes),
            partition_count: Some(store.partition_count),
            storage_quota_bytes: Some(store.storage_quota_bytes),
            read_quota_cu: Some(store.read_quota_cu),
            current_version: None,
            largest_used_version_number: None,
            hybrid_rewind_seconds: store.hybrid_config.map(|h| h.rewind_seconds),
            hybrid_offset_lag_threshold: store.hybrid_config.map(|h| h.offset_lag_threshold),
            access_controlled: Some(store.access_controlled),
            compression_strategy: Some(store.compression_strategy),
            chunking_enabled: Some(store.chunking_enabled),
            single_get_router_cache_enabled: Some(store.single_get_router_cache_enabled),
            batch_get_router_cache_enabled: Some(store.batch_get_router_cache_enabled),
            batch_get_limit: Some(store.batch_get_limit),
            num_versions_to_preserve: Some(store.num_versions_to_preserve),
            incremental_push_enabled: Some(store.incremental_push_enabled),
            migrating: None,
        }
    }

    fn touches_only_migration_fields(&self) -> bool {
        self.owner.is_none()
            && self.partition_count.is_none()
            && self.storage_quota_bytes.is_none()
            && self.read_quota_cu.is_none()
            && self.current_version.is_none()
            && self.largest_used_version_number.is_none()
            && self.hybrid_rewind_seconds.is_none()
            && self.hybrid_offset_lag_threshold.is_none()
            && self.access_controlled.is_none()
            && self.compression_strategy.is_none()
            && self.chunking_enabled.is_none()
            && self.single_get_router_cache_enabled.is_none()
            && self.batch_get_router_cache_enabled.is_none()
            && self.batch_get_limit.is_none()
            && self.num_versions_to_preserve.is_none()
            && self.incremental_push_enabled.is_none()
    }
}

/// Merge requested hybrid settings into a store's existing hybrid config.
///
/// Returns `None` when nothing hybrid is requested and the store is not
/// hybrid. An existing hybrid store updates only the provided fields; a
/// non-hybrid store must provide both to become hybrid. There is no path
/// back from hybrid to non-hybrid.
pub(crate) fn merge_hybrid_config(
    store: &Store,
    rewind_seconds: Option<i64>,
    offset_lag_threshold: Option<i64>,
) -> Result<Option<HybridStoreConfig>> {
    if rewind_seconds.is_none() && offset_lag_threshold.is_none() && !store.is_hybrid() {
        return Ok(None);
    }
    match store.hybrid_config {
        Some(existing) => Ok(Some(HybridStoreConfig::new(
            rewind_seconds.unwrap_or(existing.rewind_seconds),
            offset_lag_threshold.unwrap_or(existing.offset_lag_threshold),
        ))),
        None => match (rewind_seconds, offset_lag_threshold) {
            (Some(rewind), Some(lag)) => Ok(Some(HybridStoreConfig::new(rewind, lag))),
            _ => Err(ControllerError::Conflict(format!(
                "store {} is not hybrid; both rewind seconds and offset lag threshold are required to make it hybrid",
                store.name
            ))),
        },
    }
}

impl LifecycleEngine {
    /// Apply a batch of attribute updates to a store.
    pub async fn update_store(
        &self,
        cluster: &str,
        store_name: &str,
        params: UpdateStoreParams,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;

        let original = self.store_required(cluster, store_name).await?;

        if original.migrating && !params.touches_only_migration_fields() {
            return Err(ControllerError::Conflict(format!(
                "store {store_name} is migrating; only migration, readability and writeability may change"
            )));
        }

        let hybrid_config = merge_hybrid_config(
            &original,
            params.hybrid_rewind_seconds,
            params.hybrid_offset_lag_threshold,
        )?;
        check_router_cache_conflicts(&original, &params, hybrid_config.is_some())?;

        match self.apply_updates(&res, store_name, &params, hybrid_config).await {
            Ok(()) => {
                info!(cluster = %cluster, store = %store_name, "Updated store");
                Ok(())
            }
            Err(e) => {
                error!(
                    cluster = %cluster,
                    store = %store_name,
                    error = %e,
                    "Store update failed, restoring the pre-image"
                );
                self.store_metadata_update(&res, store_name, |store| {
                    *store = original.clone();
                    Ok(())
                })
                .await?;
                Err(e)
            }
        }
    }

    async fn apply_updates(
        &self,
        res: &ClusterResources,
        store_name: &str,
        params: &UpdateStoreParams,
        hybrid_config: Option<HybridStoreConfig>,
    ) -> Result<()> {
        if let Some(owner) = &params.owner {
            self.store_metadata_update(res, store_name, |store| {
                store.owner = owner.clone();
                Ok(())
            })
            .await?;
        }
        if let Some(readable) = params.readability {
            self.store_metadata_update(res, store_name, |store| {
                store.enable_reads = readable;
                Ok(())
            })
            .await?;
        }
        if let Some(writeable) = params.writeability {
            self.store_metadata_update(res, store_name, |store| {
                store.enable_writes = writeable;
                Ok(())
            })
            .await?;
        }
        if let Some(partition_count) = params.partition_count {
            let (min, max) = (self.config.min_partitions, self.config.max_partitions);
            self.store_metadata_update(res, store_name, |store| {
                if store.is_hybrid() && store.partition_count != partition_count {
                    return Err(ControllerError::Conflict(format!(
                        "cannot change the partition count of hybrid store {store_name}"
                    )));
                }
                store.partition_count = partition_count.clamp(min, max);
                Ok(())
            })
            .await?;
        }
        if let Some(quota) = params.storage_quota_bytes {
            self.store_metadata_update(res, store_name, |store| {
                if quota < 0 && quota != Store::UNLIMITED_STORAGE_QUOTA {
                    return Err(ControllerError::Conflict(
                        "storage quota cannot be negative".to_string(),
                    ));
                }
                store.storage_quota_bytes = quota;
                Ok(())
            })
            .await?;
        }
        if let Some(quota) = params.read_quota_cu {
            self.store_metadata_update(res, store_name, |store| {
                if quota < 0 {
                    return Err(ControllerError::Conflict(
                        "read quota cannot be negative".to_string(),
                    ));
                }
                store.read_quota_cu = quota;
                Ok(())
            })
            .await?;
        }
        if let Some(current) = params.current_version {
            self.store_metadata_update(res, store_name, |store| {
                if store.current_version != Store::NON_EXISTING_VERSION {
                    if !store.contains_version(current) {
                        return Err(ControllerError::VersionNotFound {
                            store: store_name.to_string(),
                            version: current,
                        });
                    }
                    if !store.enable_writes {
                        return Err(ControllerError::Conflict(format!(
                            "cannot update the current version of store {store_name} while writes are disabled"
                        )));
                    }
                }
                store.current_version = current;
                Ok(())
            })
            .await?;
        }
        if let Some(largest) = params.largest_used_version_number {
            self.store_metadata_update(res, store_name, |store| {
                store.largest_used_version_number = largest;
                Ok(())
            })
            .await?;
        }
        if let Some(hybrid) = hybrid_config {
            self.store_metadata_update(res, store_name, |store| {
                if store.incremental_push_enabled {
                    return Err(ControllerError::Conflict(format!(
                        "incremental push store {store_name} cannot become hybrid"
                    )));
                }
                store.hybrid_config = Some(hybrid);
                Ok(())
            })
            .await?;
        }
        if let Some(enabled) = params.single_get_router_cache_enabled {
            self.store_metadata_update(res, store_name, |store| {
                store.single_get_router_cache_enabled = enabled;
                Ok(())
            })
            .await?;
        }
        if let Some(enabled) = params.batch_get_router_cache_enabled {
            self.store_metadata_update(res, store_name, |store| {
                store.batch_get_router_cache_enabled = enabled;
                Ok(())
            })
            .await?;
        }
        if let Some(enabled) = params.access_controlled {
            self.store_metadata_update(res, store_name, |store| {
                store.access_controlled = enabled;
                Ok(())
            })
            .await?;
        }
        if let Some(strategy) = params.compression_strategy {
            self.store_metadata_update(res, store_name, |store| {
                store.compression_strategy = strategy;
                Ok(())
            })
            .await?;
        }
        if let Some(enabled) = params.chunking_enabled {
            self.store_metadata_update(res, store_name, |store| {
                store.chunking_enabled = enabled;
                Ok(())
            })
            .await?;
        }
        if let Some(limit) = params.batch_get_limit {
            self.store_metadata_update(res, store_name, |store| {
                store.batch_get_limit = limit;
                Ok(())
            })
            .await?;
        }
        if let Some(count) = params.num_versions_to_preserve {
            self.store_metadata_update(res, store_name, |store| {
                store.num_versions_to_preserve = count;
                Ok(())
            })
            .await?;
        }
        if let Some(enabled) = params.incremental_push_enabled {
            self.store_metadata_update(res, store_name, |store| {
                if enabled && store.is_hybrid() {
                    return Err(ControllerError::Conflict(format!(
                        "hybrid store {store_name} does not support incremental push"
                    )));
                }
                store.incremental_push_enabled = enabled;
                Ok(())
            })
            .await?;
        }
        if let Some(migrating) = params.migrating {
            self.store_metadata_update(res, store_name, |store| {
                store.migrating = migrating;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }
}

/// Router caching and streaming ingestion are mutually exclusive in both
/// directions.
fn check_router_cache_conflicts(
    store: &Store,
    params: &UpdateStoreParams,
    hybrid_requested: bool,
) -> Result<()> {
    let enabling_cache = params.single_get_router_cache_enabled.unwrap_or(false)
        || params.batch_get_router_cache_enabled.unwrap_or(false);
    if (store.is_hybrid() || store.incremental_push_enabled) && enabling_cache {
        return Err(ControllerError::Conflict(format!(
            "router cache cannot be enabled for hybrid/incremental-push store {}",
            store.name
        )));
    }
    let cache_on = store.single_get_router_cache_enabled || store.batch_get_router_cache_enabled;
    if cache_on && (hybrid_requested || params.incremental_push_enabled.unwrap_or(false)) {
        return Err(ControllerError::Conflict(format!(
            "hybrid/incremental push cannot be enabled for store {} while router cache is on",
            store.name
        )));
    }
    Ok(())
}
