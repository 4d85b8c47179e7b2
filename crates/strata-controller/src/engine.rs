//! The store lifecycle engine: the single mutator of cluster metadata.
//!
//! Every operation runs on the cluster's admin leader, under the per-cluster
//! metadata operation lock plus the store-repository lock around each
//! read-modify-CAS cycle. Operations on one store are therefore totally
//! ordered; operations across stores in one cluster serialize on the
//! metadata lock; nothing is ordered across clusters.
//!
//! Multi-location mutations (store registry, coordinator resources, bus
//! topics, schemas, discovery) are not transactional. Each operation orders
//! its steps so that a failure part-way leaves a state a later operation can
//! converge from, and version creation carries an explicit compensation path
//! (`handle_version_creation_failure`).

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use strata_cluster::{
    ClusterManagerConfig, MastershipController, ParticipantMessage, Rebalancer, ReplicaState,
    ResourceCoordinator, ResourceSpec, StateModel,
};
use strata_core::{now_ms, topics, Store, StoreConfig, Version, VersionStatus};
use strata_metadata::{MetadataError, MetadataStore};
use strata_topics::{TopicError, TopicManager, TopicWriter};

use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::resources::{ClusterRegistry, ClusterResources};

const MAX_CAS_RETRIES: usize = 3;

/// Replication health of a store's serving version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    FullyReplicated,
    UnderReplicated,
    Degraded,
    Unavailable,
}

impl std::fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StoreStatus::FullyReplicated => "FULLY_REPLICATED",
            StoreStatus::UnderReplicated => "UNDER_REPLICATED",
            StoreStatus::Degraded => "DEGRADED",
            StoreStatus::Unavailable => "UNAVAILABLE",
        };
        write!(f, "{s}")
    }
}

pub struct LifecycleEngine {
    pub(crate) config: ControllerConfig,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) topics: Arc<dyn TopicManager>,
    pub(crate) writer: TopicWriter,
    pub(crate) coordinator: Arc<dyn ResourceCoordinator>,
    pub(crate) mastership: Arc<MastershipController>,
    pub(crate) registry: ClusterRegistry,
    /// Last error retained per cluster for diagnostics.
    last_errors: StdMutex<HashMap<String, String>>,
    /// Admin-channel offsets flagged to be skipped, per cluster.
    admin_offsets_to_skip: StdMutex<HashMap<String, i64>>,
}

impl LifecycleEngine {
    pub fn new(
        config: ControllerConfig,
        metadata: Arc<dyn MetadataStore>,
        topics: Arc<dyn TopicManager>,
        writer: TopicWriter,
        coordinator: Arc<dyn ResourceCoordinator>,
        mastership: Arc<MastershipController>,
    ) -> Self {
        Self {
            config,
            metadata,
            topics,
            writer,
            coordinator,
            mastership,
            registry: ClusterRegistry::new(),
            last_errors: StdMutex::new(HashMap::new()),
            admin_offsets_to_skip: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // ---- cluster lifecycle ----

    /// Register the cluster, join it as a leader candidate, and build the
    /// per-cluster resources once leadership is held.
    pub async fn start_cluster(&self, cluster: &str) -> Result<()> {
        let manager_config = ClusterManagerConfig {
            auto_join: true,
            topology_constraint: Some(self.config.topology_constraint.clone()),
            delayed_rebalance_ms: self.config.delayed_rebalance_ms,
        };
        self.mastership.ensure_meta_cluster().await?;
        self.mastership.register_cluster(cluster, &manager_config).await?;
        self.mastership.start(cluster).await?;
        self.registry.install(cluster).await;
        Ok(())
    }

    /// Tear down the per-cluster resources and hand leadership back.
    pub async fn stop_cluster(&self, cluster: &str) -> Result<()> {
        self.registry.remove(cluster).await;
        self.mastership.stop(cluster).await?;
        Ok(())
    }

    pub async fn is_leader(&self, cluster: &str) -> bool {
        self.mastership.is_leader(cluster).await
    }

    pub(crate) async fn require_leader(&self, cluster: &str) -> Result<Arc<ClusterResources>> {
        if !self.mastership.is_leader(cluster).await {
            return Err(ControllerError::NotLeader {
                cluster: cluster.to_string(),
                controller: self.mastership.controller_id().to_string(),
            });
        }
        self.registry.get(cluster).await
    }

    // ---- shared store plumbing ----

    /// Read -> mutate -> CAS-persist cycle under the repository lock,
    /// retrying a bounded number of times when the row moved underneath us.
    /// Returns the persisted store.
    pub(crate) async fn store_metadata_update<F>(
        &self,
        res: &ClusterResources,
        name: &str,
        mut mutate: F,
    ) -> Result<Store>
    where
        F: FnMut(&mut Store) -> Result<()>,
    {
        for attempt in 0..MAX_CAS_RETRIES {
            let _repo = res.repository_lock.lock().await;
            let versioned = self
                .metadata
                .load_store(&res.cluster, name)
                .await?
                .ok_or_else(|| ControllerError::StoreNotFound(name.to_string()))?;
            let mut store = versioned.store;
            mutate(&mut store)?;
            match self
                .metadata
                .update_store(&res.cluster, &store, versioned.row_version)
                .await
            {
                Ok(_) => return Ok(store),
                Err(MetadataError::ConcurrentUpdate(_)) if attempt + 1 < MAX_CAS_RETRIES => {
                    warn!(
                        cluster = %res.cluster,
                        store = %name,
                        attempt,
                        "Store row moved during update, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControllerError::Fatal(format!(
            "store {name} kept moving during update, giving up after {MAX_CAS_RETRIES} attempts"
        )))
    }

    pub(crate) async fn store_required(&self, cluster: &str, name: &str) -> Result<Store> {
        self.metadata
            .get_store(cluster, name)
            .await?
            .ok_or_else(|| ControllerError::StoreNotFound(name.to_string()))
    }

    // ---- store creation ----

    pub async fn create_store(
        &self,
        cluster: &str,
        name: &str,
        owner: &str,
        key_schema: &str,
        value_schema: &str,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.create_store_inner(&res, name, owner, key_schema, value_schema)
            .await
    }

    pub(crate) async fn create_store_inner(
        &self,
        res: &ClusterResources,
        name: &str,
        owner: &str,
        key_schema: &str,
        value_schema: &str,
    ) -> Result<()> {
        let cluster = res.cluster.clone();
        info!(cluster = %cluster, store = %name, "Creating store");
        check_store_name(name)?;
        strata_metadata::schema::parse(key_schema)?;
        strata_metadata::schema::parse(value_schema)?;

        // A discovery row flagged `deleting` marks a store whose deletion
        // failed part-way; creation finishes the cleanup and proceeds.
        let legacy = match self.metadata.get_store_config(name).await? {
            Some(config) if !config.deleting => {
                return Err(ControllerError::StoreAlreadyExists(name.to_string()));
            }
            Some(_) => true,
            None => false,
        };

        if self.metadata.has_store(&cluster, name).await? {
            if !legacy {
                return Err(ControllerError::StoreAlreadyExists(name.to_string()));
            }
            info!(cluster = %cluster, store = %name, "Removing legacy store left by a failed deletion");
            self.delete_store_inner(res, name, Store::IGNORE_VERSION).await?;
        }

        let largest_used = self.metadata.largest_used_version_from_graveyard(name).await?;
        let mut store = Store::new(name, owner, now_ms());
        store.largest_used_version_number = largest_used;
        {
            let _repo = res.repository_lock.lock().await;
            self.metadata.add_store(&cluster, &store).await?;
            self.metadata
                .put_store_config(&StoreConfig::new(name, &cluster))
                .await?;
        }

        self.metadata.init_key_schema(&cluster, name, key_schema).await?;
        self.metadata.add_value_schema(&cluster, name, value_schema).await?;
        info!(
            cluster = %cluster,
            store = %name,
            largest_used_version = largest_used,
            "Created store"
        );
        Ok(())
    }

    // ---- version creation ----

    /// Append a new version in `Started` state, create its topic and
    /// resource, and optionally begin monitoring the push. On any failure
    /// after the version is persisted the compensation path marks the push
    /// as errored and deletes the version before re-raising.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_version(
        &self,
        cluster: &str,
        store_name: &str,
        push_job_id: &str,
        number_hint: Option<i32>,
        partition_count: i32,
        replication_factor: i32,
        start_monitor: bool,
        send_start_of_push: bool,
    ) -> Result<Version> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.add_version_inner(
            &res,
            store_name,
            push_job_id,
            number_hint,
            partition_count,
            replication_factor,
            start_monitor,
            send_start_of_push,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn add_version_inner(
        &self,
        res: &ClusterResources,
        store_name: &str,
        push_job_id: &str,
        number_hint: Option<i32>,
        partition_count: i32,
        replication_factor: i32,
        start_monitor: bool,
        send_start_of_push: bool,
    ) -> Result<Version> {
        match self
            .try_add_version(
                res,
                store_name,
                push_job_id,
                number_hint,
                partition_count,
                replication_factor,
                start_monitor,
                send_start_of_push,
            )
            .await
        {
            Ok(version) => Ok(version),
            Err((Some(version), e)) => {
                let details = format!("Version creation failure: {e}");
                if let Err(cleanup_err) = self
                    .handle_version_creation_failure(res, store_name, version.number, &details)
                    .await
                {
                    error!(
                        cluster = %res.cluster,
                        store = %store_name,
                        version = version.number,
                        error = %cleanup_err,
                        "Compensation after version creation failure also failed"
                    );
                }
                Err(e)
            }
            Err((None, e)) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_add_version(
        &self,
        res: &ClusterResources,
        store_name: &str,
        push_job_id: &str,
        number_hint: Option<i32>,
        partition_count: i32,
        replication_factor: i32,
        start_monitor: bool,
        send_start_of_push: bool,
    ) -> std::result::Result<Version, (Option<Version>, ControllerError)> {
        let cluster = res.cluster.clone();
        let mut created: Option<Version> = None;

        // Step 1: persist the version in Started state under the store lock.
        let updated = self
            .store_metadata_update(res, store_name, |store| {
                let mut version = match number_hint {
                    None => store.increase_version(push_job_id),
                    Some(number) => {
                        if store.contains_version(number) {
                            return Err(ControllerError::VersionAlreadyExists {
                                store: store_name.to_string(),
                                version: number,
                            });
                        }
                        let v = Version::new(store_name, number, push_job_id);
                        store.add_version(v.clone());
                        v
                    }
                };
                if store.partition_count == 0 {
                    store.partition_count = partition_count
                        .clamp(self.config.min_partitions, self.config.max_partitions);
                }
                version.partition_count = store.partition_count;
                version.replication_factor = replication_factor;
                if let Some(persisted) = store.version_mut(version.number) {
                    persisted.partition_count = version.partition_count;
                    persisted.replication_factor = version.replication_factor;
                }
                created = Some(version);
                Ok(())
            })
            .await
            .map_err(|e| (None, e))?;

        let Some(version) = created.clone() else {
            return Err((
                None,
                ControllerError::Fatal(format!(
                    "no version recorded while adding one to store {store_name}"
                )),
            ));
        };
        let topic = version.topic_name();
        let topic_partitions = updated.partition_count;
        info!(
            cluster = %cluster,
            store = %store_name,
            version = version.number,
            topic = %topic,
            "Added version"
        );

        let fail = |e: ControllerError| (Some(version.clone()), e);

        // Step 2: the version topic (idempotent for retried pushes).
        match self
            .topics
            .create_topic(
                &topic,
                topic_partitions,
                replication_factor,
                Some(self.config.version_topic_retention_ms),
            )
            .await
        {
            Ok(()) | Err(TopicError::TopicAlreadyExists(_)) => {}
            Err(e) => return Err(fail(e.into())),
        }

        if send_start_of_push {
            self.writer
                .broadcast_start_of_push(&topic)
                .await
                .map_err(|e| fail(e.into()))?;
        }

        if start_monitor {
            // Monitoring must be in place before the resource exists, so no
            // replica report can race it.
            res.push_monitor
                .start_monitor(&topic, topic_partitions, replication_factor)
                .await;
            let spec = ResourceSpec {
                name: topic.clone(),
                partition_count: topic_partitions,
                replication_factor,
                state_model: StateModel::OnlineOffline,
                rebalancer: Rebalancer::DelayedAuto,
                min_active_replicas: self.config.min_active_replicas.min(replication_factor),
            };
            self.coordinator
                .add_resource(&cluster, &spec)
                .await
                .map_err(|e| fail(e.into()))?;
            self.coordinator
                .wait_for_assignment(
                    &cluster,
                    &topic,
                    replication_factor,
                    Duration::from_millis(self.config.offline_push_wait_ms),
                )
                .await
                .map_err(|e| fail(e.into()))?;
        }

        Ok(version)
    }

    pub(crate) async fn handle_version_creation_failure(
        &self,
        res: &ClusterResources,
        store_name: &str,
        version_number: i32,
        details: &str,
    ) -> Result<()> {
        let topic = topics::compose_version_topic(store_name, version_number);
        res.push_monitor.mark_error(&topic, details).await;
        self.delete_one_store_version_inner(res, store_name, version_number).await
    }

    /// Add a version for a push that carries no job id of its own (manual
    /// repushes, tooling): a unique id is generated, so idempotence is not
    /// provided.
    pub async fn add_version_with_generated_id(
        &self,
        cluster: &str,
        store_name: &str,
        number_hint: Option<i32>,
        partition_count: i32,
        replication_factor: i32,
    ) -> Result<Version> {
        let push_job_id = format!("push-{}", uuid::Uuid::new_v4());
        self.add_version(
            cluster,
            store_name,
            &push_job_id,
            number_hint,
            partition_count,
            replication_factor,
            true,
            false,
        )
        .await
    }

    /// The only entry point guaranteeing at most one version per push id:
    /// a repeated push job gets its existing version back.
    #[allow(clippy::too_many_arguments)]
    pub async fn increment_version_idempotent(
        &self,
        cluster: &str,
        store_name: &str,
        push_job_id: &str,
        partition_count: i32,
        replication_factor: i32,
        offline_push: bool,
        incremental_push: bool,
        send_start_of_push: bool,
    ) -> Result<Version> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;

        let store = self.store_required(cluster, store_name).await?;
        if let Some(existing) = store.versions.iter().find(|v| v.push_job_id == push_job_id) {
            info!(
                store = %store_name,
                push_job_id = %push_job_id,
                version = existing.number,
                "Push id already has a version, returning it"
            );
            return Ok(existing.clone());
        }

        if incremental_push {
            self.incremental_push_version_for(&store)
        } else {
            self.add_version_inner(
                &res,
                store_name,
                push_job_id,
                None,
                partition_count,
                replication_factor,
                offline_push,
                send_start_of_push,
            )
            .await
        }
    }

    /// The version the in-flight push is writing to, if any. See
    /// [`started_version`] for the rules.
    pub async fn get_started_version(
        &self,
        cluster: &str,
        store_name: &str,
    ) -> Result<Option<Version>> {
        self.require_leader(cluster).await?;
        let store = self.store_required(cluster, store_name).await?;
        started_version(&store)
    }

    /// The version an incremental push should write into: the latest one,
    /// which must not be errored.
    pub async fn get_incremental_push_version(
        &self,
        cluster: &str,
        store_name: &str,
    ) -> Result<Version> {
        self.require_leader(cluster).await?;
        let store = self.store_required(cluster, store_name).await?;
        self.incremental_push_version_for(&store)
    }

    fn incremental_push_version_for(&self, store: &Store) -> Result<Version> {
        if !store.incremental_push_enabled {
            return Err(ControllerError::Conflict(format!(
                "incremental push is not enabled for store {}",
                store.name
            )));
        }
        let latest = store.versions.last().ok_or_else(|| {
            ControllerError::Conflict(format!(
                "store {} is not initialized with a version yet",
                store.name
            ))
        })?;
        if latest.status == VersionStatus::Error {
            return Err(ControllerError::Conflict(format!(
                "cannot run an incremental push against errored version {} of store {}",
                latest.number, store.name
            )));
        }
        Ok(latest.clone())
    }

    // ---- push progression ----

    /// Record that the push job finished writing its data: the end-of-push
    /// marker is framed on the version topic and the version moves
    /// `Started -> Pushed`. It starts serving only after
    /// [`LifecycleEngine::on_push_completed`] confirms its replicas.
    pub async fn on_push_job_completed(
        &self,
        cluster: &str,
        store_name: &str,
        version_number: i32,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        let topic = topics::compose_version_topic(store_name, version_number);

        let store = self.store_required(cluster, store_name).await?;
        match store.version_status(version_number) {
            VersionStatus::Started => {}
            VersionStatus::Pushed => return Ok(()),
            VersionStatus::NotCreated => {
                return Err(ControllerError::VersionNotFound {
                    store: store_name.to_string(),
                    version: version_number,
                });
            }
            status => {
                return Err(ControllerError::Conflict(format!(
                    "version {version_number} of store {store_name} is {status}, cannot record end of push"
                )));
            }
        }

        self.writer.broadcast_end_of_push(&topic).await?;
        self.store_metadata_update(&res, store_name, |store| {
            if let Some(version) = store.version_mut(version_number) {
                version.status = VersionStatus::Pushed;
            }
            Ok(())
        })
        .await?;
        info!(
            cluster = %cluster,
            store = %store_name,
            version = version_number,
            "Push job completed, waiting for replicas"
        );
        Ok(())
    }

    /// Promote a pushed version to `Online` once the coordinator's external
    /// view shows its partitions serving: the version becomes current when
    /// newer than the serving one, and hybrid stores begin buffer replay
    /// from their real-time topic.
    pub async fn on_push_completed(
        &self,
        cluster: &str,
        store_name: &str,
        version_number: i32,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        let topic = topics::compose_version_topic(store_name, version_number);

        let store = self.store_required(cluster, store_name).await?;
        let version = store
            .version(version_number)
            .ok_or(ControllerError::VersionNotFound {
                store: store_name.to_string(),
                version: version_number,
            })?;
        match version.status {
            VersionStatus::Online => return Ok(()),
            VersionStatus::Pushed => {}
            status => {
                return Err(ControllerError::Conflict(format!(
                    "version {version_number} of store {store_name} is {status}; record end of push before bringing it online"
                )));
            }
        }
        self.check_version_ready_to_serve(cluster, version).await?;

        let updated = self
            .store_metadata_update(&res, store_name, |store| {
                if let Some(version) = store.version_mut(version_number) {
                    version.status = VersionStatus::Online;
                }
                if version_number > store.current_version {
                    store.current_version = version_number;
                }
                Ok(())
            })
            .await?;

        res.push_monitor.mark_completed(&topic).await;
        if updated.is_hybrid() && !updated.migrating {
            res.push_monitor
                .start_buffer_replay(&topics::compose_real_time_topic(store_name), &topic)
                .await;
        }
        info!(cluster = %cluster, store = %store_name, version = version_number, "Version online");
        Ok(())
    }

    /// A version may serve once every partition holds one less than its
    /// replication factor in online replicas (at least one).
    async fn check_version_ready_to_serve(&self, cluster: &str, version: &Version) -> Result<()> {
        let resource = version.topic_name();
        let view = self.coordinator.read_external_view(cluster, &resource).await?;
        let required = (version.replication_factor - 1).max(1) as usize;
        for partition in 0..version.partition_count {
            let online = view
                .partitions
                .get(&partition)
                .map(|replicas| {
                    replicas
                        .values()
                        .filter(|s| **s == ReplicaState::Online)
                        .count()
                })
                .unwrap_or(0);
            if online < required {
                return Err(ControllerError::Conflict(format!(
                    "partition {partition} of {resource} has {online} online replicas, needs {required}"
                )));
            }
        }
        Ok(())
    }

    /// Record a failed push: the version goes `Error` and monitoring stops.
    pub async fn on_push_failed(
        &self,
        cluster: &str,
        store_name: &str,
        version_number: i32,
        details: &str,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        let topic = topics::compose_version_topic(store_name, version_number);

        self.store_metadata_update(&res, store_name, |store| {
            if let Some(version) = store.version_mut(version_number) {
                version.status = VersionStatus::Error;
            }
            Ok(())
        })
        .await?;
        res.push_monitor.mark_error(&topic, details).await;
        Ok(())
    }

    // ---- real-time topics ----

    /// Resolve (creating if needed) the real-time topic of a hybrid store.
    pub async fn ensure_real_time_topic(&self, cluster: &str, store_name: &str) -> Result<String> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;

        let topic = topics::compose_real_time_topic(store_name);
        if self.topics.contains_topic(&topic).await? {
            return Ok(topic);
        }

        let store = self.store_required(cluster, store_name).await?;
        if !store.is_hybrid() {
            return Err(ControllerError::Conflict(format!(
                "store {store_name} is not hybrid, refusing to create a real-time topic"
            )));
        }
        if store.partition_count == 0 {
            return Err(ControllerError::Conflict(format!(
                "store {store_name} is not initialized with a version yet"
            )));
        }

        self.topics
            .create_topic(
                &topic,
                store.partition_count,
                self.config.replication_factor,
                None,
            )
            .await?;
        warn!(
            store = %store_name,
            topic = %topic,
            "Created real-time topic on demand; buffer replay only starts for future versions"
        );
        Ok(topic)
    }

    // ---- push framing ----

    /// Write the end-of-push marker (optionally preceded by start-of-push)
    /// to a version topic.
    pub async fn write_end_of_push(
        &self,
        cluster: &str,
        store_name: &str,
        version_number: i32,
        also_write_start_of_push: bool,
    ) -> Result<()> {
        self.require_leader(cluster).await?;
        let store = self.store_required(cluster, store_name).await?;
        if store.current_version == version_number {
            return Err(ControllerError::Conflict(format!(
                "cannot end push for version {version_number} of store {store_name}: it is currently serving"
            )));
        }
        if !store.contains_version(version_number) {
            return Err(ControllerError::VersionNotFound {
                store: store_name.to_string(),
                version: version_number,
            });
        }
        let topic = topics::compose_version_topic(store_name, version_number);
        if also_write_start_of_push {
            self.writer.broadcast_start_of_push(&topic).await?;
        }
        self.writer.broadcast_end_of_push(&topic).await?;
        Ok(())
    }

    /// Broadcast a kill for an in-flight push to the cluster's participants.
    pub async fn kill_offline_push(&self, cluster: &str, topic: &str) -> Result<()> {
        self.require_leader(cluster).await?;
        self.coordinator
            .send_message_to_participants(
                cluster,
                &ParticipantMessage::KillPush {
                    resource: topic.to_string(),
                },
                1,
            )
            .await?;
        Ok(())
    }

    // ---- store attribute setters ----

    pub async fn set_store_current_version(
        &self,
        cluster: &str,
        store_name: &str,
        version_number: i32,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.store_metadata_update(&res, store_name, |store| {
            if store.current_version != Store::NON_EXISTING_VERSION {
                if !store.contains_version(version_number) {
                    return Err(ControllerError::VersionNotFound {
                        store: store_name.to_string(),
                        version: version_number,
                    });
                }
                if !store.enable_writes {
                    return Err(ControllerError::Conflict(format!(
                        "cannot update the current version of store {store_name} while writes are disabled"
                    )));
                }
            }
            store.current_version = version_number;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_store_largest_used_version(
        &self,
        cluster: &str,
        store_name: &str,
        version_number: i32,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.store_metadata_update(&res, store_name, |store| {
            store.largest_used_version_number = version_number;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_store_owner(&self, cluster: &str, store_name: &str, owner: &str) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.store_metadata_update(&res, store_name, |store| {
            store.owner = owner.to_string();
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_store_readability(
        &self,
        cluster: &str,
        store_name: &str,
        readable: bool,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.store_metadata_update(&res, store_name, |store| {
            store.enable_reads = readable;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_store_writeability(
        &self,
        cluster: &str,
        store_name: &str,
        writeable: bool,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.store_metadata_update(&res, store_name, |store| {
            store.enable_writes = writeable;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_store_read_writeability(
        &self,
        cluster: &str,
        store_name: &str,
        accessible: bool,
    ) -> Result<()> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.write().await;
        self.store_metadata_update(&res, store_name, |store| {
            store.enable_reads = accessible;
            store.enable_writes = accessible;
            Ok(())
        })
        .await?;
        Ok(())
    }

    // ---- queries ----

    pub async fn get_store(&self, cluster: &str, store_name: &str) -> Result<Option<Store>> {
        self.require_leader(cluster).await?;
        Ok(self.metadata.get_store(cluster, store_name).await?)
    }

    pub async fn has_store(&self, cluster: &str, store_name: &str) -> Result<bool> {
        self.require_leader(cluster).await?;
        Ok(self.metadata.has_store(cluster, store_name).await?)
    }

    pub async fn get_all_stores(&self, cluster: &str) -> Result<Vec<Store>> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.read().await;
        Ok(self.metadata.list_stores(cluster).await?)
    }

    pub async fn versions_for_store(&self, cluster: &str, store_name: &str) -> Result<Vec<Version>> {
        self.require_leader(cluster).await?;
        Ok(self.store_required(cluster, store_name).await?.versions)
    }

    /// The serving version, or `NON_EXISTING_VERSION` while reads are
    /// disabled.
    pub async fn get_current_version(&self, cluster: &str, store_name: &str) -> Result<i32> {
        self.require_leader(cluster).await?;
        let store = self.store_required(cluster, store_name).await?;
        Ok(if store.enable_reads {
            store.current_version
        } else {
            Store::NON_EXISTING_VERSION
        })
    }

    /// Child controllers have no cross-fabric view; callers needing one must
    /// route to the parent controller.
    pub async fn get_current_versions_for_multi_colos(
        &self,
        _cluster: &str,
        _store_name: &str,
    ) -> HashMap<String, i32> {
        HashMap::new()
    }

    pub async fn peek_next_version(&self, cluster: &str, store_name: &str) -> Result<Version> {
        self.require_leader(cluster).await?;
        Ok(self.store_required(cluster, store_name).await?.peek_next_version())
    }

    /// Clusters led by this controller that hold the store. More than one
    /// match is expected only mid-migration.
    pub async fn clusters_of_store_in_leader(&self, store_name: &str) -> Result<Vec<String>> {
        let mut matching = Vec::new();
        for cluster in self.registry.installed().await {
            if self.mastership.is_leader(&cluster).await
                && self.metadata.has_store(&cluster, store_name).await?
            {
                matching.push(cluster);
            }
        }
        if matching.len() > 2 {
            warn!(
                store = %store_name,
                clusters = ?matching,
                "Store found in more than two clusters"
            );
        }
        Ok(matching)
    }

    /// Resolve the authoritative cluster and its d2 service for a store.
    pub async fn discover_cluster(&self, store_name: &str) -> Result<(String, String)> {
        let config = self
            .metadata
            .get_store_config(store_name)
            .await?
            .ok_or_else(|| ControllerError::StoreNotFound(store_name.to_string()))?;
        let d2 = self
            .config
            .cluster_to_d2
            .get(&config.cluster)
            .ok_or_else(|| {
                ControllerError::ClusterNotInitialized(format!(
                    "no d2 service configured for cluster {}",
                    config.cluster
                ))
            })?;
        Ok((config.cluster, d2.clone()))
    }

    /// Whether the coordinator still holds a resource for a (possibly
    /// deprecated) version topic.
    pub async fn is_resource_still_alive(&self, resource: &str) -> Result<bool> {
        let Some(store_name) = topics::parse_store_from_version_topic(resource) else {
            return Err(ControllerError::Conflict(format!(
                "resource name {resource} is not a valid store version"
            )));
        };
        let Some(config) = self.metadata.get_store_config(store_name).await? else {
            info!(
                store = %store_name,
                resource = %resource,
                "No discovery row, treating resource as deprecated"
            );
            return Ok(false);
        };
        Ok(self.coordinator.has_resource(&config.cluster, resource).await?)
    }

    /// Replication health of every store's serving version.
    pub async fn get_all_store_statuses(&self, cluster: &str) -> Result<HashMap<String, StoreStatus>> {
        let res = self.require_leader(cluster).await?;
        let _lock = res.metadata_lock.read().await;

        let mut statuses = HashMap::new();
        for store in self.metadata.list_stores(cluster).await? {
            let status = if store.current_version == Store::NON_EXISTING_VERSION {
                StoreStatus::Unavailable
            } else {
                let resource =
                    topics::compose_version_topic(&store.name, store.current_version);
                let view = self.coordinator.read_external_view(cluster, &resource).await?;
                let mut online_counts: Vec<usize> = Vec::new();
                for partition in 0..store.partition_count {
                    let online = view
                        .partitions
                        .get(&partition)
                        .map(|replicas| {
                            replicas
                                .values()
                                .filter(|s| **s == ReplicaState::Online)
                                .count()
                        })
                        .unwrap_or(0);
                    online_counts.push(online);
                }
                // The serving version carries its own replication factor,
                // chosen at push time; the cluster default only covers
                // versions predating that field.
                let required = store
                    .version(store.current_version)
                    .map(|v| v.replication_factor)
                    .filter(|rf| *rf > 0)
                    .unwrap_or(self.config.replication_factor)
                    as usize;
                if online_counts.iter().any(|c| *c == 0) {
                    StoreStatus::Degraded
                } else if online_counts.iter().all(|c| *c >= required) {
                    StoreStatus::FullyReplicated
                } else {
                    StoreStatus::UnderReplicated
                }
            };
            statuses.insert(store.name.clone(), status);
        }
        Ok(statuses)
    }

    // ---- schemas ----

    pub async fn get_key_schema(
        &self,
        cluster: &str,
        store_name: &str,
    ) -> Result<Option<strata_metadata::SchemaEntry>> {
        self.require_leader(cluster).await?;
        Ok(self.metadata.key_schema(cluster, store_name).await?)
    }

    pub async fn get_value_schemas(
        &self,
        cluster: &str,
        store_name: &str,
    ) -> Result<Vec<strata_metadata::SchemaEntry>> {
        self.require_leader(cluster).await?;
        Ok(self.metadata.value_schemas(cluster, store_name).await?)
    }

    pub async fn add_value_schema(
        &self,
        cluster: &str,
        store_name: &str,
        schema: &str,
    ) -> Result<strata_metadata::SchemaEntry> {
        self.require_leader(cluster).await?;
        if !self.metadata.has_store(cluster, store_name).await? {
            return Err(ControllerError::StoreNotFound(store_name.to_string()));
        }
        Ok(self.metadata.add_value_schema(cluster, store_name, schema).await?)
    }

    pub async fn get_value_schema_id(
        &self,
        cluster: &str,
        store_name: &str,
        schema: &str,
    ) -> Result<Option<i32>> {
        self.require_leader(cluster).await?;
        Ok(self.metadata.value_schema_id(cluster, store_name, schema).await?)
    }

    // ---- sizing ----

    /// Partition count a first push of `store_size_bytes` should use. Sticky
    /// once the store has one.
    pub async fn calculate_number_of_partitions(
        &self,
        cluster: &str,
        store_name: &str,
        store_size_bytes: i64,
    ) -> Result<i32> {
        self.require_leader(cluster).await?;
        let store = self.store_required(cluster, store_name).await?;
        if store.partition_count != 0 {
            return Ok(store.partition_count);
        }
        Ok(self.config.calculate_partition_count(store_size_bytes))
    }

    pub fn get_replication_factor(&self, _cluster: &str, _store_name: &str) -> i32 {
        self.config.replication_factor
    }

    // ---- transport security ----

    pub fn is_ssl_to_bus(&self) -> bool {
        self.config.ssl_to_bus
    }

    /// Whether a push to this store must use the TLS bus endpoint, applying
    /// the offline/nearline allowlists.
    pub async fn is_ssl_enabled_for_push(&self, cluster: &str, store_name: &str) -> Result<bool> {
        if !self.config.ssl_to_bus {
            return Ok(false);
        }
        let store = self.store_required(cluster, store_name).await?;
        let (allowlist_enabled, allowlisted) = if store.is_hybrid() {
            (
                self.config.enable_nearline_push_ssl_allowlist,
                self.config.push_ssl_allowlist.iter().any(|s| s == store_name),
            )
        } else {
            (
                self.config.enable_offline_push_ssl_allowlist,
                self.config.push_ssl_allowlist.iter().any(|s| s == store_name),
            )
        };
        Ok(!allowlist_enabled || allowlisted)
    }

    // ---- storage nodes ----

    pub async fn get_storage_nodes(&self, cluster: &str) -> Result<Vec<String>> {
        self.require_leader(cluster).await?;
        Ok(self.coordinator.instances_in_cluster(cluster).await?)
    }

    pub async fn get_storage_nodes_status(&self, cluster: &str) -> Result<HashMap<String, String>> {
        self.require_leader(cluster).await?;
        let live = self.coordinator.live_instances(cluster).await?;
        let mut statuses = HashMap::new();
        for instance in self.coordinator.instances_in_cluster(cluster).await? {
            let status = if live.contains(&instance) {
                "CONNECTED"
            } else {
                "DISCONNECTED"
            };
            statuses.insert(instance, status.to_string());
        }
        Ok(statuses)
    }

    /// Remove a storage node from the allowlist and the cluster. Refuses
    /// while the node is still connected.
    pub async fn remove_storage_node(&self, cluster: &str, instance_id: &str) -> Result<()> {
        self.require_leader(cluster).await?;
        info!(cluster = %cluster, instance = %instance_id, "Removing storage node");
        self.coordinator
            .remove_instance_from_allowlist(cluster, instance_id)
            .await?;
        self.coordinator.drop_instance(cluster, instance_id).await?;
        Ok(())
    }

    pub async fn add_instance_to_allowlist(&self, cluster: &str, instance_id: &str) -> Result<()> {
        self.require_leader(cluster).await?;
        Ok(self.coordinator.add_instance_to_allowlist(cluster, instance_id).await?)
    }

    pub async fn remove_instance_from_allowlist(
        &self,
        cluster: &str,
        instance_id: &str,
    ) -> Result<()> {
        self.require_leader(cluster).await?;
        Ok(self
            .coordinator
            .remove_instance_from_allowlist(cluster, instance_id)
            .await?)
    }

    pub async fn get_allowlist(&self, cluster: &str) -> Result<std::collections::HashSet<String>> {
        self.require_leader(cluster).await?;
        Ok(self.coordinator.allowlist(cluster).await?)
    }

    // ---- admin channel bookkeeping ----

    pub async fn get_last_succeeded_execution_id(&self, cluster: &str) -> Result<i64> {
        Ok(self.metadata.last_succeeded_execution_id(cluster).await?)
    }

    pub async fn update_execution_id(&self, cluster: &str, execution_id: i64) -> Result<()> {
        Ok(self.metadata.update_execution_id(cluster, execution_id).await?)
    }

    /// Flag an admin-channel offset to be skipped by the cluster's consumer.
    pub fn skip_admin_message(&self, cluster: &str, offset: i64) {
        self.admin_offsets_to_skip
            .lock()
            .expect("admin offset map poisoned")
            .insert(cluster.to_string(), offset);
        info!(cluster = %cluster, offset, "Flagged admin-channel offset to skip");
    }

    pub fn admin_offset_to_skip(&self, cluster: &str) -> Option<i64> {
        self.admin_offsets_to_skip
            .lock()
            .expect("admin offset map poisoned")
            .get(cluster)
            .copied()
    }

    // ---- diagnostics ----

    pub fn set_last_error(&self, cluster: &str, error: &ControllerError) {
        self.last_errors
            .lock()
            .expect("last error map poisoned")
            .insert(cluster.to_string(), error.to_string());
    }

    pub fn last_error(&self, cluster: &str) -> Option<String> {
        self.last_errors
            .lock()
            .expect("last error map poisoned")
            .get(cluster)
            .cloned()
    }
}

/// The unique `Started` version above the current one, if any.
///
/// More than one started version, or any errored or uncreated version above
/// the current one, means the store needs cleanup before a new push.
pub fn started_version(store: &Store) -> Result<Option<Version>> {
    let mut started = Vec::new();
    for version in &store.versions {
        if version.number <= store.current_version {
            continue;
        }
        match version.status {
            VersionStatus::Online | VersionStatus::Pushed => {}
            VersionStatus::Started => started.push(version.clone()),
            VersionStatus::Error | VersionStatus::NotCreated => {
                return Err(ControllerError::Conflict(format!(
                    "version {} of store {} is {}; clean up before pushing again",
                    version.number, store.name, version.status
                )));
            }
        }
    }
    match started.len() {
        0 => Ok(None),
        1 => Ok(Some(started.remove(0))),
        _ => Err(ControllerError::Conflict(format!(
            "store {} has multiple started versions: {}",
            store.name,
            started
                .iter()
                .map(|v| v.number.to_string())
                .collect::<Vec<_>>()
                .join(",")
        ))),
    }
}

fn check_store_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ControllerError::Conflict(format!(
            "invalid store name: {name:?}"
        )));
    }
    if topics::is_system_store(name) {
        return Err(ControllerError::Conflict(format!(
            "store name {name} clashes with the system store prefix"
        )));
    }
    Ok(())
}
