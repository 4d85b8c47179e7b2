//! Cluster manager adapter for the Strata control plane.
//!
//! The controller talks to the cluster manager through the
//! [`ResourceCoordinator`] trait: one *resource* per store version (named
//! like the version topic), a partition map with per-replica states, live
//! instance tracking, participant messaging, and the leader leases the
//! mastership layer is built on.
//!
//! [`SqliteResourceCoordinator`] is the deployable adapter: all coordination
//! happens through conditional writes on shared storage, with epoch-bumping
//! leases for leadership. [`mastership::MastershipController`] layers the
//! admin leader/standby model on top: a meta-cluster holds one single
//! partition resource per managed cluster, and whichever controller holds
//! that partition's lease is the cluster's admin leader.

pub mod error;
pub mod mastership;
pub mod sqlite;

pub use error::{ClusterError, Result};
pub use mastership::MastershipController;
pub use sqlite::SqliteResourceCoordinator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Cluster-level settings applied by `ensure_cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterManagerConfig {
    pub auto_join: bool,
    /// Placement constraint tag for topology-aware assignment; `None`
    /// disables topology awareness (the meta-cluster runs without it).
    pub topology_constraint: Option<String>,
    pub delayed_rebalance_ms: i64,
}

impl ClusterManagerConfig {
    /// Settings for the controllers' meta-cluster.
    pub fn meta_cluster() -> Self {
        Self {
            auto_join: true,
            topology_constraint: None,
            delayed_rebalance_ms: 0,
        }
    }
}

/// State model governing a resource's replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateModel {
    /// Meta-cluster resources: one leader per partition, the rest standby.
    LeaderStandby,
    /// Store-version resources: replicas bootstrap and come online.
    OnlineOffline,
}

/// Rebalancer choice for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rebalancer {
    FullAuto,
    /// Defers replica movement after instance loss by the cluster's
    /// configured delay.
    DelayedAuto,
}

/// Everything needed to create a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    pub partition_count: i32,
    pub replication_factor: i32,
    pub state_model: StateModel,
    pub rebalancer: Rebalancer,
    pub min_active_replicas: i32,
}

/// Observed state of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    Offline,
    Bootstrap,
    Online,
    Error,
}

impl ReplicaState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaState::Offline => "OFFLINE",
            ReplicaState::Bootstrap => "BOOTSTRAP",
            ReplicaState::Online => "ONLINE",
            ReplicaState::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OFFLINE" => Some(ReplicaState::Offline),
            "BOOTSTRAP" => Some(ReplicaState::Bootstrap),
            "ONLINE" => Some(ReplicaState::Online),
            "ERROR" => Some(ReplicaState::Error),
            _ => None,
        }
    }
}

/// Partition map of one resource: partition id -> instance -> state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalView {
    pub resource: String,
    pub partitions: BTreeMap<i32, BTreeMap<String, ReplicaState>>,
}

impl ExternalView {
    /// Replica count of the thinnest partition, 0 when the view is empty.
    pub fn min_replicas(&self) -> usize {
        self.partitions
            .values()
            .map(|replicas| replicas.len())
            .min()
            .unwrap_or(0)
    }
}

/// Fire-and-forget message broadcast to a resource's participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantMessage {
    /// Tell participants to abort ingestion of the named resource.
    KillPush { resource: String },
}

/// Admin leadership lease over one meta-cluster resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderLease {
    pub cluster: String,
    pub resource: String,
    pub holder: String,
    pub epoch: i64,
    pub acquired_at: i64,
    pub expires_at: i64,
}

/// Adapter contract to the external cluster manager.
#[async_trait]
pub trait ResourceCoordinator: Send + Sync {
    /// Idempotent cluster creation plus cluster-level config.
    async fn ensure_cluster(&self, name: &str, config: &ClusterManagerConfig) -> Result<()>;

    async fn cluster_exists(&self, name: &str) -> Result<bool>;

    /// Create a resource and run initial placement. Fails with
    /// `ResourceAlreadyExists` when present.
    async fn add_resource(&self, cluster: &str, spec: &ResourceSpec) -> Result<()>;

    /// Idempotent drop of a resource and its replica states.
    async fn drop_resource(&self, cluster: &str, resource: &str) -> Result<()>;

    async fn has_resource(&self, cluster: &str, resource: &str) -> Result<bool>;

    async fn list_resources(&self, cluster: &str) -> Result<Vec<String>>;

    /// Enable or disable one partition of a resource for one participant.
    async fn enable_partition(
        &self,
        cluster: &str,
        participant: &str,
        resource: &str,
        partition: i32,
        enabled: bool,
    ) -> Result<()>;

    async fn read_external_view(&self, cluster: &str, resource: &str) -> Result<ExternalView>;

    /// Register (or heartbeat) a participant instance.
    async fn register_participant(&self, cluster: &str, instance_id: &str) -> Result<()>;

    /// Instances with a fresh heartbeat.
    async fn live_instances(&self, cluster: &str) -> Result<HashSet<String>>;

    /// Every instance ever registered to the cluster.
    async fn instances_in_cluster(&self, cluster: &str) -> Result<Vec<String>>;

    /// Remove a registered instance. Refuses while the instance is live.
    async fn drop_instance(&self, cluster: &str, instance_id: &str) -> Result<()>;

    /// Report one replica's state (participants call this as ingestion
    /// progresses; the external view is the union of these reports).
    async fn set_replica_state(
        &self,
        cluster: &str,
        resource: &str,
        partition: i32,
        instance_id: &str,
        state: ReplicaState,
    ) -> Result<()>;

    /// Block until every partition of `resource` has at least
    /// `replication_factor` replicas assigned, or fail with
    /// `AssignmentTimeout`.
    async fn wait_for_assignment(
        &self,
        cluster: &str,
        resource: &str,
        replication_factor: i32,
        timeout: Duration,
    ) -> Result<()>;

    /// Broadcast a message to the participants of a resource. Fire and
    /// forget; `retries` only bounds re-enqueue attempts on send failure.
    async fn send_message_to_participants(
        &self,
        cluster: &str,
        message: &ParticipantMessage,
        retries: u32,
    ) -> Result<()>;

    // ---- instance allowlist ----

    async fn add_instance_to_allowlist(&self, cluster: &str, instance_id: &str) -> Result<()>;

    async fn remove_instance_from_allowlist(&self, cluster: &str, instance_id: &str) -> Result<()>;

    async fn allowlist(&self, cluster: &str) -> Result<HashSet<String>>;

    // ---- leader leases (mastership substrate) ----

    /// Grant or renew the lease on `resource` for `holder`. Takes over an
    /// expired lease, bumping the epoch; fails with `LeaseHeldByOther` while
    /// another holder's lease is live.
    async fn acquire_leader_lease(
        &self,
        cluster: &str,
        resource: &str,
        holder: &str,
        duration_ms: i64,
    ) -> Result<LeaderLease>;

    /// The live lease on `resource`, if any (expired leases are filtered).
    async fn get_leader_lease(&self, cluster: &str, resource: &str) -> Result<Option<LeaderLease>>;

    /// Release a held lease. Releasing a lease held by someone else is an
    /// error; releasing an absent lease is a no-op.
    async fn release_leader_lease(&self, cluster: &str, resource: &str, holder: &str)
        -> Result<()>;
}
