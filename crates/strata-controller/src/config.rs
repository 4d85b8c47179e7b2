//! Controller configuration.
//!
//! The deployment hands the controller an environment-agnostic property map;
//! [`ControllerConfig::from_properties`] picks out the recognized keys and
//! falls back to the defaults documented on the struct fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

const MINUTE_MS: i64 = 60 * 1000;
const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Name of the meta-cluster the controllers themselves join.
    pub controller_cluster_name: String,
    /// Replicas per managed-cluster partition in the meta-cluster.
    pub controller_cluster_replica: i32,
    pub admin_port: u16,
    pub admin_secure_port: u16,
    pub bus_bootstrap_servers: String,
    pub bus_ssl_bootstrap_servers: String,
    pub ssl_to_bus: bool,
    /// Retention applied to a topic when it is deprecated (default 5 min).
    pub deprecated_topic_retention_ms: i64,
    /// A topic with retention below this counts as truncated (default 1 day).
    pub deprecated_topic_max_retention_ms: i64,
    /// Retention for freshly created version topics (default 5 days).
    pub version_topic_retention_ms: i64,
    /// Highest-numbered unused version topics spared by cleanup passes.
    pub min_unused_topics_to_preserve: i32,
    /// Cluster-wide floor for versions kept per store.
    pub min_versions_to_preserve: i32,
    pub native_replication_source_fabric: String,
    pub enable_offline_push_ssl_allowlist: bool,
    pub enable_nearline_push_ssl_allowlist: bool,
    pub push_ssl_allowlist: Vec<String>,
    /// Cluster and store receiving push-job status records; empty disables
    /// the side-channel.
    pub push_status_store_cluster: String,
    pub push_status_store_name: String,
    pub push_status_value_schema_id: i32,
    /// Clusters this controller manages.
    pub clusters: Vec<String>,
    /// Cluster name -> d2 service announced to clients via discovery.
    pub cluster_to_d2: HashMap<String, String>,
    pub replication_factor: i32,
    pub min_active_replicas: i32,
    pub min_partitions: i32,
    pub max_partitions: i32,
    /// Target bytes per partition when sizing a first push.
    pub partition_size_bytes: i64,
    /// Deadline for initial replica assignment of a new version resource.
    pub offline_push_wait_ms: u64,
    pub delayed_rebalance_ms: i64,
    pub topology_constraint: String,
    pub migration_monitor_interval_ms: u64,
    pub backup_cleanup_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_cluster_name: "strata-controllers".to_string(),
            controller_cluster_replica: 1,
            admin_port: 2434,
            admin_secure_port: 2435,
            bus_bootstrap_servers: "localhost:9092".to_string(),
            bus_ssl_bootstrap_servers: String::new(),
            ssl_to_bus: false,
            deprecated_topic_retention_ms: 5 * MINUTE_MS,
            deprecated_topic_max_retention_ms: DAY_MS,
            version_topic_retention_ms: 5 * DAY_MS,
            min_unused_topics_to_preserve: 0,
            min_versions_to_preserve: 2,
            native_replication_source_fabric: String::new(),
            enable_offline_push_ssl_allowlist: false,
            enable_nearline_push_ssl_allowlist: false,
            push_ssl_allowlist: Vec::new(),
            push_status_store_cluster: String::new(),
            push_status_store_name: String::new(),
            push_status_value_schema_id: 1,
            clusters: Vec::new(),
            cluster_to_d2: HashMap::new(),
            replication_factor: 3,
            min_active_replicas: 2,
            min_partitions: 1,
            max_partitions: 64,
            partition_size_bytes: 25 * 1024 * 1024 * 1024,
            offline_push_wait_ms: 120_000,
            delayed_rebalance_ms: 15 * MINUTE_MS,
            topology_constraint: "rack".to_string(),
            migration_monitor_interval_ms: 10_000,
            backup_cleanup_interval_ms: 60_000,
        }
    }
}

impl ControllerConfig {
    /// Build a config from a property map, recognizing the documented keys
    /// and defaulting everything absent. Unknown keys are ignored.
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        let get = |key: &str| props.get(key).cloned();
        if let Some(v) = get("controllerClusterName") {
            config.controller_cluster_name = v;
        }
        if let Some(v) = get("controllerClusterReplica").and_then(|v| v.parse().ok()) {
            config.controller_cluster_replica = v;
        }
        if let Some(v) = get("adminPort").and_then(|v| v.parse().ok()) {
            config.admin_port = v;
        }
        if let Some(v) = get("adminSecurePort").and_then(|v| v.parse().ok()) {
            config.admin_secure_port = v;
        }
        if let Some(v) = get("busBootstrapServers") {
            config.bus_bootstrap_servers = v;
        }
        if let Some(v) = get("busSslBootstrapServers") {
            config.bus_ssl_bootstrap_servers = v;
        }
        if let Some(v) = get("sslToBus").and_then(|v| v.parse().ok()) {
            config.ssl_to_bus = v;
        }
        if let Some(v) = get("deprecatedJobTopicRetentionMs").and_then(|v| v.parse().ok()) {
            config.deprecated_topic_retention_ms = v;
        }
        if let Some(v) = get("deprecatedJobTopicMaxRetentionMs").and_then(|v| v.parse().ok()) {
            config.deprecated_topic_max_retention_ms = v;
        }
        if let Some(v) = get("minNumberOfUnusedTopicsToPreserve").and_then(|v| v.parse().ok()) {
            config.min_unused_topics_to_preserve = v;
        }
        if let Some(v) = get("minNumberOfStoreVersionsToPreserve").and_then(|v| v.parse().ok()) {
            config.min_versions_to_preserve = v;
        }
        if let Some(v) = get("nativeReplicationSourceFabric") {
            config.native_replication_source_fabric = v;
        }
        if let Some(v) = get("enableOfflinePushSslAllowlist").and_then(|v| v.parse().ok()) {
            config.enable_offline_push_ssl_allowlist = v;
        }
        if let Some(v) = get("enableNearlinePushSslAllowlist").and_then(|v| v.parse().ok()) {
            config.enable_nearline_push_ssl_allowlist = v;
        }
        if let Some(v) = get("pushSslAllowlist") {
            config.push_ssl_allowlist = split_list(&v);
        }
        if let Some(v) = get("pushStatusStoreCluster") {
            config.push_status_store_cluster = v;
        }
        if let Some(v) = get("pushStatusStoreName") {
            config.push_status_store_name = v;
        }
        if let Some(v) = get("clusters") {
            config.clusters = split_list(&v);
        }
        if let Some(v) = get("clusterToD2") {
            // "clusterA:d2A,clusterB:d2B"
            config.cluster_to_d2 = split_list(&v)
                .into_iter()
                .filter_map(|pair| {
                    pair.split_once(':')
                        .map(|(c, d2)| (c.to_string(), d2.to_string()))
                })
                .collect();
        }
        if let Some(v) = get("replicationFactor").and_then(|v| v.parse().ok()) {
            config.replication_factor = v;
        }
        if let Some(v) = get("minActiveReplicas").and_then(|v| v.parse().ok()) {
            config.min_active_replicas = v;
        }
        if let Some(v) = get("minPartitions").and_then(|v| v.parse().ok()) {
            config.min_partitions = v;
        }
        if let Some(v) = get("maxPartitions").and_then(|v| v.parse().ok()) {
            config.max_partitions = v;
        }
        if let Some(v) = get("partitionSizeBytes").and_then(|v| v.parse().ok()) {
            config.partition_size_bytes = v;
        }
        if let Some(v) = get("offlinePushWaitMs").and_then(|v| v.parse().ok()) {
            config.offline_push_wait_ms = v;
        }
        if let Some(v) = get("delayedRebalanceMs").and_then(|v| v.parse().ok()) {
            config.delayed_rebalance_ms = v;
        }
        if let Some(v) = get("topologyConstraint") {
            config.topology_constraint = v;
        }
        config
    }

    pub fn bootstrap_servers(&self, ssl: bool) -> &str {
        if ssl {
            &self.bus_ssl_bootstrap_servers
        } else {
            &self.bus_bootstrap_servers
        }
    }

    /// Partition count for a first push of the given size, clamped to the
    /// configured bounds.
    pub fn calculate_partition_count(&self, store_size_bytes: i64) -> i32 {
        let raw = (store_size_bytes + self.partition_size_bytes - 1) / self.partition_size_bytes;
        (raw as i32).clamp(self.min_partitions, self.max_partitions)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
