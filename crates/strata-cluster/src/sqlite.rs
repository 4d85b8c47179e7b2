//! SQLite-backed cluster manager adapter.
//!
//! Coordination state (clusters, resources, replica states, live instances,
//! leases) lives in shared storage and every mutation is a conditional
//! write, so any controller process observing the same database sees one
//! consistent cluster manager.
//!
//! Initial placement on `add_resource` is round-robin over live (and, when
//! an allowlist is configured, allowlisted) instances; replicas start in
//! `BOOTSTRAP` and participants report their progress through
//! `set_replica_state`.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::{
    ClusterManagerConfig, ExternalView, LeaderLease, ParticipantMessage, ReplicaState,
    ResourceCoordinator, ResourceSpec, Rebalancer, StateModel,
};

/// Instances silent for longer than this are no longer live.
const LIVE_INSTANCE_WINDOW_MS: i64 = 60_000;

/// External view poll cadence inside `wait_for_assignment`.
const ASSIGNMENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const SCHEMA_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS clusters (
        name TEXT PRIMARY KEY,
        config TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS resources (
        cluster TEXT NOT NULL,
        name TEXT NOT NULL,
        partition_count INTEGER NOT NULL,
        replication_factor INTEGER NOT NULL,
        state_model TEXT NOT NULL,
        rebalancer TEXT NOT NULL,
        min_active_replicas INTEGER NOT NULL,
        PRIMARY KEY (cluster, name)
    )",
    "CREATE TABLE IF NOT EXISTS replica_states (
        cluster TEXT NOT NULL,
        resource TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        instance_id TEXT NOT NULL,
        state TEXT NOT NULL,
        PRIMARY KEY (cluster, resource, partition_id, instance_id)
    )",
    "CREATE TABLE IF NOT EXISTS instances (
        cluster TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        last_heartbeat INTEGER NOT NULL,
        PRIMARY KEY (cluster, instance_id)
    )",
    "CREATE TABLE IF NOT EXISTS allowlist (
        cluster TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        PRIMARY KEY (cluster, instance_id)
    )",
    "CREATE TABLE IF NOT EXISTS partition_toggles (
        cluster TEXT NOT NULL,
        participant TEXT NOT NULL,
        resource TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        enabled INTEGER NOT NULL,
        PRIMARY KEY (cluster, participant, resource, partition_id)
    )",
    "CREATE TABLE IF NOT EXISTS participant_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cluster TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS leader_leases (
        cluster TEXT NOT NULL,
        resource TEXT NOT NULL,
        holder TEXT NOT NULL,
        epoch INTEGER NOT NULL,
        acquired_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        PRIMARY KEY (cluster, resource)
    )",
];

pub struct SqliteResourceCoordinator {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SqliteResourceCoordinator {
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// In-memory coordinator for tests and embedded single-process setups.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        for stmt in SCHEMA_SQL {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Messages broadcast to a cluster's participants, oldest first. Test
    /// and diagnostics helper.
    pub async fn broadcast_messages(&self, cluster: &str) -> Result<Vec<ParticipantMessage>> {
        let rows = sqlx::query(
            "SELECT payload FROM participant_messages WHERE cluster = ? ORDER BY id",
        )
        .bind(cluster)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("payload"))?))
            .collect()
    }

    async fn resource_spec(&self, cluster: &str, resource: &str) -> Result<ResourceSpec> {
        let row = sqlx::query("SELECT * FROM resources WHERE cluster = ? AND name = ?")
            .bind(cluster)
            .bind(resource)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ClusterError::ResourceNotFound {
                cluster: cluster.to_string(),
                resource: resource.to_string(),
            })?;
        Ok(ResourceSpec {
            name: row.get("name"),
            partition_count: row.get::<i64, _>("partition_count") as i32,
            replication_factor: row.get::<i64, _>("replication_factor") as i32,
            state_model: match row.get::<String, _>("state_model").as_str() {
                "LEADER_STANDBY" => StateModel::LeaderStandby,
                _ => StateModel::OnlineOffline,
            },
            rebalancer: match row.get::<String, _>("rebalancer").as_str() {
                "FULL_AUTO" => Rebalancer::FullAuto,
                _ => Rebalancer::DelayedAuto,
            },
            min_active_replicas: row.get::<i64, _>("min_active_replicas") as i32,
        })
    }

    /// Round-robin placement of a new resource's replicas over the cluster's
    /// placeable instances.
    async fn place_replicas(&self, cluster: &str, spec: &ResourceSpec) -> Result<usize> {
        let live = self.live_instances(cluster).await?;
        let allowed = self.allowlist(cluster).await?;
        let mut candidates: Vec<String> = if allowed.is_empty() {
            live.into_iter().collect()
        } else {
            live.intersection(&allowed).cloned().collect()
        };
        candidates.sort();

        if candidates.is_empty() {
            warn!(
                cluster = %cluster,
                resource = %spec.name,
                "No placeable instances, resource created without assignment"
            );
            return Ok(0);
        }

        let mut placed = 0usize;
        for partition in 0..spec.partition_count {
            let replicas = spec.replication_factor.min(candidates.len() as i32);
            for r in 0..replicas {
                let instance =
                    &candidates[((partition + r) as usize) % candidates.len()];
                sqlx::query(
                    "INSERT INTO replica_states
                         (cluster, resource, partition_id, instance_id, state)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT (cluster, resource, partition_id, instance_id)
                         DO UPDATE SET state = excluded.state",
                )
                .bind(cluster)
                .bind(&spec.name)
                .bind(partition)
                .bind(instance)
                .bind(ReplicaState::Bootstrap.as_str())
                .execute(&self.pool)
                .await?;
                placed += 1;
            }
        }
        Ok(placed)
    }
}

#[async_trait]
impl ResourceCoordinator for SqliteResourceCoordinator {
    async fn ensure_cluster(&self, name: &str, config: &ClusterManagerConfig) -> Result<()> {
        let config_json = serde_json::to_string(config)?;
        sqlx::query(
            "INSERT INTO clusters (name, config) VALUES (?, ?)
             ON CONFLICT (name) DO UPDATE SET config = excluded.config",
        )
        .bind(name)
        .bind(&config_json)
        .execute(&self.pool)
        .await?;
        debug!(cluster = %name, "Ensured cluster");
        Ok(())
    }

    async fn cluster_exists(&self, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM clusters WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn add_resource(&self, cluster: &str, spec: &ResourceSpec) -> Result<()> {
        if !self.cluster_exists(cluster).await? {
            return Err(ClusterError::ClusterNotFound(cluster.to_string()));
        }
        let state_model = match spec.state_model {
            StateModel::LeaderStandby => "LEADER_STANDBY",
            StateModel::OnlineOffline => "ONLINE_OFFLINE",
        };
        let rebalancer = match spec.rebalancer {
            Rebalancer::FullAuto => "FULL_AUTO",
            Rebalancer::DelayedAuto => "DELAYED_AUTO",
        };
        let result = sqlx::query(
            "INSERT INTO resources
                 (cluster, name, partition_count, replication_factor,
                  state_model, rebalancer, min_active_replicas)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cluster)
        .bind(&spec.name)
        .bind(spec.partition_count)
        .bind(spec.replication_factor)
        .bind(state_model)
        .bind(rebalancer)
        .bind(spec.min_active_replicas)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                return Err(ClusterError::ResourceAlreadyExists {
                    cluster: cluster.to_string(),
                    resource: spec.name.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let placed = self.place_replicas(cluster, spec).await?;
        info!(
            cluster = %cluster,
            resource = %spec.name,
            partitions = spec.partition_count,
            replicas_placed = placed,
            "Added resource"
        );
        Ok(())
    }

    async fn drop_resource(&self, cluster: &str, resource: &str) -> Result<()> {
        sqlx::query("DELETE FROM resources WHERE cluster = ? AND name = ?")
            .bind(cluster)
            .bind(resource)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM replica_states WHERE cluster = ? AND resource = ?")
            .bind(cluster)
            .bind(resource)
            .execute(&self.pool)
            .await?;
        debug!(cluster = %cluster, resource = %resource, "Dropped resource");
        Ok(())
    }

    async fn has_resource(&self, cluster: &str, resource: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM resources WHERE cluster = ? AND name = ?")
            .bind(cluster)
            .bind(resource)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_resources(&self, cluster: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM resources WHERE cluster = ? ORDER BY name")
            .bind(cluster)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    async fn enable_partition(
        &self,
        cluster: &str,
        participant: &str,
        resource: &str,
        partition: i32,
        enabled: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO partition_toggles
                 (cluster, participant, resource, partition_id, enabled)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (cluster, participant, resource, partition_id)
                 DO UPDATE SET enabled = excluded.enabled",
        )
        .bind(cluster)
        .bind(participant)
        .bind(resource)
        .bind(partition)
        .bind(enabled as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_external_view(&self, cluster: &str, resource: &str) -> Result<ExternalView> {
        let rows = sqlx::query(
            "SELECT partition_id, instance_id, state FROM replica_states
             WHERE cluster = ? AND resource = ?
             ORDER BY partition_id, instance_id",
        )
        .bind(cluster)
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;

        let mut view = ExternalView {
            resource: resource.to_string(),
            ..Default::default()
        };
        for row in rows {
            let partition = row.get::<i64, _>("partition_id") as i32;
            let instance: String = row.get("instance_id");
            let state = ReplicaState::parse(&row.get::<String, _>("state"))
                .unwrap_or(ReplicaState::Offline);
            view.partitions.entry(partition).or_default().insert(instance, state);
        }
        Ok(view)
    }

    async fn register_participant(&self, cluster: &str, instance_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO instances (cluster, instance_id, last_heartbeat) VALUES (?, ?, ?)
             ON CONFLICT (cluster, instance_id)
                 DO UPDATE SET last_heartbeat = excluded.last_heartbeat",
        )
        .bind(cluster)
        .bind(instance_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn live_instances(&self, cluster: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT instance_id FROM instances WHERE cluster = ? AND last_heartbeat > ?",
        )
        .bind(cluster)
        .bind(now_ms() - LIVE_INSTANCE_WINDOW_MS)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("instance_id")).collect())
    }

    async fn instances_in_cluster(&self, cluster: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT instance_id FROM instances WHERE cluster = ? ORDER BY instance_id",
        )
        .bind(cluster)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("instance_id")).collect())
    }

    async fn drop_instance(&self, cluster: &str, instance_id: &str) -> Result<()> {
        if self.live_instances(cluster).await?.contains(instance_id) {
            return Err(ClusterError::InstanceStillConnected {
                cluster: cluster.to_string(),
                instance: instance_id.to_string(),
            });
        }
        sqlx::query("DELETE FROM instances WHERE cluster = ? AND instance_id = ?")
            .bind(cluster)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_replica_state(
        &self,
        cluster: &str,
        resource: &str,
        partition: i32,
        instance_id: &str,
        state: ReplicaState,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO replica_states (cluster, resource, partition_id, instance_id, state)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (cluster, resource, partition_id, instance_id)
                 DO UPDATE SET state = excluded.state",
        )
        .bind(cluster)
        .bind(resource)
        .bind(partition)
        .bind(instance_id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn wait_for_assignment(
        &self,
        cluster: &str,
        resource: &str,
        replication_factor: i32,
        timeout: Duration,
    ) -> Result<()> {
        let spec = self.resource_spec(cluster, resource).await?;
        let required = replication_factor.min(spec.replication_factor).max(1) as usize;
        let started = Instant::now();

        loop {
            let view = self.read_external_view(cluster, resource).await?;
            let all_partitions_present = view.partitions.len() as i32 >= spec.partition_count;
            if all_partitions_present && view.min_replicas() >= required {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(ClusterError::AssignmentTimeout {
                    resource: resource.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            sleep(ASSIGNMENT_POLL_INTERVAL).await;
        }
    }

    async fn send_message_to_participants(
        &self,
        cluster: &str,
        message: &ParticipantMessage,
        retries: u32,
    ) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let kind = match message {
            ParticipantMessage::KillPush { .. } => "KILL_PUSH",
        };
        let mut attempt = 0;
        loop {
            let result = sqlx::query(
                "INSERT INTO participant_messages (cluster, kind, payload, created_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(cluster)
            .bind(kind)
            .bind(&payload)
            .bind(now_ms())
            .execute(&self.pool)
            .await;
            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        cluster = %cluster,
                        kind = kind,
                        attempt,
                        error = %e,
                        "Retrying participant broadcast"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn add_instance_to_allowlist(&self, cluster: &str, instance_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO allowlist (cluster, instance_id) VALUES (?, ?)",
        )
        .bind(cluster)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_instance_from_allowlist(&self, cluster: &str, instance_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM allowlist WHERE cluster = ? AND instance_id = ?")
            .bind(cluster)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn allowlist(&self, cluster: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT instance_id FROM allowlist WHERE cluster = ?")
            .bind(cluster)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("instance_id")).collect())
    }

    async fn acquire_leader_lease(
        &self,
        cluster: &str,
        resource: &str,
        holder: &str,
        duration_ms: i64,
    ) -> Result<LeaderLease> {
        let now = now_ms();
        let expires = now + duration_ms;

        // Grant when the lease is free, expired, or already ours; the epoch
        // bumps on every grant so it can serve as a fencing token.
        sqlx::query(
            "INSERT INTO leader_leases (cluster, resource, holder, epoch, acquired_at, expires_at)
             VALUES (?, ?, ?, 1, ?, ?)
             ON CONFLICT (cluster, resource) DO UPDATE SET
                 holder = CASE
                     WHEN leader_leases.holder = excluded.holder OR leader_leases.expires_at < ?
                     THEN excluded.holder ELSE leader_leases.holder END,
                 acquired_at = CASE
                     WHEN leader_leases.holder = excluded.holder OR leader_leases.expires_at < ?
                     THEN excluded.acquired_at ELSE leader_leases.acquired_at END,
                 expires_at = CASE
                     WHEN leader_leases.holder = excluded.holder OR leader_leases.expires_at < ?
                     THEN excluded.expires_at ELSE leader_leases.expires_at END,
                 epoch = CASE
                     WHEN leader_leases.holder = excluded.holder OR leader_leases.expires_at < ?
                     THEN leader_leases.epoch + 1 ELSE leader_leases.epoch END",
        )
        .bind(cluster)
        .bind(resource)
        .bind(holder)
        .bind(now)
        .bind(expires)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        match self.get_leader_lease(cluster, resource).await? {
            Some(lease) if lease.holder == holder => Ok(lease),
            Some(lease) => Err(ClusterError::LeaseHeldByOther {
                resource: resource.to_string(),
                holder: lease.holder,
            }),
            None => Err(ClusterError::ResourceNotFound {
                cluster: cluster.to_string(),
                resource: resource.to_string(),
            }),
        }
    }

    async fn get_leader_lease(&self, cluster: &str, resource: &str) -> Result<Option<LeaderLease>> {
        let row = sqlx::query(
            "SELECT * FROM leader_leases
             WHERE cluster = ? AND resource = ? AND expires_at > ?",
        )
        .bind(cluster)
        .bind(resource)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| LeaderLease {
            cluster: r.get("cluster"),
            resource: r.get("resource"),
            holder: r.get("holder"),
            epoch: r.get("epoch"),
            acquired_at: r.get("acquired_at"),
            expires_at: r.get("expires_at"),
        }))
    }

    async fn release_leader_lease(
        &self,
        cluster: &str,
        resource: &str,
        holder: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM leader_leases WHERE cluster = ? AND resource = ? AND holder = ?",
        )
        .bind(cluster)
        .bind(resource)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
