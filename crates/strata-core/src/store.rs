//! The store registry's central value object and its companions.

use serde::{Deserialize, Serialize};

use crate::hybrid::HybridStoreConfig;
use crate::version::{Version, VersionStatus};

/// Compression applied to a store's batch payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionStrategy {
    #[default]
    NoOp,
    Gzip,
    Zstd,
}

/// A named keyspace with versioned, immutable batch contents and optional
/// real-time updates.
///
/// Invariants maintained by the lifecycle engine:
/// - `current_version` is `NON_EXISTING_VERSION` or the number of a held version.
/// - `largest_used_version_number` never decreases, including across
///   delete/recreate cycles (the graveyard carries it over).
/// - `partition_count` is locked in by the first version and pinned for
///   hybrid stores.
/// - a hybrid store never has `incremental_push_enabled` or router cache
///   flags set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    pub owner: String,
    pub created_at: i64,
    pub partition_count: i32,
    pub current_version: i32,
    pub largest_used_version_number: i32,
    pub enable_reads: bool,
    pub enable_writes: bool,
    pub migrating: bool,
    pub hybrid_config: Option<HybridStoreConfig>,
    pub incremental_push_enabled: bool,
    pub single_get_router_cache_enabled: bool,
    pub batch_get_router_cache_enabled: bool,
    pub batch_get_limit: i32,
    pub num_versions_to_preserve: i32,
    pub storage_quota_bytes: i64,
    pub read_quota_cu: i64,
    pub access_controlled: bool,
    pub compression_strategy: CompressionStrategy,
    pub chunking_enabled: bool,
    pub versions: Vec<Version>,
}

impl Store {
    /// `current_version` value for a store that is not serving any version.
    pub const NON_EXISTING_VERSION: i32 = 0;
    /// Deletion override meaning "keep the locally recorded largest used version".
    pub const IGNORE_VERSION: i32 = -1;
    /// Storage quota sentinel for unmetered stores.
    pub const UNLIMITED_STORAGE_QUOTA: i64 = -1;

    pub const DEFAULT_BATCH_GET_LIMIT: i32 = 500;
    pub const DEFAULT_VERSIONS_TO_PRESERVE: i32 = 2;
    pub const DEFAULT_READ_QUOTA_CU: i64 = 1_800;

    pub fn new(name: impl Into<String>, owner: impl Into<String>, created_at: i64) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            created_at,
            partition_count: 0,
            current_version: Self::NON_EXISTING_VERSION,
            largest_used_version_number: 0,
            enable_reads: true,
            enable_writes: true,
            migrating: false,
            hybrid_config: None,
            incremental_push_enabled: false,
            single_get_router_cache_enabled: false,
            batch_get_router_cache_enabled: false,
            batch_get_limit: Self::DEFAULT_BATCH_GET_LIMIT,
            num_versions_to_preserve: Self::DEFAULT_VERSIONS_TO_PRESERVE,
            storage_quota_bytes: Self::UNLIMITED_STORAGE_QUOTA,
            read_quota_cu: Self::DEFAULT_READ_QUOTA_CU,
            access_controlled: false,
            compression_strategy: CompressionStrategy::NoOp,
            chunking_enabled: false,
            versions: Vec::new(),
        }
    }

    pub fn is_hybrid(&self) -> bool {
        self.hybrid_config.is_some()
    }

    pub fn contains_version(&self, number: i32) -> bool {
        self.versions.iter().any(|v| v.number == number)
    }

    pub fn version(&self, number: i32) -> Option<&Version> {
        self.versions.iter().find(|v| v.number == number)
    }

    pub fn version_mut(&mut self, number: i32) -> Option<&mut Version> {
        self.versions.iter_mut().find(|v| v.number == number)
    }

    /// Status of a version by number; `NotCreated` if the store never held it
    /// or it has already been deleted.
    pub fn version_status(&self, number: i32) -> VersionStatus {
        self.version(number)
            .map(|v| v.status)
            .unwrap_or(VersionStatus::NotCreated)
    }

    /// Append a version, keeping the list sorted by number and the
    /// largest-used counter monotonic.
    pub fn add_version(&mut self, version: Version) {
        self.largest_used_version_number = self.largest_used_version_number.max(version.number);
        self.versions.push(version);
        self.versions.sort_by_key(|v| v.number);
    }

    /// Allocate the next version number for a fresh push and append it in
    /// `Started` state.
    pub fn increase_version(&mut self, push_job_id: impl Into<String>) -> Version {
        let number = self.largest_used_version_number + 1;
        let version = Version::new(self.name.clone(), number, push_job_id);
        self.add_version(version.clone());
        version
    }

    /// The version a future push would create, without mutating the store.
    pub fn peek_next_version(&self) -> Version {
        let mut version = Version::new(
            self.name.clone(),
            self.largest_used_version_number + 1,
            String::new(),
        );
        version.status = VersionStatus::NotCreated;
        version
    }

    /// Remove a version by number and return it, if present.
    pub fn delete_version(&mut self, number: i32) -> Option<Version> {
        let idx = self.versions.iter().position(|v| v.number == number)?;
        Some(self.versions.remove(idx))
    }

    /// Versions eligible for retirement.
    ///
    /// Keeps the current version, every `Started` or `Pushed` version (a
    /// push still in flight never retires, and does not consume a backup
    /// slot), and the most recent `Online` versions up to
    /// `max(num_versions_to_preserve, min_to_preserve)` in total (the current
    /// version counts toward that total); everything else (errored versions,
    /// older backups) is returned for deletion, newest first.
    pub fn retrieve_versions_to_delete(&self, min_to_preserve: i32) -> Vec<Version> {
        let preserve = self.num_versions_to_preserve.max(min_to_preserve).max(1) as usize;
        let mut sorted: Vec<&Version> = self.versions.iter().collect();
        sorted.sort_by(|a, b| b.number.cmp(&a.number));

        let mut kept = 0usize;
        let mut to_delete = Vec::new();
        for v in sorted {
            if v.number == self.current_version {
                kept += 1;
                continue;
            }
            match v.status {
                VersionStatus::Started | VersionStatus::Pushed => {}
                VersionStatus::Online => {
                    if kept < preserve {
                        kept += 1;
                    } else {
                        to_delete.push(v.clone());
                    }
                }
                VersionStatus::Error | VersionStatus::NotCreated => to_delete.push(v.clone()),
            }
        }
        to_delete
    }
}

/// Discovery row: maps a store name to the cluster that owns it.
///
/// Exactly one row exists per live store. During migration the row keeps
/// pointing at the source cluster until the migration monitor flips it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub store_name: String,
    pub cluster: String,
    pub deleting: bool,
    pub migration_src_cluster: Option<String>,
    pub migration_dest_cluster: Option<String>,
}

impl StoreConfig {
    pub fn new(store_name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            cluster: cluster.into(),
            deleting: false,
            migration_src_cluster: None,
            migration_dest_cluster: None,
        }
    }
}

/// Durable record of a deleted store. A recreated store with the same name
/// must start numbering versions above `largest_used_version_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraveyardEntry {
    pub store_name: String,
    pub largest_used_version_number: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_versions(current: i32, statuses: &[(i32, VersionStatus)]) -> Store {
        let mut store = Store::new("orders", "team", 0);
        for (n, status) in statuses {
            let mut v = Version::new("orders", *n, format!("push-{n}"));
            v.status = *status;
            store.add_version(v);
        }
        store.current_version = current;
        store
    }

    #[test]
    fn increase_version_is_monotonic() {
        let mut store = Store::new("orders", "team", 0);
        let v1 = store.increase_version("p1");
        assert_eq!(v1.number, 1);
        store.delete_version(1);
        let v2 = store.increase_version("p2");
        assert_eq!(v2.number, 2, "deleted numbers are never reused");
        assert_eq!(store.largest_used_version_number, 2);
    }

    #[test]
    fn peek_does_not_mutate() {
        let mut store = Store::new("orders", "team", 0);
        store.increase_version("p1");
        let peeked = store.peek_next_version();
        assert_eq!(peeked.number, 2);
        assert_eq!(peeked.status, VersionStatus::NotCreated);
        assert_eq!(store.versions.len(), 1);
        assert_eq!(store.largest_used_version_number, 1);
    }

    #[test]
    fn retire_keeps_current_started_and_recent_online() {
        use VersionStatus::*;
        let mut store = store_with_versions(
            4,
            &[(1, Online), (2, Online), (3, Error), (4, Online), (5, Started)],
        );
        store.num_versions_to_preserve = 2;
        let doomed = store.retrieve_versions_to_delete(1);
        let numbers: Vec<i32> = doomed.iter().map(|v| v.number).collect();
        // v4 is current, v5 is started, v2 is the most recent online backup.
        assert_eq!(numbers, vec![3, 1]);
    }

    #[test]
    fn retire_honors_cluster_minimum() {
        use VersionStatus::*;
        let mut store =
            store_with_versions(3, &[(1, Online), (2, Online), (3, Online)]);
        store.num_versions_to_preserve = 1;
        assert_eq!(store.retrieve_versions_to_delete(3).len(), 0);
        // The current version fills the whole quota of one; both backups go.
        let doomed = store.retrieve_versions_to_delete(1);
        let numbers: Vec<i32> = doomed.iter().map(|v| v.number).collect();
        assert_eq!(numbers, vec![2, 1]);
    }

    #[test]
    fn retire_never_touches_pushed_versions() {
        use VersionStatus::*;
        let mut store = store_with_versions(
            3,
            &[(1, Online), (2, Online), (3, Online), (4, Pushed)],
        );
        store.num_versions_to_preserve = 2;
        let doomed = store.retrieve_versions_to_delete(1);
        let numbers: Vec<i32> = doomed.iter().map(|v| v.number).collect();
        // v4 is mid-push and exempt, v3 is current, v2 is the kept backup.
        assert_eq!(numbers, vec![1]);
    }

    #[test]
    fn version_status_for_missing_version() {
        let store = store_with_versions(0, &[]);
        assert_eq!(store.version_status(9), VersionStatus::NotCreated);
    }
}
