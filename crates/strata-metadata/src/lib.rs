//! Strata metadata stores.
//!
//! This crate implements the durable, strongly-consistent key/value spaces
//! behind the control plane: the per-cluster store registry, the global
//! discovery (store-config) table, the graveyard of deleted stores, the
//! per-cluster execution-id counter, and the schema repository.
//!
//! ## Consistency model
//!
//! Reads and writes are linearizable per key; there is NO cross-key
//! atomicity. Store rows carry an integer `row_version` and every update is a
//! compare-and-set against it — a failed CAS surfaces as
//! [`MetadataError::ConcurrentUpdate`] and callers re-read and retry.
//! Multi-key invariants (store + discovery + graveyard) are serialized by the
//! lifecycle engine's locks, not by this layer.
//!
//! ## Backends
//!
//! [`SqliteMetadataStore`] is the deployable single-node backend and the test
//! backend at once (file-based or in-memory). All queries are runtime
//! `sqlx::query` calls so the crate builds without a database available.

pub mod error;
pub mod schema;
pub mod sqlite;

pub use error::{MetadataError, Result};
pub use schema::{SchemaEntry, KEY_SCHEMA_ID, VALUE_SCHEMA_STARTING_ID};
pub use sqlite::SqliteMetadataStore;

use async_trait::async_trait;
use strata_core::{GraveyardEntry, Store, StoreConfig};

/// A store row together with the CAS token required to update it.
#[derive(Debug, Clone)]
pub struct VersionedStore {
    pub store: Store,
    pub row_version: i64,
}

/// The transactional directory backing the control plane.
///
/// Implementations must be `Send + Sync` and are shared as
/// `Arc<dyn MetadataStore>`.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // ---- store registry (scoped per cluster) ----

    /// Insert a new store. Fails with `StoreAlreadyExists` on name collision.
    async fn add_store(&self, cluster: &str, store: &Store) -> Result<()>;

    async fn get_store(&self, cluster: &str, name: &str) -> Result<Option<Store>>;

    /// Fetch a store together with its CAS row version.
    async fn load_store(&self, cluster: &str, name: &str) -> Result<Option<VersionedStore>>;

    async fn has_store(&self, cluster: &str, name: &str) -> Result<bool>;

    async fn list_stores(&self, cluster: &str) -> Result<Vec<Store>>;

    /// Compare-and-set update: persists `store` iff the row still carries
    /// `expected_row_version`. Returns the new row version.
    async fn update_store(
        &self,
        cluster: &str,
        store: &Store,
        expected_row_version: i64,
    ) -> Result<i64>;

    /// Remove a store row. Removing an absent store is an error.
    async fn delete_store(&self, cluster: &str, name: &str) -> Result<()>;

    // ---- discovery ----

    async fn get_store_config(&self, store_name: &str) -> Result<Option<StoreConfig>>;

    /// Insert or replace the discovery row for a store.
    async fn put_store_config(&self, config: &StoreConfig) -> Result<()>;

    /// Idempotent delete of the discovery row.
    async fn delete_store_config(&self, store_name: &str) -> Result<()>;

    async fn list_store_configs(&self) -> Result<Vec<StoreConfig>>;

    // ---- graveyard ----

    /// Largest used version number recorded for a deleted store; 0 if the
    /// name was never buried.
    async fn largest_used_version_from_graveyard(&self, store_name: &str) -> Result<i32>;

    /// Record a deletion. Keeps the maximum of the existing entry and the
    /// incoming value so repeated burials stay monotonic.
    async fn put_graveyard(&self, entry: &GraveyardEntry) -> Result<()>;

    // ---- execution ids ----

    async fn last_succeeded_execution_id(&self, cluster: &str) -> Result<i64>;

    async fn update_execution_id(&self, cluster: &str, execution_id: i64) -> Result<()>;

    // ---- schemas ----

    /// Register the key schema under [`KEY_SCHEMA_ID`]. Re-initializing with
    /// a structurally identical schema is a no-op; a different schema fails.
    async fn init_key_schema(
        &self,
        cluster: &str,
        store_name: &str,
        schema: &str,
    ) -> Result<SchemaEntry>;

    async fn key_schema(&self, cluster: &str, store_name: &str) -> Result<Option<SchemaEntry>>;

    /// Register a value schema, assigning the next monotonic id.
    ///
    /// Idempotent: a structurally identical schema returns the existing id.
    /// A schema incompatible with any registered one fails with
    /// `SchemaIncompatible`.
    async fn add_value_schema(
        &self,
        cluster: &str,
        store_name: &str,
        schema: &str,
    ) -> Result<SchemaEntry>;

    /// Register a value schema under a caller-chosen id (store cloning during
    /// migration preserves source ids).
    async fn add_value_schema_with_id(
        &self,
        cluster: &str,
        store_name: &str,
        schema: &str,
        id: i32,
    ) -> Result<SchemaEntry>;

    async fn value_schemas(&self, cluster: &str, store_name: &str) -> Result<Vec<SchemaEntry>>;

    async fn value_schema(
        &self,
        cluster: &str,
        store_name: &str,
        id: i32,
    ) -> Result<Option<SchemaEntry>>;

    /// Id of a structurally equal registered schema, if any.
    async fn value_schema_id(
        &self,
        cluster: &str,
        store_name: &str,
        schema: &str,
    ) -> Result<Option<i32>>;

    /// Drop all schemas of a store (part of store deletion).
    async fn delete_schemas(&self, cluster: &str, store_name: &str) -> Result<()>;
}
