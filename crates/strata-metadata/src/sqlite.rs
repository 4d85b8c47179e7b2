//! SQLite-backed metadata store.
//!
//! Single-node backend over an embedded database. Store documents are
//! persisted as JSON in a registry table with an integer `row_version` used
//! for compare-and-set updates; everything else (discovery, graveyard,
//! schemas, execution ids) is a plain relational table.
//!
//! Uses runtime queries (`sqlx::query` + `Row::get`) rather than the
//! compile-time macros so the crate builds without a reachable database, and
//! bootstraps its schema with `CREATE TABLE IF NOT EXISTS` on connect.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::debug;

use strata_core::{GraveyardEntry, Store, StoreConfig};

use crate::error::{MetadataError, Result};
use crate::schema::{self, SchemaEntry, KEY_SCHEMA_ID, VALUE_SCHEMA_STARTING_ID};
use crate::{MetadataStore, VersionedStore};

const SCHEMA_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS stores (
        cluster TEXT NOT NULL,
        name TEXT NOT NULL,
        data TEXT NOT NULL,
        row_version INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (cluster, name)
    )",
    "CREATE TABLE IF NOT EXISTS store_configs (
        store_name TEXT PRIMARY KEY,
        cluster TEXT NOT NULL,
        deleting INTEGER NOT NULL DEFAULT 0,
        migration_src_cluster TEXT,
        migration_dest_cluster TEXT
    )",
    "CREATE TABLE IF NOT EXISTS graveyard (
        store_name TEXT PRIMARY KEY,
        largest_used_version INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS key_schemas (
        cluster TEXT NOT NULL,
        store_name TEXT NOT NULL,
        id INTEGER NOT NULL,
        schema TEXT NOT NULL,
        PRIMARY KEY (cluster, store_name)
    )",
    "CREATE TABLE IF NOT EXISTS value_schemas (
        cluster TEXT NOT NULL,
        store_name TEXT NOT NULL,
        id INTEGER NOT NULL,
        schema TEXT NOT NULL,
        PRIMARY KEY (cluster, store_name, id)
    )",
    "CREATE TABLE IF NOT EXISTS execution_ids (
        cluster TEXT PRIMARY KEY,
        last_id INTEGER NOT NULL
    )",
];

pub struct SqliteMetadataStore {
    pool: SqlitePool,
    /// Serializes schema add-or-lookup so concurrent registrations cannot
    /// both observe the same max id.
    schema_lock: Mutex<()>,
}

impl SqliteMetadataStore {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// In-memory database for tests and embedded single-process setups. A
    /// single connection keeps every handle on the same database.
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
        Ok(Self {
            pool,
            schema_lock: Mutex::new(()),
        })
    }

    fn row_to_store(row: &sqlx::sqlite::SqliteRow) -> Result<Store> {
        let data: String = row.get("data");
        Ok(serde_json::from_str(&data)?)
    }

    fn row_to_store_config(row: &sqlx::sqlite::SqliteRow) -> StoreConfig {
        StoreConfig {
            store_name: row.get("store_name"),
            cluster: row.get("cluster"),
            deleting: row.get::<i64, _>("deleting") != 0,
            migration_src_cluster: row.get("migration_src_cluster"),
            migration_dest_cluster: row.get("migration_dest_cluster"),
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn add_store(&self, cluster: &str, store: &Store) -> Result<()> {
        let data = serde_json::to_string(store)?;
        let result = sqlx::query(
            "INSERT INTO stores (cluster, name, data, row_version) VALUES (?, ?, ?, 1)",
        )
        .bind(cluster)
        .bind(&store.name)
        .bind(&data)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                Err(MetadataError::StoreAlreadyExists(store.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_store(&self, cluster: &str, name: &str) -> Result<Option<Store>> {
        Ok(self.load_store(cluster, name).await?.map(|v| v.store))
    }

    async fn load_store(&self, cluster: &str, name: &str) -> Result<Option<VersionedStore>> {
        let row = sqlx::query(
            "SELECT data, row_version FROM stores WHERE cluster = ? AND name = ?",
        )
        .bind(cluster)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(VersionedStore {
                store: Self::row_to_store(&r)?,
                row_version: r.get("row_version"),
            })
        })
        .transpose()
    }

    async fn has_store(&self, cluster: &str, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM stores WHERE cluster = ? AND name = ?")
            .bind(cluster)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_stores(&self, cluster: &str) -> Result<Vec<Store>> {
        let rows = sqlx::query("SELECT data FROM stores WHERE cluster = ? ORDER BY name")
            .bind(cluster)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_store).collect()
    }

    async fn update_store(
        &self,
        cluster: &str,
        store: &Store,
        expected_row_version: i64,
    ) -> Result<i64> {
        let data = serde_json::to_string(store)?;
        let affected = sqlx::query(
            "UPDATE stores SET data = ?, row_version = row_version + 1
             WHERE cluster = ? AND name = ? AND row_version = ?",
        )
        .bind(&data)
        .bind(cluster)
        .bind(&store.name)
        .bind(expected_row_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            if self.has_store(cluster, &store.name).await? {
                return Err(MetadataError::ConcurrentUpdate(store.name.clone()));
            }
            return Err(MetadataError::StoreNotFound(store.name.clone()));
        }
        Ok(expected_row_version + 1)
    }

    async fn delete_store(&self, cluster: &str, name: &str) -> Result<()> {
        let affected = sqlx::query("DELETE FROM stores WHERE cluster = ? AND name = ?")
            .bind(cluster)
            .bind(name)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(MetadataError::StoreNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn get_store_config(&self, store_name: &str) -> Result<Option<StoreConfig>> {
        let row = sqlx::query("SELECT * FROM store_configs WHERE store_name = ?")
            .bind(store_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_store_config(&r)))
    }

    async fn put_store_config(&self, config: &StoreConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO store_configs
                 (store_name, cluster, deleting, migration_src_cluster, migration_dest_cluster)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (store_name) DO UPDATE SET
                 cluster = excluded.cluster,
                 deleting = excluded.deleting,
                 migration_src_cluster = excluded.migration_src_cluster,
                 migration_dest_cluster = excluded.migration_dest_cluster",
        )
        .bind(&config.store_name)
        .bind(&config.cluster)
        .bind(config.deleting as i64)
        .bind(&config.migration_src_cluster)
        .bind(&config.migration_dest_cluster)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_store_config(&self, store_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM store_configs WHERE store_name = ?")
            .bind(store_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_store_configs(&self) -> Result<Vec<StoreConfig>> {
        let rows = sqlx::query("SELECT * FROM store_configs ORDER BY store_name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_store_config).collect())
    }

    async fn largest_used_version_from_graveyard(&self, store_name: &str) -> Result<i32> {
        let row = sqlx::query("SELECT largest_used_version FROM graveyard WHERE store_name = ?")
            .bind(store_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0) as i32).unwrap_or(0))
    }

    async fn put_graveyard(&self, entry: &GraveyardEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO graveyard (store_name, largest_used_version) VALUES (?, ?)
             ON CONFLICT (store_name) DO UPDATE SET
                 largest_used_version = MAX(graveyard.largest_used_version, excluded.largest_used_version)",
        )
        .bind(&entry.store_name)
        .bind(entry.largest_used_version_number as i64)
        .execute(&self.pool)
        .await?;
        debug!(
            store = %entry.store_name,
            largest_used_version = entry.largest_used_version_number,
            "Recorded graveyard entry"
        );
        Ok(())
    }

    async fn last_succeeded_execution_id(&self, cluster: &str) -> Result<i64> {
        let row = sqlx::query("SELECT last_id FROM execution_ids WHERE cluster = ?")
            .bind(cluster)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)).unwrap_or(-1))
    }

    async fn update_execution_id(&self, cluster: &str, execution_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO execution_ids (cluster, last_id) VALUES (?, ?)
             ON CONFLICT (cluster) DO UPDATE SET
                 last_id = MAX(execution_ids.last_id, excluded.last_id)",
        )
        .bind(cluster)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn init_key_schema(
        &self,
        cluster: &str,
        store_name: &str,
        schema_str: &str,
    ) -> Result<SchemaEntry> {
        schema::parse(schema_str)?;
        let _guard = self.schema_lock.lock().await;

        if let Some(existing) = self.key_schema(cluster, store_name).await? {
            if schema::schemas_equal(&existing.schema, schema_str)? {
                return Ok(existing);
            }
            return Err(MetadataError::KeySchemaMismatch(store_name.to_string()));
        }

        sqlx::query(
            "INSERT INTO key_schemas (cluster, store_name, id, schema) VALUES (?, ?, ?, ?)",
        )
        .bind(cluster)
        .bind(store_name)
        .bind(KEY_SCHEMA_ID)
        .bind(schema_str)
        .execute(&self.pool)
        .await?;
        Ok(SchemaEntry::new(KEY_SCHEMA_ID, schema_str))
    }

    async fn key_schema(&self, cluster: &str, store_name: &str) -> Result<Option<SchemaEntry>> {
        let row = sqlx::query(
            "SELECT id, schema FROM key_schemas WHERE cluster = ? AND store_name = ?",
        )
        .bind(cluster)
        .bind(store_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| SchemaEntry::new(r.get::<i64, _>("id") as i32, r.get::<String, _>("schema"))))
    }

    async fn add_value_schema(
        &self,
        cluster: &str,
        store_name: &str,
        schema_str: &str,
    ) -> Result<SchemaEntry> {
        schema::parse(schema_str)?;
        let _guard = self.schema_lock.lock().await;

        let existing = self.value_schemas(cluster, store_name).await?;
        let mut max_id = VALUE_SCHEMA_STARTING_ID - 1;
        for entry in &existing {
            if schema::schemas_equal(&entry.schema, schema_str)? {
                return Ok(entry.clone());
            }
            if !schema::fully_compatible(&entry.schema, schema_str)? {
                return Err(MetadataError::SchemaIncompatible(format!(
                    "candidate schema for store {store_name} is incompatible with registered schema id {}",
                    entry.id
                )));
            }
            max_id = max_id.max(entry.id);
        }

        let id = max_id + 1;
        sqlx::query(
            "INSERT INTO value_schemas (cluster, store_name, id, schema) VALUES (?, ?, ?, ?)",
        )
        .bind(cluster)
        .bind(store_name)
        .bind(id)
        .bind(schema_str)
        .execute(&self.pool)
        .await?;
        debug!(store = %store_name, id, "Registered value schema");
        Ok(SchemaEntry::new(id, schema_str))
    }

    async fn add_value_schema_with_id(
        &self,
        cluster: &str,
        store_name: &str,
        schema_str: &str,
        id: i32,
    ) -> Result<SchemaEntry> {
        schema::parse(schema_str)?;
        let _guard = self.schema_lock.lock().await;

        sqlx::query(
            "INSERT INTO value_schemas (cluster, store_name, id, schema) VALUES (?, ?, ?, ?)
             ON CONFLICT (cluster, store_name, id) DO UPDATE SET schema = excluded.schema",
        )
        .bind(cluster)
        .bind(store_name)
        .bind(id)
        .bind(schema_str)
        .execute(&self.pool)
        .await?;
        Ok(SchemaEntry::new(id, schema_str))
    }

    async fn value_schemas(&self, cluster: &str, store_name: &str) -> Result<Vec<SchemaEntry>> {
        let rows = sqlx::query(
            "SELECT id, schema FROM value_schemas
             WHERE cluster = ? AND store_name = ? ORDER BY id",
        )
        .bind(cluster)
        .bind(store_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| SchemaEntry::new(r.get::<i64, _>("id") as i32, r.get::<String, _>("schema")))
            .collect())
    }

    async fn value_schema(
        &self,
        cluster: &str,
        store_name: &str,
        id: i32,
    ) -> Result<Option<SchemaEntry>> {
        let row = sqlx::query(
            "SELECT id, schema FROM value_schemas
             WHERE cluster = ? AND store_name = ? AND id = ?",
        )
        .bind(cluster)
        .bind(store_name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| SchemaEntry::new(r.get::<i64, _>("id") as i32, r.get::<String, _>("schema"))))
    }

    async fn value_schema_id(
        &self,
        cluster: &str,
        store_name: &str,
        schema_str: &str,
    ) -> Result<Option<i32>> {
        for entry in self.value_schemas(cluster, store_name).await? {
            if schema::schemas_equal(&entry.schema, schema_str)? {
                return Ok(Some(entry.id));
            }
        }
        Ok(None)
    }

    async fn delete_schemas(&self, cluster: &str, store_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM key_schemas WHERE cluster = ? AND store_name = ?")
            .bind(cluster)
            .bind(store_name)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM value_schemas WHERE cluster = ? AND store_name = ?")
            .bind(cluster)
            .bind(store_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Version;

    async fn make_store() -> SqliteMetadataStore {
        SqliteMetadataStore::new_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn add_and_get_store() {
        let meta = make_store().await;
        let store = Store::new("orders", "team", 42);
        meta.add_store("cluster1", &store).await.unwrap();

        let loaded = meta.get_store("cluster1", "orders").await.unwrap().unwrap();
        assert_eq!(loaded, store);
        assert!(meta.has_store("cluster1", "orders").await.unwrap());
        assert!(!meta.has_store("cluster2", "orders").await.unwrap());

        let err = meta.add_store("cluster1", &store).await.unwrap_err();
        assert!(matches!(err, MetadataError::StoreAlreadyExists(_)));
    }

    #[tokio::test]
    async fn cas_update_detects_conflicts() {
        let meta = make_store().await;
        let store = Store::new("orders", "team", 0);
        meta.add_store("c", &store).await.unwrap();

        let loaded = meta.load_store("c", "orders").await.unwrap().unwrap();
        let mut copy_a = loaded.store.clone();
        copy_a.owner = "team-a".to_string();
        let mut copy_b = loaded.store.clone();
        copy_b.owner = "team-b".to_string();

        let next = meta.update_store("c", &copy_a, loaded.row_version).await.unwrap();
        assert_eq!(next, loaded.row_version + 1);

        let err = meta
            .update_store("c", &copy_b, loaded.row_version)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::ConcurrentUpdate(_)));

        let current = meta.get_store("c", "orders").await.unwrap().unwrap();
        assert_eq!(current.owner, "team-a");
    }

    #[tokio::test]
    async fn store_round_trips_versions() {
        let meta = make_store().await;
        let mut store = Store::new("orders", "team", 0);
        store.add_version(Version::new("orders", 1, "p1"));
        meta.add_store("c", &store).await.unwrap();
        let loaded = meta.get_store("c", "orders").await.unwrap().unwrap();
        assert_eq!(loaded.versions.len(), 1);
        assert_eq!(loaded.versions[0].push_job_id, "p1");
    }

    #[tokio::test]
    async fn graveyard_is_monotonic() {
        let meta = make_store().await;
        assert_eq!(
            meta.largest_used_version_from_graveyard("orders").await.unwrap(),
            0
        );
        meta.put_graveyard(&GraveyardEntry {
            store_name: "orders".to_string(),
            largest_used_version_number: 5,
        })
        .await
        .unwrap();
        meta.put_graveyard(&GraveyardEntry {
            store_name: "orders".to_string(),
            largest_used_version_number: 3,
        })
        .await
        .unwrap();
        assert_eq!(
            meta.largest_used_version_from_graveyard("orders").await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn store_config_upsert_and_delete() {
        let meta = make_store().await;
        let mut cfg = StoreConfig::new("orders", "cluster1");
        meta.put_store_config(&cfg).await.unwrap();

        cfg.deleting = true;
        cfg.migration_src_cluster = Some("cluster1".to_string());
        cfg.migration_dest_cluster = Some("cluster2".to_string());
        meta.put_store_config(&cfg).await.unwrap();

        let loaded = meta.get_store_config("orders").await.unwrap().unwrap();
        assert!(loaded.deleting);
        assert_eq!(loaded.migration_dest_cluster.as_deref(), Some("cluster2"));

        meta.delete_store_config("orders").await.unwrap();
        assert!(meta.get_store_config("orders").await.unwrap().is_none());
        // Idempotent.
        meta.delete_store_config("orders").await.unwrap();
    }

    #[tokio::test]
    async fn value_schema_registration_is_idempotent() {
        let meta = make_store().await;
        let first = meta
            .add_value_schema("c", "orders", "\"string\"")
            .await
            .unwrap();
        assert_eq!(first.id, VALUE_SCHEMA_STARTING_ID);

        let again = meta
            .add_value_schema("c", "orders", "\"string\"")
            .await
            .unwrap();
        assert_eq!(again.id, first.id);

        let err = meta.add_value_schema("c", "orders", "\"int\"").await.unwrap_err();
        assert!(matches!(err, MetadataError::SchemaIncompatible(_)));
    }

    #[tokio::test]
    async fn compatible_evolution_gets_next_id() {
        let meta = make_store().await;
        let v1 = r#"{"type":"record","name":"User","fields":[{"name":"name","type":"string"}]}"#;
        let v2 = r#"{"type":"record","name":"User","fields":[
            {"name":"name","type":"string"},{"name":"age","type":"int","default":0}]}"#;

        assert_eq!(meta.add_value_schema("c", "orders", v1).await.unwrap().id, 1);
        assert_eq!(meta.add_value_schema("c", "orders", v2).await.unwrap().id, 2);
        assert_eq!(
            meta.value_schema_id("c", "orders", v1).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn key_schema_init_is_idempotent_but_strict() {
        let meta = make_store().await;
        let entry = meta.init_key_schema("c", "orders", "\"long\"").await.unwrap();
        assert_eq!(entry.id, KEY_SCHEMA_ID);

        meta.init_key_schema("c", "orders", "\"long\"").await.unwrap();
        let err = meta.init_key_schema("c", "orders", "\"string\"").await.unwrap_err();
        assert!(matches!(err, MetadataError::KeySchemaMismatch(_)));
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.db");

        let meta = SqliteMetadataStore::new(&path).await.unwrap();
        meta.add_store("c", &Store::new("orders", "team", 7)).await.unwrap();
        meta.put_graveyard(&GraveyardEntry {
            store_name: "legacy".to_string(),
            largest_used_version_number: 4,
        })
        .await
        .unwrap();
        drop(meta);

        let reopened = SqliteMetadataStore::new(&path).await.unwrap();
        let store = reopened.get_store("c", "orders").await.unwrap().unwrap();
        assert_eq!(store.created_at, 7);
        assert_eq!(
            reopened.largest_used_version_from_graveyard("legacy").await.unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn execution_ids_are_monotonic() {
        let meta = make_store().await;
        assert_eq!(meta.last_succeeded_execution_id("c").await.unwrap(), -1);
        meta.update_execution_id("c", 7).await.unwrap();
        meta.update_execution_id("c", 3).await.unwrap();
        assert_eq!(meta.last_succeeded_execution_id("c").await.unwrap(), 7);
    }
}
