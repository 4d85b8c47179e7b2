//! SQLite-backed topic registry for the embedded bus.

use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::{Result, TopicError};
use crate::{TopicManager, TopicRecord};

const SCHEMA_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS topics (
        name TEXT PRIMARY KEY,
        partition_count INTEGER NOT NULL,
        replication_factor INTEGER NOT NULL,
        retention_ms INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS topic_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
];

pub struct SqliteTopicManager {
    pool: SqlitePool,
}

impl SqliteTopicManager {
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// In-memory registry for tests and embedded single-process setups.
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

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> TopicRecord {
        TopicRecord {
            name: row.get("name"),
            partition_count: row.get::<i64, _>("partition_count") as i32,
            replication_factor: row.get::<i64, _>("replication_factor") as i32,
            retention_ms: row.get("retention_ms"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl TopicManager for SqliteTopicManager {
    async fn list_topics(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT name FROM topics")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    async fn contains_topic(&self, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM topics WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_topic(&self, name: &str) -> Result<Option<TopicRecord>> {
        let row = sqlx::query("SELECT * FROM topics WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_record(&r)))
    }

    async fn create_topic(
        &self,
        name: &str,
        partition_count: i32,
        replication_factor: i32,
        retention_ms: Option<i64>,
    ) -> Result<()> {
        if partition_count < 1 {
            return Err(TopicError::InvalidConfig(format!(
                "topic {name} needs at least one partition"
            )));
        }
        let result = sqlx::query(
            "INSERT INTO topics (name, partition_count, replication_factor, retention_ms, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(partition_count)
        .bind(replication_factor)
        .bind(retention_ms)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(topic = %name, partitions = partition_count, "Created topic");
                Ok(())
            }
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                Err(TopicError::TopicAlreadyExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_retention(&self, name: &str, retention_ms: i64) -> Result<()> {
        let affected = sqlx::query("UPDATE topics SET retention_ms = ? WHERE name = ?")
            .bind(retention_ms)
            .bind(name)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(TopicError::TopicNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn get_retention(&self, name: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT retention_ms FROM topics WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get("retention_ms")))
    }

    async fn delete_topic(&self, name: &str) -> Result<()> {
        let affected = sqlx::query("DELETE FROM topics WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(TopicError::TopicNotFound(name.to_string()));
        }
        sqlx::query("DELETE FROM topic_messages WHERE topic = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn truncate(&self, name: &str, deprecated_retention_ms: i64) -> Result<()> {
        if self.contains_topic(name).await? {
            self.update_retention(name, deprecated_retention_ms).await?;
            info!(topic = %name, retention_ms = deprecated_retention_ms, "Deprecated topic");
        } else {
            debug!(topic = %name, "Topic absent, skipping truncation");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    const FIVE_MIN_MS: i64 = 5 * 60 * 1000;

    async fn manager() -> SqliteTopicManager {
        SqliteTopicManager::new_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn create_list_contains() {
        let tm = manager().await;
        tm.create_topic("orders_v1", 4, 3, Some(DAY_MS)).await.unwrap();
        tm.create_topic("orders_rt", 4, 3, None).await.unwrap();

        assert!(tm.contains_topic("orders_v1").await.unwrap());
        let topics = tm.list_topics().await.unwrap();
        assert_eq!(topics.len(), 2);

        let err = tm.create_topic("orders_v1", 4, 3, None).await.unwrap_err();
        assert!(matches!(err, TopicError::TopicAlreadyExists(_)));
    }

    #[tokio::test]
    async fn zero_partitions_rejected() {
        let tm = manager().await;
        let err = tm.create_topic("orders_v1", 0, 3, None).await.unwrap_err();
        assert!(matches!(err, TopicError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn truncation_lowers_retention_below_threshold() {
        let tm = manager().await;
        tm.create_topic("orders_v1", 4, 3, Some(7 * DAY_MS)).await.unwrap();
        assert!(!tm.is_topic_truncated("orders_v1", DAY_MS).await.unwrap());

        tm.truncate("orders_v1", FIVE_MIN_MS).await.unwrap();
        assert_eq!(tm.get_retention("orders_v1").await.unwrap(), Some(FIVE_MIN_MS));
        assert!(tm.is_topic_truncated("orders_v1", DAY_MS).await.unwrap());

        // Truncating a missing topic is a no-op.
        tm.truncate("ghost_v1", FIVE_MIN_MS).await.unwrap();
    }

    #[tokio::test]
    async fn eternal_topics_are_never_truncated() {
        let tm = manager().await;
        tm.create_topic("orders_rt", 4, 3, None).await.unwrap();
        assert!(!tm.is_topic_truncated("orders_rt", DAY_MS).await.unwrap());
    }

    #[tokio::test]
    async fn delete_topic_removes_messages() {
        let tm = manager().await;
        tm.create_topic("strata_system_push_status_rt", 1, 1, None)
            .await
            .unwrap();
        tm.delete_topic("strata_system_push_status_rt").await.unwrap();
        assert!(!tm.contains_topic("strata_system_push_status_rt").await.unwrap());

        let err = tm.delete_topic("strata_system_push_status_rt").await.unwrap_err();
        assert!(matches!(err, TopicError::TopicNotFound(_)));
    }
}
