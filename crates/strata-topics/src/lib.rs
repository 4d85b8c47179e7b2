//! Topic administration for the Strata message bus.
//!
//! The controller never deletes a version topic outright: deprecating a topic
//! means lowering its retention to a small configured value so in-flight
//! consumers can drain, and a topic counts as *truncated* once its retention
//! sits below the configured threshold. Hard deletion exists only for system
//! topics.
//!
//! [`TopicWriter`] is the control-message side of the same bus: it appends
//! start-of-push / end-of-push / kill markers and push-status records to a
//! topic's message journal.

pub mod error;
pub mod sqlite;
pub mod writer;

pub use error::{Result, TopicError};
pub use sqlite::SqliteTopicManager;
pub use writer::{ControlMessage, TopicWriter};

use async_trait::async_trait;
use std::collections::HashSet;

/// Per-topic configuration as known to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRecord {
    pub name: String,
    pub partition_count: i32,
    pub replication_factor: i32,
    /// `None` means the topic is eternal (never expired by the bus).
    pub retention_ms: Option<i64>,
    pub created_at: i64,
}

/// Administrative operations on the message bus.
#[async_trait]
pub trait TopicManager: Send + Sync {
    async fn list_topics(&self) -> Result<HashSet<String>>;

    async fn contains_topic(&self, name: &str) -> Result<bool>;

    async fn get_topic(&self, name: &str) -> Result<Option<TopicRecord>>;

    /// Create a topic. `retention_ms = None` makes it eternal. Fails with
    /// `TopicAlreadyExists` when present.
    async fn create_topic(
        &self,
        name: &str,
        partition_count: i32,
        replication_factor: i32,
        retention_ms: Option<i64>,
    ) -> Result<()>;

    /// Set the retention of an existing topic.
    async fn update_retention(&self, name: &str, retention_ms: i64) -> Result<()>;

    /// Retention of the named topic; `None` when the topic is absent or eternal.
    async fn get_retention(&self, name: &str) -> Result<Option<i64>>;

    /// Hard delete. Only system topics may be removed this way; version
    /// topics are deprecated via [`TopicManager::truncate`].
    async fn delete_topic(&self, name: &str) -> Result<()>;

    /// Deprecate a topic by dropping its retention to `deprecated_retention_ms`.
    /// A missing topic is a logged no-op so cleanup passes stay idempotent.
    async fn truncate(&self, name: &str, deprecated_retention_ms: i64) -> Result<()>;

    /// Whether a topic with the given retention counts as truncated.
    fn is_retention_below_threshold(&self, retention_ms: Option<i64>, threshold_ms: i64) -> bool {
        matches!(retention_ms, Some(r) if r < threshold_ms)
    }

    /// Whether the named topic has been truncated (retention below `threshold_ms`).
    async fn is_topic_truncated(&self, name: &str, threshold_ms: i64) -> Result<bool> {
        let retention = self.get_retention(name).await?;
        Ok(self.is_retention_below_threshold(retention, threshold_ms))
    }
}
