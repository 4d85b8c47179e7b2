//! Control-message writer for bus topics.
//!
//! The controller writes a handful of control markers into topics it owns:
//! start-of-push and end-of-push framing a version topic's batch contents,
//! and push-status records appended to the push-status store's real-time
//! topic. Messages land in the topic's journal; data-plane consumers read
//! them in order with the payload records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use tracing::debug;

use crate::error::{Result, TopicError};
use crate::sqlite::SqliteTopicManager;

/// Marker kinds understood by data-plane consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    StartOfPush,
    EndOfPush,
    StatusRecord,
}

impl ControlMessage {
    fn kind(&self) -> &'static str {
        match self {
            ControlMessage::StartOfPush => "START_OF_PUSH",
            ControlMessage::EndOfPush => "END_OF_PUSH",
            ControlMessage::StatusRecord => "STATUS_RECORD",
        }
    }
}

/// Appends control messages to topics managed by a [`SqliteTopicManager`].
#[derive(Clone)]
pub struct TopicWriter {
    pool: SqlitePool,
}

impl SqliteTopicManager {
    /// A writer sharing this manager's bus.
    pub fn writer(&self) -> TopicWriter {
        TopicWriter {
            pool: self.pool().clone(),
        }
    }
}

impl TopicWriter {
    pub async fn broadcast_start_of_push(&self, topic: &str) -> Result<()> {
        self.append(topic, ControlMessage::StartOfPush, Value::Null)
            .await
    }

    pub async fn broadcast_end_of_push(&self, topic: &str) -> Result<()> {
        self.append(topic, ControlMessage::EndOfPush, Value::Null)
            .await
    }

    /// Append a push-status record serialized with the given value schema id.
    pub async fn append_status_record(
        &self,
        topic: &str,
        key: Value,
        value: Value,
        value_schema_id: i32,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "key": key,
            "value": value,
            "value_schema_id": value_schema_id,
        });
        self.append(topic, ControlMessage::StatusRecord, payload).await
    }

    async fn append(&self, topic: &str, message: ControlMessage, payload: Value) -> Result<()> {
        let exists = sqlx::query("SELECT 1 FROM topics WHERE name = ?")
            .bind(topic)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !exists {
            return Err(TopicError::TopicNotFound(topic.to_string()));
        }

        sqlx::query(
            "INSERT INTO topic_messages (topic, kind, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(message.kind())
        .bind(payload.to_string())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        debug!(topic = %topic, kind = message.kind(), "Appended control message");
        Ok(())
    }

    /// Message kinds present in a topic's journal, oldest first. Test and
    /// diagnostics helper.
    pub async fn message_kinds(&self, topic: &str) -> Result<Vec<String>> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT kind FROM topic_messages WHERE topic = ? ORDER BY id")
            .bind(topic)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("kind")).collect())
    }
}
