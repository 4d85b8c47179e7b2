//! In-memory offline push tracking, per cluster.
//!
//! One entry per version topic with an active or recently finished push,
//! plus the set of running real-time buffer replays for hybrid stores. This
//! state is rebuilt on leadership acquisition; the authoritative push record
//! is the version status in the store registry.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

/// Execution state of one offline push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Started,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct OfflinePush {
    pub topic: String,
    pub partition_count: i32,
    pub replication_factor: i32,
    pub status: PushStatus,
    pub details: Option<String>,
}

#[derive(Default)]
pub struct PushMonitor {
    pushes: RwLock<HashMap<String, OfflinePush>>,
    /// version topic -> real-time topic being replayed into it.
    replays: RwLock<HashMap<String, String>>,
}

impl PushMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_monitor(&self, topic: &str, partition_count: i32, replication_factor: i32) {
        let push = OfflinePush {
            topic: topic.to_string(),
            partition_count,
            replication_factor,
            status: PushStatus::Started,
            details: None,
        };
        self.pushes.write().await.insert(topic.to_string(), push);
        debug!(topic = %topic, "Started monitoring offline push");
    }

    pub async fn stop_monitor(&self, topic: &str) {
        if self.pushes.write().await.remove(topic).is_some() {
            debug!(topic = %topic, "Stopped monitoring offline push");
        }
    }

    pub async fn mark_error(&self, topic: &str, details: &str) {
        if let Some(push) = self.pushes.write().await.get_mut(topic) {
            push.status = PushStatus::Error;
            push.details = Some(details.to_string());
        }
        info!(topic = %topic, details = %details, "Offline push marked as error");
    }

    pub async fn mark_completed(&self, topic: &str) {
        if let Some(push) = self.pushes.write().await.get_mut(topic) {
            push.status = PushStatus::Completed;
        }
    }

    pub async fn status(&self, topic: &str) -> Option<OfflinePush> {
        self.pushes.read().await.get(topic).cloned()
    }

    /// Topics with pushes still in flight.
    pub async fn ongoing_topics(&self) -> Vec<String> {
        self.pushes
            .read()
            .await
            .values()
            .filter(|p| p.status == PushStatus::Started)
            .map(|p| p.topic.clone())
            .collect()
    }

    pub async fn start_buffer_replay(&self, real_time_topic: &str, version_topic: &str) {
        self.replays
            .write()
            .await
            .insert(version_topic.to_string(), real_time_topic.to_string());
        info!(
            real_time_topic = %real_time_topic,
            version_topic = %version_topic,
            "Started buffer replay"
        );
    }

    pub async fn stop_buffer_replay(&self, version_topic: &str) {
        if let Some(rt) = self.replays.write().await.remove(version_topic) {
            info!(
                real_time_topic = %rt,
                version_topic = %version_topic,
                "Terminated buffer replay"
            );
        }
    }

    pub async fn replay_active(&self, version_topic: &str) -> bool {
        self.replays.read().await.contains_key(version_topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_lifecycle() {
        let monitor = PushMonitor::new();
        monitor.start_monitor("orders_v1", 4, 3).await;
        assert_eq!(monitor.ongoing_topics().await, vec!["orders_v1".to_string()]);

        monitor.mark_error("orders_v1", "disk full").await;
        let push = monitor.status("orders_v1").await.unwrap();
        assert_eq!(push.status, PushStatus::Error);
        assert_eq!(push.details.as_deref(), Some("disk full"));
        assert!(monitor.ongoing_topics().await.is_empty());

        monitor.stop_monitor("orders_v1").await;
        assert!(monitor.status("orders_v1").await.is_none());
    }

    #[tokio::test]
    async fn buffer_replays() {
        let monitor = PushMonitor::new();
        monitor.start_buffer_replay("orders_rt", "orders_v2").await;
        assert!(monitor.replay_active("orders_v2").await);
        monitor.stop_buffer_replay("orders_v2").await;
        assert!(!monitor.replay_active("orders_v2").await);
        // Stopping twice is harmless.
        monitor.stop_buffer_replay("orders_v2").await;
    }
}
