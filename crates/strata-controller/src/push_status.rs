//! Push-job status write-back.
//!
//! A single producer appends `(key, value)` status records to the push-status
//! store's real-time topic. That store is itself created asynchronously on
//! bootstrap, so the topic is resolved lazily with a handful of retries. The
//! side-channel is strictly best-effort: once initialized, an individual
//! write failure is logged and swallowed so it can never fail the operation
//! that reported the status.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::engine::LifecycleEngine;
use crate::error::{ControllerError, Result};

const TOPIC_RESOLVE_MAX_ATTEMPTS: u32 = 5;
const TOPIC_RESOLVE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

pub struct PushJobStatusWriter {
    engine: Arc<LifecycleEngine>,
    topic: Mutex<Option<String>>,
}

impl PushJobStatusWriter {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self {
            engine,
            topic: Mutex::new(None),
        }
    }

    /// Append one status record. Fails only when the side-channel is not
    /// configured or its topic never becomes resolvable.
    pub async fn send_push_job_status(&self, key: Value, value: Value) -> Result<()> {
        let config = self.engine.config();
        if config.push_status_store_cluster.is_empty() || config.push_status_store_name.is_empty()
        {
            return Err(ControllerError::Conflict(
                "push job status store is not configured".to_string(),
            ));
        }

        let topic = self.resolve_topic().await?;
        if let Err(e) = self
            .engine
            .writer
            .append_status_record(&topic, key, value, config.push_status_value_schema_id)
            .await
        {
            warn!(topic = %topic, error = %e, "Dropped push job status record");
        }
        Ok(())
    }

    async fn resolve_topic(&self) -> Result<String> {
        let mut cached = self.topic.lock().await;
        if let Some(topic) = cached.as_ref() {
            return Ok(topic.clone());
        }

        let config = self.engine.config();
        let mut attempt = 1;
        loop {
            match self
                .engine
                .ensure_real_time_topic(
                    &config.push_status_store_cluster,
                    &config.push_status_store_name,
                )
                .await
            {
                Ok(topic) => {
                    info!(topic = %topic, "Resolved push job status topic");
                    *cached = Some(topic.clone());
                    return Ok(topic);
                }
                Err(e) if attempt < TOPIC_RESOLVE_MAX_ATTEMPTS => {
                    info!(
                        attempt,
                        max_attempts = TOPIC_RESOLVE_MAX_ATTEMPTS,
                        error = %e,
                        "Push job status topic not ready yet"
                    );
                    attempt += 1;
                    sleep(TOPIC_RESOLVE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
