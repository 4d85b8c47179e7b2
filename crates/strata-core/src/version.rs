//! Store versions and their lifecycle states.

use serde::{Deserialize, Serialize};

use crate::topics;

/// Lifecycle state of one store version.
///
/// Transitions: `NotCreated -> Started` at creation, `Started -> Pushed ->
/// Online` on a successful push, `Started -> Error` on failure. `Online` and
/// `Error` are terminal for the version object itself; removal from the store
/// is a separate deletion operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStatus {
    NotCreated,
    Started,
    Pushed,
    Online,
    Error,
}

impl VersionStatus {
    /// Whether a push that reached this state can still make progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, VersionStatus::Online | VersionStatus::Error)
    }
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VersionStatus::NotCreated => "NOT_CREATED",
            VersionStatus::Started => "STARTED",
            VersionStatus::Pushed => "PUSHED",
            VersionStatus::Online => "ONLINE",
            VersionStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// One immutable snapshot of a store's contents, produced by a single push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub store_name: String,
    pub number: i32,
    /// Identifier of the push job that produced this version. Unique per
    /// store; `increment_version_idempotent` relies on it.
    pub push_job_id: String,
    pub status: VersionStatus,
    pub created_at: i64,
    pub partition_count: i32,
    pub replication_factor: i32,
}

impl Version {
    pub fn new(store_name: impl Into<String>, number: i32, push_job_id: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            number,
            push_job_id: push_job_id.into(),
            status: VersionStatus::Started,
            created_at: crate::now_ms(),
            partition_count: 0,
            replication_factor: 0,
        }
    }

    /// Name of the version topic carrying this version's batch push. The
    /// coordinator resource for this version shares the same name.
    pub fn topic_name(&self) -> String {
        topics::compose_version_topic(&self.store_name, self.number)
    }
}
