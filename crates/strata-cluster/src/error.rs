//! Error types for coordinator and mastership operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Resource not found: {resource} in cluster {cluster}")]
    ResourceNotFound { cluster: String, resource: String },

    #[error("Resource already exists: {resource} in cluster {cluster}")]
    ResourceAlreadyExists { cluster: String, resource: String },

    /// Not enough replicas were assigned within the deadline.
    #[error("Timed out waiting for assignment of resource {resource} after {waited_ms} ms")]
    AssignmentTimeout { resource: String, waited_ms: u64 },

    /// This controller could not become leader within the join deadline.
    #[error("Timed out joining cluster {cluster} after {waited_ms} ms")]
    JoinTimeout { cluster: String, waited_ms: u64 },

    #[error("Leadership of {resource} is held by {holder}")]
    LeaseHeldByOther { resource: String, holder: String },

    #[error("Instance {instance} is still connected to cluster {cluster}")]
    InstanceStillConnected { cluster: String, instance: String },

    /// Connection-level failure talking to the cluster manager. Retryable
    /// for reads, fatal for the current mutation.
    #[error("Coordinator unavailable: {0}")]
    Coordinator(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
