//! Controller error taxonomy.
//!
//! Every admin operation surfaces one of these kinds. Precondition failures
//! are reported as-is; infrastructure failures during a mutation trigger the
//! operation's compensation path first and are then re-raised.

use thiserror::Error;

use strata_cluster::ClusterError;
use strata_metadata::MetadataError;
use strata_topics::TopicError;

pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// This controller is not the admin leader of the cluster. Not retryable
    /// here; callers consult discovery for the current leader.
    #[error("Controller {controller} is not the leader of cluster {cluster}")]
    NotLeader { cluster: String, controller: String },

    /// The cluster was never started on this controller.
    #[error("Cluster not initialized: {0}")]
    ClusterNotInitialized(String),

    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Version {version} not found for store {store}")]
    VersionNotFound { store: String, version: i32 },

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Store already exists: {0}")]
    StoreAlreadyExists(String),

    #[error("Version {version} already exists in store {store}")]
    VersionAlreadyExists { store: String, version: i32 },

    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    #[error("Resource already exists: {0}")]
    ResourceAlreadyExists(String),

    /// Rejected mutation: the request contradicts the store's current state
    /// or the platform's configuration rules.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Schema is incompatible: {0}")]
    SchemaIncompatible(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Timed out joining cluster {cluster} after {waited_ms} ms")]
    JoinTimeout { cluster: String, waited_ms: u64 },

    #[error("Timed out waiting for assignment of {resource} after {waited_ms} ms")]
    AssignmentTimeout { resource: String, waited_ms: u64 },

    #[error("Metadata store unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("Topic manager unavailable: {0}")]
    TopicManagerUnavailable(String),

    #[error("Coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    /// Invariant violation. Nothing the caller can do; page someone.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl ControllerError {
    /// HTTP status the (out-of-scope) admin surface maps this kind to.
    pub fn http_status(&self) -> u16 {
        match self {
            ControllerError::NotLeader { .. } => 401,
            ControllerError::StoreNotFound(_)
            | ControllerError::VersionNotFound { .. }
            | ControllerError::TopicNotFound(_)
            | ControllerError::ResourceNotFound(_)
            | ControllerError::SchemaNotFound(_) => 404,
            ControllerError::Conflict(_)
            | ControllerError::StoreAlreadyExists(_)
            | ControllerError::VersionAlreadyExists { .. }
            | ControllerError::TopicAlreadyExists(_)
            | ControllerError::ResourceAlreadyExists(_) => 409,
            ControllerError::SchemaIncompatible(_) | ControllerError::InvalidSchema(_) => 400,
            _ => 500,
        }
    }
}

impl From<MetadataError> for ControllerError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::StoreNotFound(s) => ControllerError::StoreNotFound(s),
            MetadataError::StoreAlreadyExists(s) => ControllerError::StoreAlreadyExists(s),
            MetadataError::ConcurrentUpdate(s) => ControllerError::Fatal(format!(
                "concurrent update to store {s} exhausted retries"
            )),
            MetadataError::SchemaNotFound { store, id } => {
                ControllerError::SchemaNotFound(format!("store {store} schema id {id}"))
            }
            MetadataError::KeySchemaMismatch(s) => ControllerError::Conflict(format!(
                "key schema for store {s} is already initialized with a different schema"
            )),
            MetadataError::SchemaIncompatible(msg) => ControllerError::SchemaIncompatible(msg),
            MetadataError::InvalidSchema(msg) => ControllerError::InvalidSchema(msg),
            MetadataError::Database(e) => ControllerError::MetadataUnavailable(e.to_string()),
            MetadataError::Serialization(e) => ControllerError::Fatal(e.to_string()),
        }
    }
}

impl From<TopicError> for ControllerError {
    fn from(e: TopicError) -> Self {
        match e {
            TopicError::TopicNotFound(t) => ControllerError::TopicNotFound(t),
            TopicError::TopicAlreadyExists(t) => ControllerError::TopicAlreadyExists(t),
            TopicError::InvalidConfig(msg) => ControllerError::Conflict(msg),
            TopicError::Bus(e) => ControllerError::TopicManagerUnavailable(e.to_string()),
            TopicError::Serialization(e) => ControllerError::Fatal(e.to_string()),
        }
    }
}

impl From<ClusterError> for ControllerError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::ClusterNotFound(c) => ControllerError::ClusterNotInitialized(c),
            ClusterError::ResourceNotFound { resource, .. } => {
                ControllerError::ResourceNotFound(resource)
            }
            ClusterError::ResourceAlreadyExists { resource, .. } => {
                ControllerError::ResourceAlreadyExists(resource)
            }
            ClusterError::AssignmentTimeout { resource, waited_ms } => {
                ControllerError::AssignmentTimeout { resource, waited_ms }
            }
            ClusterError::JoinTimeout { cluster, waited_ms } => {
                ControllerError::JoinTimeout { cluster, waited_ms }
            }
            ClusterError::LeaseHeldByOther { resource, holder } => ControllerError::Conflict(
                format!("leadership of {resource} is held by {holder}"),
            ),
            ClusterError::InstanceStillConnected { cluster, instance } => {
                ControllerError::Conflict(format!(
                    "instance {instance} is still connected to cluster {cluster}"
                ))
            }
            ClusterError::Coordinator(e) => ControllerError::CoordinatorUnavailable(e.to_string()),
            ClusterError::Serialization(e) => ControllerError::Fatal(e.to_string()),
        }
    }
}
