//! Error types for metadata store operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Store already exists: {0}")]
    StoreAlreadyExists(String),

    /// Compare-and-set failed: the row changed underneath the caller. The
    /// caller is expected to re-read and retry.
    #[error("Concurrent update to store: {0}")]
    ConcurrentUpdate(String),

    #[error("Schema not found for store {store}: id {id}")]
    SchemaNotFound { store: String, id: i32 },

    #[error("Key schema already initialized for store {0} with a different schema")]
    KeySchemaMismatch(String),

    #[error("Schema is incompatible: {0}")]
    SchemaIncompatible(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
