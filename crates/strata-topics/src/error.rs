//! Error types for topic administration.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TopicError>;

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    #[error("Invalid topic configuration: {0}")]
    InvalidConfig(String),

    #[error("Bus error: {0}")]
    Bus(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
