//! Hybrid store configuration.
//!
//! A hybrid store serves a batch-pushed version while continuously applying
//! streaming updates replayed from its real-time topic. A version goes online
//! once replay has caught up to within `offset_lag_threshold` records after
//! rewinding `rewind_seconds` of the stream.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridStoreConfig {
    pub rewind_seconds: i64,
    pub offset_lag_threshold: i64,
}

impl HybridStoreConfig {
    pub fn new(rewind_seconds: i64, offset_lag_threshold: i64) -> Self {
        Self {
            rewind_seconds,
            offset_lag_threshold,
        }
    }
}
