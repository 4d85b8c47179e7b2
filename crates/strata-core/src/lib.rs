//! Core domain types for the Strata control plane.
//!
//! This crate holds the value objects shared by every other Strata crate:
//! stores and their versioned lifecycle, hybrid configuration, the discovery
//! row that maps a store to its owning cluster, the graveyard entry that
//! survives store deletion, and the topic naming scheme.
//!
//! Everything here is a plain serde value object. Ownership of the durable
//! copy always lives with the metadata store; any `Store` handed out by an
//! accessor is an owned snapshot, so mutating it has no effect until it is
//! written back through a compare-and-set update.

pub mod hybrid;
pub mod store;
pub mod topics;
pub mod version;

pub use hybrid::HybridStoreConfig;
pub use store::{CompressionStrategy, GraveyardEntry, Store, StoreConfig};
pub use version::{Version, VersionStatus};

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
