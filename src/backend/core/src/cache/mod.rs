//! Attribute value caching.
//!
//! This module provides the memoisation layer of the engine:
//!
//! - **Structured keys**: `(attribute, target kind, target id, fingerprint)`
//!   with a canonical string form used purely for internal indexing
//! - **Bounded store**: TTL per entry, an eager entry cap, and a memory cap
//!   enforced on a periodic cleanup cycle
//! - **Multi-axis invalidation**: by attribute, dependency tag, target, or
//!   collection
//! - **Snapshots**: versioned export/import for warm restarts

pub mod key;
pub mod snapshot;
pub mod store;

pub use key::{hash_for_key, CacheKey};
pub use snapshot::{CacheSnapshot, ImportReport, SnapshotEntry, SNAPSHOT_VERSION};
pub use store::{
    AttributeCache, CacheEntry, CacheOperationResult, CacheStats, CleanupReport, EvictionPolicy,
};
