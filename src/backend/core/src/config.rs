//! Configuration for the engine and its subsystems.
//!
//! One config struct per component, composed into [`FacetConfig`]. All
//! structs deserialize with serde and carry sensible defaults so an empty
//! document yields a working configuration. Durations accept human-readable
//! forms (`"30s"`, `"100ms"`) via `humantime_serde`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::EvictionPolicy;

/// Top-level configuration for a Facet deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacetConfig {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Dependency tracker configuration
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Invalidator configuration
    #[serde(default)]
    pub invalidator: InvalidatorConfig,

    /// Computation context configuration
    #[serde(default)]
    pub context: ContextConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the attribute engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default compute timeout applied when a definition does not set one
    #[serde(with = "humantime_serde", default = "default_compute_timeout")]
    pub default_timeout: Duration,

    /// Cap on simultaneously in-flight computations (single-flight slots)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_computations: usize,

    /// Capacity of the engine event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_compute_timeout(),
            max_concurrent_computations: default_max_concurrent(),
            event_capacity: default_event_capacity(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the attribute cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of resident entries (enforced eagerly)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Memory cap in bytes (enforced on the cleanup cycle)
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,

    /// TTL applied when a set does not specify one
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub default_ttl: Duration,

    /// Interval between cleanup cycles
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,

    /// Eviction policy applied when caps are hit
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,

    /// Capacity of the cache event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_memory_bytes: default_max_memory_bytes(),
            default_ttl: default_ttl(),
            cleanup_interval: default_cleanup_interval(),
            eviction_policy: EvictionPolicy::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dependency Tracker
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the dependency tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Maximum dependency chain depth from any attribute
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Maximum outgoing dependencies per attribute
    #[serde(default = "default_max_dependencies")]
    pub max_dependencies_per_attribute: usize,

    /// Capacity of the graph event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_dependencies_per_attribute: default_max_dependencies(),
            event_capacity: default_event_capacity(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidator
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the invalidation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidatorConfig {
    /// Whether queued requests are batched (when false, every queue call
    /// processes immediately)
    #[serde(default = "default_true")]
    pub batching_enabled: bool,

    /// Pending size that triggers a batch flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum age of the oldest pending request before a flush
    #[serde(with = "humantime_serde", default = "default_batch_timeout")]
    pub batch_timeout: Duration,

    /// Whether invalidations cascade through the dependency graph
    #[serde(default = "default_true")]
    pub enable_cascading: bool,

    /// Whether the dependency axis consults the tracker for affected sets
    #[serde(default = "default_true")]
    pub enable_dependency_tracking: bool,

    /// Per-request execution deadline
    #[serde(with = "humantime_serde", default = "default_invalidation_timeout")]
    pub invalidation_timeout: Duration,

    /// Bound on the in-memory log of recent invalidation outcomes
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// Capacity of the invalidator event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for InvalidatorConfig {
    fn default() -> Self {
        Self {
            batching_enabled: true,
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
            enable_cascading: true,
            enable_dependency_tracking: true,
            invalidation_timeout: default_invalidation_timeout(),
            max_log_entries: default_max_log_entries(),
            event_capacity: default_event_capacity(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Computation Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for computation context construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Byte bound on the serialized custom data attached to a context
    #[serde(default = "default_max_custom_data_bytes")]
    pub max_custom_data_bytes: usize,

    /// Whether contexts may carry an HTTP client at all (a definition's
    /// security policy must additionally allow it)
    #[serde(default)]
    pub allow_http: bool,

    /// Whether contexts may carry user/auth capabilities
    #[serde(default = "default_true")]
    pub expose_user_context: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_custom_data_bytes: default_max_custom_data_bytes(),
            allow_http: false,
            expose_user_context: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Defaults
// ═══════════════════════════════════════════════════════════════════════════════

fn default_compute_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent() -> usize {
    100
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_entries() -> usize {
    10_000
}

fn default_max_memory_bytes() -> u64 {
    100 * 1024 * 1024 // 100 MB
}

fn default_ttl() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_depth() -> usize {
    10
}

fn default_max_dependencies() -> usize {
    50
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_invalidation_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_log_entries() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_max_custom_data_bytes() -> usize {
    64 * 1024 // 64 KB
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
