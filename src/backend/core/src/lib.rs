#![allow(clippy::result_large_err)]
//! # Facet Core
//!
//! A per-process computed-attribute engine: register attribute definitions
//! once, then ask for values by `(attribute, target)`. Facet computes on
//! demand, memoises with bounded memory and TTL, tracks inter-attribute
//! dependencies, and cascades invalidation when upstream data or attributes
//! change.
//!
//! ## Architecture
//!
//! - **Engine**: definition registry, scheduled computation, single-flight
//!   coalescing, timeout enforcement
//! - **Cache**: keyed store with TTL, eviction policies, memory accounting,
//!   multi-axis invalidation, snapshot export/import
//! - **DependencyTracker**: directed graph of attribute dependencies with
//!   cycle detection, topological ordering, and depth bounds
//! - **Invalidator**: queued, batched invalidation pipeline fanning out
//!   across axes and ingesting database change events
//! - **ContextBuilder**: capability bundles handed to opaque compute bodies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use facet_core::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let cache = Arc::new(AttributeCache::new(CacheConfig::default()));
//! let tracker = Arc::new(DependencyTracker::new(TrackerConfig::default()));
//! let engine = AttributeEngine::new(EngineConfig::default())
//!     .with_cache(cache.clone())
//!     .with_tracker(tracker.clone());
//! engine.initialise()?;
//!
//! engine.register(
//!     AttributeDefinition::builder("user.score", "User score")
//!         .target(TargetKind::User)
//!         .compute(|ctx| async move { Ok(json!(ctx.target_id.len())) })
//!         .build()?,
//! )?;
//!
//! let ctx = ContextBuilder::new(ContextConfig::default())
//!     .for_user(database, "u1")
//!     .build()?;
//! let score = engine.compute("user.score", &ctx).await?;
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod invalidator;
pub mod singleflight;
pub mod tracker;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, FacetError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{
        AttributeCache, CacheEntry, CacheKey, CacheSnapshot, CacheStats, EvictionPolicy,
        ImportReport,
    };
    pub use crate::config::{
        CacheConfig, ContextConfig, EngineConfig, FacetConfig, InvalidatorConfig, TrackerConfig,
    };
    pub use crate::context::{ComputationContext, ContextBuilder};
    pub use crate::db::{
        AuthContext, ChangeEvent, ChangeKind, CollectionHandle, Database, MemoryDatabase, UserRef,
    };
    pub use crate::definition::{
        AttributeDefinition, AttributeValue, CachePolicy, DependencyKind, DependencyPriority,
        DependencySpec, SecurityPolicy, TargetKind, TargetSelector,
    };
    pub use crate::engine::{AttributeEngine, BatchOutcome, EngineStats};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, FacetError, Result};
    pub use crate::events::{CacheEvent, EngineEvent, GraphEvent, InvalidatorEvent, RemovalReason};
    pub use crate::health::{ComponentHealth, HealthStatus};
    pub use crate::invalidator::{
        InvalidationAxis, InvalidationOutcome, InvalidationPriority, InvalidationRequest,
        Invalidator, InvalidatorMetrics,
    };
    pub use crate::tracker::{DependencyTracker, TrackerStats};
}
