//! The attribute engine.
//!
//! Hosts the registry of attribute definitions and serves computations with
//! caching, single-flight coalescing, timeout enforcement, and event
//! emission. The engine owns the definitions and the flight table; the cache
//! and tracker are injected collaborators.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::{AttributeCache, CacheKey};
use crate::config::EngineConfig;
use crate::context::ComputationContext;
use crate::definition::{AttributeDefinition, AttributeValue, TargetKind};
use crate::error::{FacetError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::health::ComponentHealth;
use crate::singleflight::{await_follower, FlightFailure, FlightSlot, SingleFlight};
use crate::tracker::DependencyTracker;

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Definitions currently registered
    pub registered_attributes: u64,
    /// Compute bodies that finished successfully
    pub successful_computations: u64,
    /// Compute bodies that failed or timed out
    pub failed_computations: u64,
    /// Lookups served from the cache
    pub cache_hits: u64,
    /// Accumulated compute time in milliseconds
    pub total_compute_time_ms: u64,
    /// Mean compute time in milliseconds
    pub avg_compute_time_ms: f64,
    /// Computations currently in flight
    pub in_flight: u64,
    /// failed / (successful + failed)
    pub error_rate: f64,
}

/// Outcome of a bulk computation: per-id values, with failures recorded on a
/// side channel instead of aborting the batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Values for the ids that computed successfully
    pub values: HashMap<String, AttributeValue>,
    /// Errors for the ids that failed
    pub errors: HashMap<String, FacetError>,
}

impl BatchOutcome {
    /// Whether every id produced a value.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Attribute Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Registry and computation scheduler for attribute definitions.
pub struct AttributeEngine {
    config: EngineConfig,
    definitions: DashMap<String, Arc<AttributeDefinition>>,
    cache: Option<Arc<AttributeCache>>,
    tracker: Option<Arc<DependencyTracker>>,
    flights: SingleFlight,
    events: EventBus<EngineEvent>,

    initialised: AtomicBool,
    successful: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    compute_time_ms: AtomicU64,
}

impl AttributeEngine {
    /// Create an engine with the given configuration and no collaborators.
    pub fn new(config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            definitions: DashMap::new(),
            cache: None,
            tracker: None,
            flights: SingleFlight::new(),
            events,
            initialised: AtomicBool::new(false),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            compute_time_ms: AtomicU64::new(0),
        }
    }

    /// Attach a cache.
    pub fn with_cache(mut self, cache: Arc<AttributeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attach a dependency tracker.
    pub fn with_tracker(mut self, tracker: Arc<DependencyTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The attached cache, if any.
    pub fn cache(&self) -> Option<&Arc<AttributeCache>> {
        self.cache.as_ref()
    }

    /// The attached tracker, if any.
    pub fn tracker(&self) -> Option<&Arc<DependencyTracker>> {
        self.tracker.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Initialise the engine. Fails on double initialisation.
    pub fn initialise(&self) -> Result<()> {
        if self.initialised.swap(true, Ordering::SeqCst) {
            return Err(FacetError::already_initialised("engine"));
        }
        info!("Attribute engine initialised");
        self.events.emit(EngineEvent::Initialised {
            at: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Shut the engine down. Registered definitions survive a shutdown;
    /// callers are rejected until the next initialise.
    pub fn shutdown(&self) -> Result<()> {
        if !self.initialised.swap(false, Ordering::SeqCst) {
            return Err(FacetError::not_initialised("engine"));
        }
        info!("Attribute engine shut down");
        self.events.emit(EngineEvent::Shutdown {
            at: chrono::Utc::now(),
        });
        Ok(())
    }

    fn ensure_initialised(&self) -> Result<()> {
        if self.initialised.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FacetError::not_initialised("engine"))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a definition.
    ///
    /// Fails when the engine is not initialised, when a structural invariant
    /// is violated, or when the id already exists. Declared dependencies are
    /// installed as tracker edges; a rejected edge (cycle, depth, cap) rolls
    /// the registration back completely.
    #[instrument(skip(self, definition), fields(attribute_id = %definition.id))]
    pub fn register(&self, definition: AttributeDefinition) -> Result<()> {
        self.ensure_initialised()?;
        definition.validate()?;

        let id = definition.id.clone();
        match self.definitions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(FacetError::duplicate_attribute(id)),
            Entry::Vacant(vacant) => {
                if let Some(tracker) = &self.tracker {
                    let mut installed: Vec<String> = Vec::new();
                    for dep in &definition.dependencies {
                        match tracker.add_edge(&id, dep.clone()) {
                            Ok(()) => installed.push(dep.tag()),
                            Err(error) => {
                                // Roll back the edges this registration added
                                for target in &installed {
                                    tracker.remove_edge(&id, target);
                                }
                                return Err(error);
                            }
                        }
                    }
                }
                vacant.insert(Arc::new(definition));
            }
        }

        counter!("facet_attributes_registered_total").increment(1);
        info!(attribute_id = %id, "Attribute registered");
        self.events
            .emit(EngineEvent::AttributeRegistered { attribute_id: id });
        Ok(())
    }

    /// Unregister a definition, dropping its graph edges and invalidating
    /// every cached value computed from it.
    #[instrument(skip(self))]
    pub fn unregister(&self, attribute_id: &str) -> Result<()> {
        self.ensure_initialised()?;
        let (id, _definition) = self
            .definitions
            .remove(attribute_id)
            .ok_or_else(|| FacetError::attribute_not_found(attribute_id))?;

        if let Some(tracker) = &self.tracker {
            tracker.remove_attribute(&id);
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_by_attribute(&id, None);
        }

        info!(attribute_id = %id, "Attribute unregistered");
        self.events
            .emit(EngineEvent::AttributeUnregistered { attribute_id: id });
        Ok(())
    }

    /// Look up a definition.
    pub fn get(&self, attribute_id: &str) -> Option<Arc<AttributeDefinition>> {
        self.definitions.get(attribute_id).map(|d| d.clone())
    }

    /// List registered definitions, optionally filtered by target kind.
    pub fn list(&self, target_kind: Option<TargetKind>) -> Vec<Arc<AttributeDefinition>> {
        self.definitions
            .iter()
            .filter(|entry| target_kind.map_or(true, |kind| entry.value().target.matches(kind)))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Validate a definition without registering it.
    pub fn validate(&self, definition: &AttributeDefinition) -> Result<()> {
        definition.validate()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Computation
    // ─────────────────────────────────────────────────────────────────────────

    /// Compute an attribute value for the context's target.
    ///
    /// Serves from the cache when possible; otherwise coalesces concurrent
    /// callers onto a single compute body raced against the definition's
    /// timeout. Successful results are cached with the definition's TTL and
    /// dependency tags; failures are never cached.
    #[instrument(skip(self, ctx), fields(target_id = %ctx.target_id))]
    pub async fn compute(
        &self,
        attribute_id: &str,
        ctx: &ComputationContext,
    ) -> Result<AttributeValue> {
        self.ensure_initialised()?;

        let definition = self
            .get(attribute_id)
            .ok_or_else(|| FacetError::attribute_not_found(attribute_id))?;

        if !definition.target.matches(ctx.target_kind) {
            return Err(FacetError::validation(format!(
                "Attribute '{}' does not apply to {} targets",
                attribute_id, ctx.target_kind
            )));
        }

        let mut key = CacheKey::new(attribute_id, ctx.target_kind, ctx.target_id.clone());
        if let Some(fingerprint) = ctx.fingerprint() {
            key = key.with_fingerprint(fingerprint);
        }

        let use_cache = self.cache.is_some() && definition.caching.enabled;
        if use_cache {
            if let Some(value) = self.cache.as_ref().and_then(|c| c.get(&key)) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.events.emit(EngineEvent::CacheHit {
                    attribute_id: attribute_id.to_string(),
                    target_id: ctx.target_id.clone(),
                });
                return Ok(value);
            }
            self.events.emit(EngineEvent::CacheMiss {
                attribute_id: attribute_id.to_string(),
                target_id: ctx.target_id.clone(),
            });
        }

        let flight_key = format!("{}:{}", attribute_id, ctx.target_id);
        let guard = match self.flights.begin(&flight_key) {
            FlightSlot::Follower(receiver) => {
                debug!(%flight_key, "Awaiting in-flight computation");
                return await_follower(receiver).await;
            }
            FlightSlot::Leader(guard) => guard,
        };

        let timeout = definition
            .security
            .timeout
            .unwrap_or(self.config.default_timeout);
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, (definition.compute)(ctx.clone())).await;
        let elapsed = started.elapsed();

        match outcome {
            Err(_elapsed) => {
                let error = FacetError::computation_timeout(attribute_id, timeout.as_millis() as u64)
                    .with_target(ctx.target_id.clone());
                guard.complete(Err(FlightFailure::from(&error)));
                self.record_failure(attribute_id, Some(&ctx.target_id), &error);
                Err(error)
            }
            Ok(Err(body_error)) => {
                let error = FacetError::computation_failed(attribute_id, body_error.message())
                    .with_target(ctx.target_id.clone())
                    .with_source(body_error);
                guard.complete(Err(FlightFailure::from(&error)));
                self.record_failure(attribute_id, Some(&ctx.target_id), &error);
                Err(error)
            }
            Ok(Ok(value)) => {
                if use_cache {
                    if let Some(cache) = &self.cache {
                        if let Err(error) = cache.set(
                            &key,
                            value.clone(),
                            definition.caching.ttl,
                            definition.dependency_tags(),
                            elapsed,
                        ) {
                            warn!(attribute_id, error = %error, "Failed to cache computed value");
                        }
                    }
                }

                guard.complete(Ok(value.clone()));

                let elapsed_ms = elapsed.as_millis() as u64;
                self.successful.fetch_add(1, Ordering::Relaxed);
                self.compute_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
                counter!("facet_computations_total", "result" => "ok").increment(1);
                histogram!("facet_compute_duration_ms").record(elapsed_ms as f64);

                self.events.emit(EngineEvent::Computed {
                    attribute_id: attribute_id.to_string(),
                    target_id: ctx.target_id.clone(),
                    elapsed_ms,
                    from_cache: false,
                });
                Ok(value)
            }
        }
    }

    /// Compute several attributes sequentially, preserving order. Per-item
    /// failures are recorded on the outcome's error channel; the batch
    /// continues.
    pub async fn compute_many(
        &self,
        attribute_ids: &[impl AsRef<str>],
        ctx: &ComputationContext,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in attribute_ids {
            let id = id.as_ref();
            match self.compute(id, ctx).await {
                Ok(value) => {
                    outcome.values.insert(id.to_string(), value);
                }
                Err(error) => {
                    outcome.errors.insert(id.to_string(), error);
                }
            }
        }
        outcome
    }

    /// Compute every registered attribute whose target selector covers the
    /// given kind, for the context's target.
    pub async fn compute_all_for_target(
        &self,
        target_kind: TargetKind,
        target_id: &str,
        ctx: &ComputationContext,
    ) -> Result<BatchOutcome> {
        if ctx.target_id != target_id || ctx.target_kind != target_kind {
            return Err(FacetError::validation(
                "Context target does not match the requested target",
            ));
        }

        let ids: Vec<String> = self
            .list(Some(target_kind))
            .into_iter()
            .map(|d| d.id.clone())
            .collect();
        Ok(self.compute_many(&ids, ctx).await)
    }

    /// Best-effort precompute of the given attributes for each context,
    /// populating the cache. Failures are skipped; returns how many values
    /// were computed.
    pub async fn warm_up(
        &self,
        attribute_ids: &[impl AsRef<str>],
        contexts: &[ComputationContext],
    ) -> usize {
        let mut warmed = 0;
        for ctx in contexts {
            for id in attribute_ids {
                if self.compute(id.as_ref(), ctx).await.is_ok() {
                    warmed += 1;
                }
            }
        }
        debug!(warmed, "Engine warmup completed");
        warmed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cache Control
    // ─────────────────────────────────────────────────────────────────────────

    /// Invalidate cached values for an attribute, optionally narrowed to one
    /// target.
    pub fn invalidate(&self, attribute_id: &str, target_id: Option<&str>) -> Result<u64> {
        self.ensure_initialised()?;
        let count = self
            .cache
            .as_ref()
            .map(|c| c.invalidate_by_attribute(attribute_id, target_id))
            .unwrap_or(0);

        self.events.emit(EngineEvent::Invalidated {
            attribute_id: attribute_id.to_string(),
            target_id: target_id.map(|t| t.to_string()),
            count,
        });
        Ok(count)
    }

    /// Drop every cached value.
    pub fn clear_all(&self) -> Result<u64> {
        self.ensure_initialised()?;
        Ok(self.cache.as_ref().map(|c| c.clear()).unwrap_or(0))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Engine counters.
    pub fn stats(&self) -> EngineStats {
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = successful + failed;
        let compute_time = self.compute_time_ms.load(Ordering::Relaxed);

        EngineStats {
            registered_attributes: self.definitions.len() as u64,
            successful_computations: successful,
            failed_computations: failed,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            total_compute_time_ms: compute_time,
            avg_compute_time_ms: if successful > 0 {
                compute_time as f64 / successful as f64
            } else {
                0.0
            },
            in_flight: self.flights.len() as u64,
            error_rate: if total > 0 {
                failed as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Health snapshot. Healthy iff initialised, single-flight occupancy is
    /// below 80% of its cap, and the error rate is below 10%.
    pub fn health(&self) -> ComponentHealth {
        let stats = self.stats();
        let initialised = self.initialised.load(Ordering::SeqCst);
        let occupancy =
            stats.in_flight as f64 / self.config.max_concurrent_computations.max(1) as f64;

        let health = if !initialised {
            ComponentHealth::unhealthy("engine").with_message("not initialised")
        } else if occupancy >= 0.8 {
            ComponentHealth::degraded("engine").with_message("single-flight occupancy above 80%")
        } else if stats.error_rate >= 0.1 {
            ComponentHealth::degraded("engine").with_message("error rate above 10%")
        } else {
            ComponentHealth::healthy("engine")
        };

        let cache_bytes = self
            .cache
            .as_ref()
            .map(|c| c.stats().size_bytes)
            .unwrap_or(0);

        health
            .with_detail("initialised", initialised)
            .with_detail("registered_attributes", stats.registered_attributes)
            .with_detail("cache_memory_bytes", cache_bytes)
            .with_detail("avg_compute_time_ms", stats.avg_compute_time_ms)
            .with_detail("error_rate", stats.error_rate)
            .with_detail("in_flight", stats.in_flight)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn record_failure(&self, attribute_id: &str, target_id: Option<&str>, error: &FacetError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        counter!("facet_computations_total", "result" => "error").increment(1);
        error.log();
        self.events.emit(EngineEvent::Error {
            attribute_id: attribute_id.to_string(),
            target_id: target_id.map(|t| t.to_string()),
            code: error.code(),
            message: error.message().to_string(),
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ContextConfig, TrackerConfig};
    use crate::context::ContextBuilder;
    use crate::db::{Database, MemoryDatabase};
    use crate::definition::DependencySpec;
    use crate::error::ErrorCode;
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> AttributeEngine {
        let engine = AttributeEngine::new(EngineConfig::default())
            .with_cache(Arc::new(AttributeCache::new(CacheConfig::default())))
            .with_tracker(Arc::new(DependencyTracker::new(TrackerConfig::default())));
        engine.initialise().unwrap();
        engine
    }

    fn db() -> Arc<dyn Database> {
        Arc::new(MemoryDatabase::new("test"))
    }

    fn user_ctx(target: &str) -> ComputationContext {
        ContextBuilder::new(ContextConfig::default())
            .for_user(db(), target)
            .build()
            .unwrap()
    }

    fn constant(id: &str, value: AttributeValue) -> AttributeDefinition {
        AttributeDefinition::builder(id, id)
            .target(TargetKind::User)
            .compute(move |_| {
                let value = value.clone();
                async move { Ok(value) }
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_compute() {
        let e = engine();
        e.register(constant("user.answer", json!(42))).unwrap();

        let value = e.compute("user.answer", &user_ctx("u1")).await.unwrap();
        assert_eq!(value, json!(42));
        assert_eq!(e.stats().successful_computations, 1);
    }

    #[tokio::test]
    async fn test_register_requires_initialised_engine() {
        let e = AttributeEngine::new(EngineConfig::default());
        let err = e.register(constant("a", json!(1))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotInitialised);
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let e = engine();
        e.register(constant("a", json!(1))).unwrap();
        let err = e.register(constant("a", json!(2))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateAttribute);
    }

    #[tokio::test]
    async fn test_reregister_after_unregister() {
        let e = engine();
        e.register(constant("a", json!(1))).unwrap();
        e.unregister("a").unwrap();
        assert!(e.get("a").is_none());

        e.register(constant("a", json!(2))).unwrap();
        assert_eq!(
            e.compute("a", &user_ctx("u1")).await.unwrap(),
            json!(2)
        );
    }

    #[tokio::test]
    async fn test_compute_unknown_attribute() {
        let e = engine();
        let err = e.compute("missing", &user_ctx("u1")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AttributeNotFound);
    }

    #[tokio::test]
    async fn test_target_kind_mismatch() {
        let e = engine();
        e.register(
            AttributeDefinition::builder("db.size", "DB size")
                .target(TargetKind::Database)
                .compute(|_| async { Ok(json!(0)) })
                .build()
                .unwrap(),
        )
        .unwrap();

        let err = e.compute("db.size", &user_ctx("u1")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_second_compute_is_cache_hit() {
        let e = engine();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        e.register(
            AttributeDefinition::builder("a", "A")
                .target(TargetKind::User)
                .compute(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("computed"))
                    }
                })
                .build()
                .unwrap(),
        )
        .unwrap();

        let ctx = user_ctx("u1");
        e.compute("a", &ctx).await.unwrap();
        e.compute("a", &ctx).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(e.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_no_cache_definition_recomputes() {
        let e = engine();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        e.register(
            AttributeDefinition::builder("a", "A")
                .target(TargetKind::User)
                .no_cache()
                .compute(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(1))
                    }
                })
                .build()
                .unwrap(),
        )
        .unwrap();

        let ctx = user_ctx("u1");
        e.compute("a", &ctx).await.unwrap();
        e.compute("a", &ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_computation_timeout() {
        let e = engine();
        e.register(
            AttributeDefinition::builder("slow", "Slow")
                .target(TargetKind::User)
                .timeout(Duration::from_millis(50))
                .compute(|_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(json!("never"))
                })
                .build()
                .unwrap(),
        )
        .unwrap();

        let err = e.compute("slow", &user_ctx("u1")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ComputationTimeout);
        assert_eq!(e.stats().failed_computations, 1);
        // The flight slot was released despite the timeout
        assert_eq!(e.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_failed_computation_not_cached() {
        let e = engine();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        e.register(
            AttributeDefinition::builder("flaky", "Flaky")
                .target(TargetKind::User)
                .compute(move |_| {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(FacetError::validation("first call fails"))
                        } else {
                            Ok(json!("recovered"))
                        }
                    }
                })
                .build()
                .unwrap(),
        )
        .unwrap();

        let ctx = user_ctx("u1");
        let err = e.compute("flaky", &ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ComputationFailed);

        // The failure was not cached; the retry recomputes and succeeds
        assert_eq!(e.compute("flaky", &ctx).await.unwrap(), json!("recovered"));
    }

    #[tokio::test]
    async fn test_compute_many_error_channel() {
        let e = engine();
        e.register(constant("ok", json!(1))).unwrap();
        e.register(
            AttributeDefinition::builder("bad", "Bad")
                .target(TargetKind::User)
                .compute(|_| async { Err(FacetError::validation("nope")) })
                .build()
                .unwrap(),
        )
        .unwrap();

        let outcome = e
            .compute_many(&["ok", "bad", "missing"], &user_ctx("u1"))
            .await;

        assert_eq!(outcome.values.len(), 1);
        assert_eq!(outcome.values["ok"], json!(1));
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(
            outcome.errors["missing"].code(),
            ErrorCode::AttributeNotFound
        );
        assert!(!outcome.is_complete());
    }

    #[tokio::test]
    async fn test_compute_all_for_target_filters_by_kind() {
        let e = engine();
        e.register(constant("user.a", json!(1))).unwrap();
        e.register(constant("user.b", json!(2))).unwrap();
        e.register(
            AttributeDefinition::builder("db.size", "DB size")
                .target(TargetKind::Database)
                .compute(|_| async { Ok(json!(0)) })
                .build()
                .unwrap(),
        )
        .unwrap();

        let ctx = user_ctx("u1");
        let outcome = e
            .compute_all_for_target(TargetKind::User, "u1", &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.values.len(), 2);
        assert!(outcome.is_complete());
    }

    #[tokio::test]
    async fn test_unregister_removes_edges_and_cache() {
        let e = engine();
        e.register(constant("base", json!(1))).unwrap();
        e.register(
            AttributeDefinition::builder("derived", "Derived")
                .target(TargetKind::User)
                .dependency(DependencySpec::attribute("base"))
                .compute(|_| async { Ok(json!(2)) })
                .build()
                .unwrap(),
        )
        .unwrap();

        let ctx = user_ctx("u1");
        e.compute("derived", &ctx).await.unwrap();
        assert_eq!(e.tracker().unwrap().affected("base"), vec!["derived"]);

        e.unregister("derived").unwrap();
        assert!(e.tracker().unwrap().affected("base").is_empty());
        assert!(e
            .cache()
            .unwrap()
            .get_keys(Some("derived*"))
            .is_empty());
    }

    #[tokio::test]
    async fn test_register_rolls_back_on_cycle() {
        let e = engine();
        e.register(
            AttributeDefinition::builder("a", "A")
                .target(TargetKind::User)
                .dependency(DependencySpec::attribute("b"))
                .compute(|_| async { Ok(json!(1)) })
                .build()
                .unwrap(),
        )
        .unwrap();

        let err = e
            .register(
                AttributeDefinition::builder("b", "B")
                    .target(TargetKind::User)
                    .dependency(DependencySpec::attribute("a"))
                    .compute(|_| async { Ok(json!(2)) })
                    .build()
                    .unwrap(),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircularDependency);

        // The failed registration left no definition and no edges behind
        assert!(e.get("b").is_none());
        assert!(e.tracker().unwrap().dependencies_of("b").is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_then_miss() {
        let e = engine();
        e.register(constant("a", json!(1))).unwrap();
        let ctx = user_ctx("u1");

        e.compute("a", &ctx).await.unwrap();
        let removed = e.invalidate("a", None).unwrap();
        assert_eq!(removed, 1);

        // Next compute misses the cache and recomputes
        e.compute("a", &ctx).await.unwrap();
        assert_eq!(e.stats().successful_computations, 2);
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let e = AttributeEngine::new(EngineConfig::default());
        assert_eq!(
            e.health().status,
            crate::health::HealthStatus::Unhealthy
        );

        e.initialise().unwrap();
        assert_eq!(e.health().status, crate::health::HealthStatus::Healthy);

        e.register(
            AttributeDefinition::builder("bad", "Bad")
                .target(TargetKind::User)
                .compute(|_| async { Err(FacetError::validation("always fails")) })
                .build()
                .unwrap(),
        )
        .unwrap();
        let _ = e.compute("bad", &user_ctx("u1")).await;

        // 1 failure / 1 computation = 100% error rate
        assert_eq!(e.health().status, crate::health::HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let e = AttributeEngine::new(EngineConfig::default());
        e.initialise().unwrap();
        assert_eq!(
            e.initialise().unwrap_err().code(),
            ErrorCode::AlreadyInitialised
        );
        e.shutdown().unwrap();
        assert_eq!(e.shutdown().unwrap_err().code(), ErrorCode::NotInitialised);
        assert_eq!(
            e.clear_all().unwrap_err().code(),
            ErrorCode::NotInitialised
        );
    }

    #[tokio::test]
    async fn test_context_fingerprint_partitions_cache() {
        let e = engine();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        e.register(
            AttributeDefinition::builder("param", "Parameterised")
                .target(TargetKind::User)
                .compute(move |ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(ctx.custom("limit").cloned().unwrap_or(json!(null)))
                    }
                })
                .build()
                .unwrap(),
        )
        .unwrap();

        let builder = ContextBuilder::new(ContextConfig::default());
        let database = db();
        let ctx_a = builder
            .for_user(database.clone(), "u1")
            .custom("limit", json!(10))
            .build()
            .unwrap();
        let ctx_b = builder
            .for_user(database.clone(), "u1")
            .custom("limit", json!(20))
            .build()
            .unwrap();

        assert_eq!(e.compute("param", &ctx_a).await.unwrap(), json!(10));
        assert_eq!(e.compute("param", &ctx_b).await.unwrap(), json!(20));
        // Same fingerprint hits the cache
        assert_eq!(e.compute("param", &ctx_a).await.unwrap(), json!(10));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
