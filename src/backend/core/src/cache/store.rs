//! The in-memory attribute value store.
//!
//! Memoises computed values with TTL, caps entry count eagerly and memory on
//! a periodic cleanup cycle, accounts memory usage, and supports multi-axis
//! invalidation. The entries cap is enforced with the configured eviction
//! policy on every insert; the memory cap may briefly overshoot between a
//! `set` and the next cleanup tick.
//!
//! `get`, `has`, and `set` never block on I/O; all state lives in sharded
//! maps and atomics.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::definition::{AttributeValue, TargetKind};
use crate::error::{FacetError, Result};
use crate::events::{CacheEvent, EventBus, RemovalReason};
use crate::health::ComponentHealth;

use super::key::CacheKey;

// ═══════════════════════════════════════════════════════════════════════════════
// Eviction Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// How victims are selected when the cache is over a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used (oldest `last_access_at`, ties by `computed_at`)
    Lru,
    /// Least frequently used (lowest `access_count`, ties by last access)
    Lfu,
    /// Shortest remaining TTL (earliest `expires_at`)
    Ttl,
    /// Arbitrary resident entry
    Random,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::Lru
    }
}

impl EvictionPolicy {
    fn removal_reason(&self) -> RemovalReason {
        match self {
            Self::Lru => RemovalReason::Lru,
            Self::Lfu => RemovalReason::Lfu,
            Self::Ttl => RemovalReason::Ttl,
            Self::Random => RemovalReason::Random,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// A memoised value with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The computed value
    pub value: AttributeValue,

    /// When the value was computed
    pub computed_at: DateTime<Utc>,

    /// When the value expires
    pub expires_at: DateTime<Utc>,

    /// Invalidation tags (declared dependencies + extra triggers)
    pub dependencies: Vec<String>,

    /// Estimated size in bytes
    pub size_bytes: u64,

    /// Number of reads served from this entry
    pub access_count: u64,

    /// When the entry was last read
    pub last_access_at: DateTime<Utc>,

    /// How long the producing computation took, in milliseconds
    pub compute_time_ms: u64,
}

impl CacheEntry {
    /// Check whether the entry has expired at the given instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check whether the entry has expired now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics & Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total sets
    pub sets: u64,
    /// Entries removed by eviction
    pub evictions: u64,
    /// Entries removed by invalidation
    pub invalidations: u64,
    /// Entries removed by expiry
    pub expirations: u64,
    /// Resident entry count
    pub entries: u64,
    /// Accounted memory in bytes
    pub size_bytes: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
    /// size_bytes / max_memory_bytes
    pub memory_pressure: f64,
    /// Rolling mean hit time in microseconds
    pub avg_hit_time_us: f64,
    /// Rolling mean miss time in microseconds
    pub avg_miss_time_us: f64,
    /// Rolling mean invalidation time in microseconds
    pub avg_invalidation_time_us: f64,
    /// Removals grouped by reason
    pub removed_by_reason: HashMap<String, u64>,
}

/// What a cleanup cycle removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Entries removed because their TTL elapsed
    pub expired: u64,
    /// Entries evicted to get back under the memory cap
    pub evicted: u64,
}

/// Outcome of the most recent cache operation, for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOperationResult {
    /// Operation name (`get`, `set`, `delete`, `invalidate`, ...)
    pub operation: String,
    /// Canonical key, when the operation targets one
    pub key: Option<String>,
    /// Whether the operation succeeded / hit
    pub success: bool,
    /// Entries affected
    pub affected: u64,
    /// When the operation finished
    pub timestamp: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Attribute Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Keyed store for computed attribute values.
pub struct AttributeCache {
    config: RwLock<CacheConfig>,
    entries: DashMap<String, CacheEntry>,
    events: EventBus<CacheEvent>,

    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
    size_bytes: AtomicU64,

    hit_time_us: AtomicU64,
    miss_time_us: AtomicU64,
    invalidation_time_us: AtomicU64,
    invalidation_ops: AtomicU64,

    removed_by_reason: Mutex<HashMap<RemovalReason, u64>>,
    last_operation: Mutex<Option<CacheOperationResult>>,
    cleanup: Mutex<Option<CleanupTask>>,
}

struct CleanupTask {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl AttributeCache {
    /// Create a cache with the given configuration. The cleanup cycle is
    /// started separately via [`AttributeCache::start_cleanup`].
    pub fn new(config: CacheConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config: RwLock::new(config),
            entries: DashMap::new(),
            events,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            size_bytes: AtomicU64::new(0),
            hit_time_us: AtomicU64::new(0),
            miss_time_us: AtomicU64::new(0),
            invalidation_time_us: AtomicU64::new(0),
            invalidation_ops: AtomicU64::new(0),
            removed_by_reason: Mutex::new(HashMap::new()),
            last_operation: Mutex::new(None),
            cleanup: Mutex::new(None),
        }
    }

    /// Subscribe to cache events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Read Path
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a live value. Expired entries are removed on contact and reported
    /// as misses. Hits update the access count and recency.
    pub fn get(&self, key: &CacheKey) -> Option<AttributeValue> {
        let start = Instant::now();
        let canonical = key.canonical();
        let now = Utc::now();

        let result = match self.entries.get_mut(&canonical) {
            Some(mut entry) if !entry.is_expired_at(now) => {
                entry.access_count += 1;
                entry.last_access_at = now;
                Some(entry.value.clone())
            }
            Some(entry) => {
                drop(entry);
                self.remove_entry(&canonical, RemovalReason::Expired);
                None
            }
            None => None,
        };

        let elapsed_us = start.elapsed().as_micros() as u64;
        match &result {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.hit_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
                counter!("facet_cache_hits_total").increment(1);
                self.events.emit(CacheEvent::Hit {
                    key: canonical.clone(),
                });
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.miss_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
                counter!("facet_cache_misses_total").increment(1);
                self.events.emit(CacheEvent::Miss {
                    key: canonical.clone(),
                });
            }
        }

        self.record_operation("get", Some(canonical), result.is_some(), 1);
        result
    }

    /// Check for a live entry without counting a hit or touching recency.
    pub fn has(&self, key: &CacheKey) -> bool {
        self.entries
            .get(&key.canonical())
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    /// Return entry metadata without touching LRU state.
    pub fn inspect(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(&key.canonical()).map(|e| e.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Write Path
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a value. A zero TTL (explicit or from the default) means the
    /// value is never cached. When the entry cap is reached, victims are
    /// evicted with the configured policy until a slot is free.
    pub fn set(
        &self,
        key: &CacheKey,
        value: AttributeValue,
        ttl: Option<Duration>,
        dependencies: Vec<String>,
        compute_time: Duration,
    ) -> Result<()> {
        let (max_entries, max_memory, default_ttl, policy) = {
            let config = self.config.read();
            (
                config.max_entries,
                config.max_memory_bytes,
                config.default_ttl,
                config.eviction_policy,
            )
        };

        let ttl = ttl.unwrap_or(default_ttl);
        if ttl.is_zero() {
            debug!(key = %key, "Zero TTL, value not cached");
            return Ok(());
        }

        let canonical = key.canonical();
        let size = estimate_size(&canonical, &value, &dependencies);
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| FacetError::cache("TTL out of range").with_source(e))?;

        // Free a slot if needed; replacing an existing key does not need one
        if !self.entries.contains_key(&canonical) {
            while self.entries.len() >= max_entries {
                if self.evict_one(policy).is_none() {
                    break;
                }
            }
        }

        let entry = CacheEntry {
            value,
            computed_at: now,
            expires_at,
            dependencies,
            size_bytes: size,
            access_count: 0,
            last_access_at: now,
            compute_time_ms: compute_time.as_millis() as u64,
        };

        if let Some(previous) = self.entries.insert(canonical.clone(), entry) {
            self.size_bytes
                .fetch_sub(previous.size_bytes, Ordering::Relaxed);
        }
        let used = self.size_bytes.fetch_add(size, Ordering::Relaxed) + size;

        self.sets.fetch_add(1, Ordering::Relaxed);
        counter!("facet_cache_sets_total").increment(1);
        histogram!("facet_cache_entry_size_bytes").record(size as f64);
        self.events.emit(CacheEvent::Set {
            key: canonical.clone(),
            size_bytes: size,
        });

        if max_memory > 0 && used >= max_memory * 8 / 10 {
            warn!(used_bytes = used, max_bytes = max_memory, "Cache memory usage above 80%");
            self.events.emit(CacheEvent::MemoryWarning {
                used_bytes: used,
                max_bytes: max_memory,
            });
        }

        self.record_operation("set", Some(canonical), true, 1);
        Ok(())
    }

    /// Delete a single entry.
    pub fn delete(&self, key: &CacheKey) -> bool {
        let canonical = key.canonical();
        let removed = self.remove_entry(&canonical, RemovalReason::Explicit);
        self.record_operation("delete", Some(canonical), removed, u64::from(removed));
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) -> u64 {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for key in keys {
            if self.remove_entry(&key, RemovalReason::Explicit) {
                removed += 1;
            }
        }
        self.record_operation("clear", None, true, removed);
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invalidation Axes
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove entries for an attribute, optionally narrowed to one target.
    pub fn invalidate_by_attribute(&self, attribute_id: &str, target_id: Option<&str>) -> u64 {
        self.invalidate_matching("invalidate_by_attribute", |key, _| {
            let Some(parsed) = CacheKey::parse(key) else {
                return false;
            };
            parsed.attribute_id == attribute_id
                && target_id.map_or(true, |t| parsed.target_id == t)
        })
    }

    /// Remove every entry whose dependency tags contain the given tag.
    pub fn invalidate_by_dependency(&self, tag: &str) -> u64 {
        self.invalidate_matching("invalidate_by_dependency", |_, entry| {
            entry.dependencies.iter().any(|d| d == tag)
        })
    }

    /// Remove entries for a specific target.
    pub fn invalidate_by_target(&self, target_kind: TargetKind, target_id: &str) -> u64 {
        self.invalidate_matching("invalidate_by_target", |key, _| {
            let Some(parsed) = CacheKey::parse(key) else {
                return false;
            };
            parsed.target_kind == target_kind && parsed.target_id == target_id
        })
    }

    /// Remove entries linked to a collection: entries tagged
    /// `collection:<name>`, plus — as a best-effort fallback for attributes
    /// that declared no collection dependency — entries whose canonical key
    /// contains the collection name.
    pub fn invalidate_by_collection(&self, collection: &str) -> u64 {
        let tag = format!("collection:{}", collection);
        self.invalidate_matching("invalidate_by_collection", |key, entry| {
            entry.dependencies.iter().any(|d| d == &tag) || key.contains(collection)
        })
    }

    fn invalidate_matching(
        &self,
        operation: &str,
        predicate: impl Fn(&str, &CacheEntry) -> bool,
    ) -> u64 {
        let start = Instant::now();
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|e| predicate(e.key(), e.value()))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in victims {
            if self.remove_entry(&key, RemovalReason::Invalidated) {
                removed += 1;
            }
        }

        self.invalidation_time_us
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.invalidation_ops.fetch_add(1, Ordering::Relaxed);
        counter!("facet_cache_invalidated_total").increment(removed);
        self.record_operation(operation, None, true, removed);
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// One maintenance pass: sweep expired entries, then evict with the
    /// configured policy until back under the memory cap.
    pub fn cleanup(&self) -> CleanupReport {
        let (max_memory, policy) = {
            let config = self.config.read();
            (config.max_memory_bytes, config.eviction_policy)
        };

        let now = Utc::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired_at(now))
            .map(|e| e.key().clone())
            .collect();

        let mut report = CleanupReport::default();
        for key in expired {
            if self.remove_entry(&key, RemovalReason::Expired) {
                report.expired += 1;
            }
        }

        while max_memory > 0 && self.size_bytes.load(Ordering::Relaxed) > max_memory {
            match self.evict_one(policy) {
                Some(_) => report.evicted += 1,
                None => break,
            }
        }

        if report.expired > 0 || report.evicted > 0 {
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                "Cache cleanup cycle"
            );
        }
        report
    }

    /// Run a cleanup pass immediately.
    pub fn compact(&self) -> CleanupReport {
        self.cleanup()
    }

    /// Best-effort bulk preload of already-computed values, stored with the
    /// default TTL. Returns how many entries were admitted.
    pub fn warmup(&self, entries: Vec<(CacheKey, AttributeValue)>) -> usize {
        let mut warmed = 0;
        for (key, value) in entries {
            if self
                .set(&key, value, None, Vec::new(), Duration::ZERO)
                .is_ok()
            {
                warmed += 1;
            }
        }
        debug!(warmed, "Cache warmup completed");
        warmed
    }

    /// Start the periodic cleanup task.
    pub fn start_cleanup(self: &Arc<Self>) {
        let mut slot = self.cleanup.lock();
        if slot.is_some() {
            return;
        }
        let interval = self.config.read().cleanup_interval;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let cache = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.cleanup();
                    }
                }
            }
        });

        *slot = Some(CleanupTask { token, handle });
    }

    /// Stop the periodic cleanup task.
    pub fn stop_cleanup(&self) {
        if let Some(task) = self.cleanup.lock().take() {
            task.token.cancel();
            task.handle.abort();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection & Configuration
    // ─────────────────────────────────────────────────────────────────────────

    /// List canonical keys, optionally filtered by a glob pattern
    /// (`*` and `?` wildcards).
    pub fn get_keys(&self, pattern: Option<&str>) -> Vec<String> {
        match pattern {
            None => self.entries.iter().map(|e| e.key().clone()).collect(),
            Some(glob) => match regex::Regex::new(&glob_to_regex(glob)) {
                Ok(re) => self
                    .entries
                    .iter()
                    .filter(|e| re.is_match(e.key()))
                    .map(|e| e.key().clone())
                    .collect(),
                Err(_) => Vec::new(),
            },
        }
    }

    /// Number of resident entries (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the configuration. Only LRU-family knobs take effect
    /// immediately; the cleanup interval applies from the next restart of
    /// the cleanup task.
    pub fn configure(&self, config: CacheConfig) {
        *self.config.write() = config;
    }

    /// Current configuration.
    pub fn get_config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    /// Outcome of the most recent operation.
    pub fn get_last_operation_result(&self) -> Option<CacheOperationResult> {
        self.last_operation.lock().clone()
    }

    /// Cache statistics.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let size_bytes = self.size_bytes.load(Ordering::Relaxed);
        let max_memory = self.config.read().max_memory_bytes;
        let invalidation_ops = self.invalidation_ops.load(Ordering::Relaxed);

        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.entries.len() as u64,
            size_bytes,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            memory_pressure: if max_memory > 0 {
                size_bytes as f64 / max_memory as f64
            } else {
                0.0
            },
            avg_hit_time_us: mean(self.hit_time_us.load(Ordering::Relaxed), hits),
            avg_miss_time_us: mean(self.miss_time_us.load(Ordering::Relaxed), misses),
            avg_invalidation_time_us: mean(
                self.invalidation_time_us.load(Ordering::Relaxed),
                invalidation_ops,
            ),
            removed_by_reason: self
                .removed_by_reason
                .lock()
                .iter()
                .map(|(reason, count)| (reason.as_str().to_string(), *count))
                .collect(),
        }
    }

    /// Health snapshot: degraded under memory pressure or with a poor hit
    /// rate (once enough reads have been observed).
    pub fn health(&self) -> ComponentHealth {
        let stats = self.stats();
        let enough_samples = stats.hits + stats.misses >= 100;

        let health = if stats.memory_pressure > 0.8 {
            ComponentHealth::degraded("cache").with_message("memory pressure above 0.8")
        } else if enough_samples && stats.hit_rate < 0.5 {
            ComponentHealth::degraded("cache").with_message("hit rate below 0.5")
        } else {
            ComponentHealth::healthy("cache")
        };

        health
            .with_detail("entries", stats.entries)
            .with_detail("size_bytes", stats.size_bytes)
            .with_detail("hit_rate", stats.hit_rate)
            .with_detail("memory_pressure", stats.memory_pressure)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshot Support
    // ─────────────────────────────────────────────────────────────────────────

    /// All resident entries, for snapshot export.
    pub(crate) fn entries_snapshot(&self) -> Vec<(String, CacheEntry)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Restore an entry verbatim (metadata preserved), recomputing its size.
    pub(crate) fn restore_entry(&self, canonical: String, mut entry: CacheEntry) {
        entry.size_bytes = estimate_size(&canonical, &entry.value, &entry.dependencies);
        if let Some(previous) = self.entries.insert(canonical, entry.clone()) {
            self.size_bytes
                .fetch_sub(previous.size_bytes, Ordering::Relaxed);
        }
        self.size_bytes
            .fetch_add(entry.size_bytes, Ordering::Relaxed);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    /// Select and remove one victim with the given policy.
    fn evict_one(&self, policy: EvictionPolicy) -> Option<String> {
        let victim = match policy {
            EvictionPolicy::Lru => self
                .entries
                .iter()
                .min_by_key(|e| (e.value().last_access_at, e.value().computed_at))
                .map(|e| e.key().clone()),
            EvictionPolicy::Lfu => self
                .entries
                .iter()
                .min_by_key(|e| (e.value().access_count, e.value().last_access_at))
                .map(|e| e.key().clone()),
            EvictionPolicy::Ttl => self
                .entries
                .iter()
                .min_by_key(|e| e.value().expires_at)
                .map(|e| e.key().clone()),
            EvictionPolicy::Random => self.entries.iter().next().map(|e| e.key().clone()),
        }?;

        if self.remove_entry(&victim, policy.removal_reason()) {
            Some(victim)
        } else {
            None
        }
    }

    /// Remove an entry, updating accounting and emitting the matching event.
    fn remove_entry(&self, canonical: &str, reason: RemovalReason) -> bool {
        let Some((key, entry)) = self.entries.remove(canonical) else {
            return false;
        };
        self.size_bytes
            .fetch_sub(entry.size_bytes, Ordering::Relaxed);
        *self.removed_by_reason.lock().entry(reason).or_insert(0) += 1;

        match reason {
            RemovalReason::Expired => {
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.events.emit(CacheEvent::Evicted { key, reason });
            }
            RemovalReason::Invalidated => {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
                self.events.emit(CacheEvent::Invalidated { key });
            }
            RemovalReason::Explicit => {
                self.events.emit(CacheEvent::Evicted { key, reason });
            }
            _ => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                counter!("facet_cache_evictions_total", "reason" => reason.as_str()).increment(1);
                self.events.emit(CacheEvent::Evicted { key, reason });
            }
        }
        true
    }

    fn record_operation(&self, operation: &str, key: Option<String>, success: bool, affected: u64) {
        *self.last_operation.lock() = Some(CacheOperationResult {
            operation: operation.to_string(),
            key,
            success,
            affected,
            timestamp: Utc::now(),
        });
    }
}

impl Drop for AttributeCache {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup.get_mut().take() {
            task.token.cancel();
            task.handle.abort();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Estimate the in-memory footprint of an entry: serialized value plus key
/// and tag text plus a fixed metadata overhead.
fn estimate_size(canonical: &str, value: &AttributeValue, dependencies: &[String]) -> u64 {
    let value_size = serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0);
    let tag_size: usize = dependencies.iter().map(|d| d.len()).sum();
    (value_size + canonical.len() + tag_size + 96) as u64
}

fn mean(total: u64, count: u64) -> f64 {
    if count > 0 {
        total as f64 / count as f64
    } else {
        0.0
    }
}

/// Convert a glob pattern to a regex pattern.
pub(crate) fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::with_capacity(glob.len() * 2);
    regex.push('^');

    for c in glob.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            _ => regex.push(c),
        }
    }

    regex.push('$');
    regex
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TargetKind;
    use serde_json::json;

    fn cache() -> AttributeCache {
        AttributeCache::new(CacheConfig::default())
    }

    fn key(attr: &str, target: &str) -> CacheKey {
        CacheKey::new(attr, TargetKind::User, target)
    }

    fn put(cache: &AttributeCache, k: &CacheKey, value: AttributeValue) {
        cache
            .set(k, value, None, Vec::new(), Duration::from_millis(1))
            .unwrap();
    }

    #[test]
    fn test_set_get_roundtrip() {
        let c = cache();
        let k = key("a", "u1");
        put(&c, &k, json!({"v": 1}));

        assert!(c.has(&k));
        assert_eq!(c.get(&k).unwrap()["v"], 1);
        assert_eq!(c.stats().hits, 1);
    }

    #[test]
    fn test_miss_on_absent_key() {
        let c = cache();
        assert!(c.get(&key("a", "u1")).is_none());
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn test_zero_ttl_never_cached() {
        let c = cache();
        let k = key("a", "u1");
        c.set(&k, json!(1), Some(Duration::ZERO), Vec::new(), Duration::ZERO)
            .unwrap();
        assert!(!c.has(&k));
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_expired_entry_removed_on_read() {
        let c = cache();
        let k = key("a", "u1");
        c.set(
            &k,
            json!(1),
            Some(Duration::from_nanos(1)),
            Vec::new(),
            Duration::ZERO,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert!(c.get(&k).is_none());
        assert_eq!(c.len(), 0);
        assert_eq!(c.stats().expirations, 1);
    }

    #[test]
    fn test_entry_cap_evicts_lru_victim() {
        let c = AttributeCache::new(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });

        put(&c, &key("a", "k1"), json!(1));
        std::thread::sleep(Duration::from_millis(2));
        put(&c, &key("a", "k2"), json!(2));
        std::thread::sleep(Duration::from_millis(2));

        // Touch k1 so k2 becomes the LRU victim
        assert!(c.get(&key("a", "k1")).is_some());
        std::thread::sleep(Duration::from_millis(2));
        put(&c, &key("a", "k3"), json!(3));

        assert!(c.has(&key("a", "k1")));
        assert!(!c.has(&key("a", "k2")));
        assert!(c.has(&key("a", "k3")));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_max_entries_one_keeps_last() {
        let c = AttributeCache::new(CacheConfig {
            max_entries: 1,
            ..Default::default()
        });

        for target in ["k1", "k2", "k3"] {
            put(&c, &key("a", target), json!(target));
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(c.len(), 1);
        assert!(c.has(&key("a", "k3")));
    }

    #[test]
    fn test_lfu_eviction() {
        let c = AttributeCache::new(CacheConfig {
            max_entries: 2,
            eviction_policy: EvictionPolicy::Lfu,
            ..Default::default()
        });

        put(&c, &key("a", "cold"), json!(1));
        put(&c, &key("a", "hot"), json!(2));
        for _ in 0..5 {
            c.get(&key("a", "hot"));
        }

        put(&c, &key("a", "new"), json!(3));
        assert!(!c.has(&key("a", "cold")));
        assert!(c.has(&key("a", "hot")));
    }

    #[test]
    fn test_invalidate_by_attribute() {
        let c = cache();
        put(&c, &key("a", "u1"), json!(1));
        put(&c, &key("a", "u2"), json!(2));
        put(&c, &key("b", "u1"), json!(3));

        assert_eq!(c.invalidate_by_attribute("a", None), 2);
        assert!(c.has(&key("b", "u1")));

        // Idempotent: a second call removes nothing further
        assert_eq!(c.invalidate_by_attribute("a", None), 0);
    }

    #[test]
    fn test_invalidate_by_attribute_with_target() {
        let c = cache();
        put(&c, &key("a", "u1"), json!(1));
        put(&c, &key("a", "u2"), json!(2));

        assert_eq!(c.invalidate_by_attribute("a", Some("u1")), 1);
        assert!(c.has(&key("a", "u2")));
    }

    #[test]
    fn test_invalidate_by_dependency_tag() {
        let c = cache();
        c.set(
            &key("a", "u1"),
            json!(1),
            None,
            vec!["field:age".to_string()],
            Duration::ZERO,
        )
        .unwrap();
        c.set(&key("b", "u1"), json!(2), None, Vec::new(), Duration::ZERO)
            .unwrap();

        assert_eq!(c.invalidate_by_dependency("field:age"), 1);
        assert!(!c.has(&key("a", "u1")));
        assert!(c.has(&key("b", "u1")));
    }

    #[test]
    fn test_invalidate_by_target() {
        let c = cache();
        put(&c, &key("a", "u1"), json!(1));
        put(&c, &key("b", "u1"), json!(2));
        put(&c, &key("b", "u2"), json!(3));

        assert_eq!(c.invalidate_by_target(TargetKind::User, "u1"), 2);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_invalidate_by_collection_tag_and_fallback() {
        let c = cache();
        // Tagged entry, key does not mention the collection
        c.set(
            &key("a", "u1"),
            json!(1),
            None,
            vec!["collection:orders".to_string()],
            Duration::ZERO,
        )
        .unwrap();
        // Untagged entry whose key mentions the collection
        c.set(
            &CacheKey::new("orders.total", TargetKind::Collection, "orders"),
            json!(2),
            None,
            Vec::new(),
            Duration::ZERO,
        )
        .unwrap();
        // Unrelated entry
        put(&c, &key("b", "u9"), json!(3));

        assert_eq!(c.invalidate_by_collection("orders"), 2);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_cleanup_sweeps_expired() {
        let c = cache();
        c.set(
            &key("a", "u1"),
            json!(1),
            Some(Duration::from_nanos(1)),
            Vec::new(),
            Duration::ZERO,
        )
        .unwrap();
        put(&c, &key("a", "u2"), json!(2));

        std::thread::sleep(Duration::from_millis(5));
        let report = c.cleanup();
        assert_eq!(report.expired, 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_memory_cap_enforced_on_cleanup() {
        let c = AttributeCache::new(CacheConfig {
            max_memory_bytes: 600,
            ..Default::default()
        });
        for i in 0..6 {
            put(&c, &key("a", &format!("k{}", i)), json!("x".repeat(64)));
        }
        assert!(c.stats().size_bytes > 600);

        let report = c.cleanup();
        assert!(report.evicted > 0);
        assert!(c.stats().size_bytes <= 600);
    }

    #[test]
    fn test_get_keys_glob() {
        let c = cache();
        put(&c, &key("user.score", "u1"), json!(1));
        put(&c, &key("user.rank", "u1"), json!(2));
        put(&c, &key("doc.words", "u1"), json!(3));

        assert_eq!(c.get_keys(None).len(), 3);
        assert_eq!(c.get_keys(Some("user.*")).len(), 2);
        assert_eq!(c.get_keys(Some("*:u1")).len(), 3);
        assert!(c.get_keys(Some("nothing*")).is_empty());
    }

    #[test]
    fn test_inspect_does_not_touch_recency() {
        let c = cache();
        let k = key("a", "u1");
        put(&c, &k, json!(1));

        let before = c.inspect(&k).unwrap();
        let again = c.inspect(&k).unwrap();
        assert_eq!(before.access_count, 0);
        assert_eq!(again.access_count, 0);

        c.get(&k);
        assert_eq!(c.inspect(&k).unwrap().access_count, 1);
    }

    #[test]
    fn test_stats_and_last_operation() {
        let c = cache();
        let k = key("a", "u1");
        put(&c, &k, json!(1));
        c.get(&k);
        c.get(&key("a", "u2"));

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);

        let last = c.get_last_operation_result().unwrap();
        assert_eq!(last.operation, "get");
        assert!(!last.success);
    }

    #[test]
    fn test_health_degrades_under_memory_pressure() {
        let c = AttributeCache::new(CacheConfig {
            max_memory_bytes: 300,
            ..Default::default()
        });
        put(&c, &key("a", "u1"), json!("x".repeat(200)));

        let health = c.health();
        assert_eq!(health.status, crate::health::HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_events_on_set_and_invalidate() {
        let c = cache();
        let mut rx = c.subscribe();
        let k = key("a", "u1");

        put(&c, &k, json!(1));
        c.invalidate_by_attribute("a", None);

        assert!(matches!(rx.recv().await.unwrap(), CacheEvent::Set { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            CacheEvent::Invalidated { .. }
        ));
    }

    #[tokio::test]
    async fn test_cleanup_task_lifecycle() {
        let c = Arc::new(AttributeCache::new(CacheConfig {
            cleanup_interval: Duration::from_millis(10),
            ..Default::default()
        }));
        c.start_cleanup();
        c.set(
            &key("a", "u1"),
            json!(1),
            Some(Duration::from_millis(1)),
            Vec::new(),
            Duration::ZERO,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c.len(), 0);
        c.stop_cleanup();
    }

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("a:*"), "^a:.*$");
        assert_eq!(glob_to_regex("a?c"), "^a.c$");
        assert_eq!(glob_to_regex("a.b"), "^a\\.b$");
    }
}
