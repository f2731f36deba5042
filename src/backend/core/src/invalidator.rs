//! Centralised cache invalidation.
//!
//! The invalidator executes invalidation requests across five axes
//! (attribute, dependency, target, collection, database), batches queued
//! requests by size or age, fans cascades out through the dependency graph,
//! and ingests the host database's change feed. It holds references only —
//! values live in the cache, edges in the tracker.

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::AttributeCache;
use crate::config::InvalidatorConfig;
use crate::db::{ChangeEvent, ChangeKind, Database};
use crate::definition::TargetKind;
use crate::error::{ErrorCode, FacetError, Result};
use crate::events::{EventBus, InvalidatorEvent};
use crate::tracker::DependencyTracker;

// ═══════════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════════

/// The dimension along which a request selects entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationAxis {
    Attribute,
    Dependency,
    Target,
    Collection,
    Database,
}

impl InvalidationAxis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attribute => "attribute",
            Self::Dependency => "dependency",
            Self::Target => "target",
            Self::Collection => "collection",
            Self::Database => "database",
        }
    }
}

/// Request priority. Batches execute higher priorities first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl InvalidationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A unit of invalidation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationRequest {
    /// Request identity
    pub id: Uuid,

    /// Selection axis
    pub axis: InvalidationAxis,

    /// Attribute selector (attribute axis, cascade derivations)
    pub attribute_id: Option<String>,

    /// Target selector
    pub target_id: Option<String>,
    pub target_kind: Option<TargetKind>,

    /// Dependency tag selector (dependency axis)
    pub dependency: Option<String>,

    /// Collection selector (collection axis)
    pub collection_name: Option<String>,

    /// Why the request was raised
    pub reason: Option<String>,

    /// Priority within a batch
    pub priority: InvalidationPriority,

    /// Whether the request fans out through the dependency graph
    pub cascading: bool,

    /// When the request was created
    pub enqueued_at: DateTime<Utc>,
}

impl InvalidationRequest {
    fn base(axis: InvalidationAxis) -> Self {
        Self {
            id: Uuid::new_v4(),
            axis,
            attribute_id: None,
            target_id: None,
            target_kind: None,
            dependency: None,
            collection_name: None,
            reason: None,
            priority: InvalidationPriority::Medium,
            cascading: true,
            enqueued_at: Utc::now(),
        }
    }

    /// Invalidate an attribute across all targets.
    pub fn attribute(attribute_id: impl Into<String>) -> Self {
        Self {
            attribute_id: Some(attribute_id.into()),
            ..Self::base(InvalidationAxis::Attribute)
        }
    }

    /// Invalidate an attribute for one target.
    pub fn attribute_target(
        attribute_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            attribute_id: Some(attribute_id.into()),
            target_id: Some(target_id.into()),
            ..Self::base(InvalidationAxis::Attribute)
        }
    }

    /// Invalidate everything that depends on a tag.
    pub fn dependency(tag: impl Into<String>) -> Self {
        Self {
            dependency: Some(tag.into()),
            ..Self::base(InvalidationAxis::Dependency)
        }
    }

    /// Invalidate everything computed for a target.
    pub fn target(target_kind: TargetKind, target_id: impl Into<String>) -> Self {
        Self {
            target_kind: Some(target_kind),
            target_id: Some(target_id.into()),
            ..Self::base(InvalidationAxis::Target)
        }
    }

    /// Invalidate everything linked to a collection.
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection_name: Some(name.into()),
            ..Self::base(InvalidationAxis::Collection)
        }
    }

    /// Drop the whole cache.
    pub fn database() -> Self {
        Self::base(InvalidationAxis::Database)
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: InvalidationPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Record the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Disable cascading for this request.
    pub fn no_cascade(mut self) -> Self {
        self.cascading = false;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outcomes, Metrics, Log
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a single request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvalidationOutcome {
    /// Whether the request executed without error
    pub success: bool,
    /// Entries removed by the primary axis
    pub invalidated_count: u64,
    /// Attributes reached by the cascade
    pub affected_attributes: Vec<String>,
    /// Entries removed by cascade steps
    pub cascading_invalidations: u64,
    /// Wall time spent executing
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
}

/// Invalidator counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvalidatorMetrics {
    pub total_invalidations: u64,
    pub successful_invalidations: u64,
    pub failed_invalidations: u64,
    pub batches_processed: u64,
    pub cascading_invalidations: u64,
    pub database_triggered: u64,
    pub dependency_triggered: u64,
    pub by_axis: HashMap<String, u64>,
    pub by_priority: HashMap<String, u64>,
    /// Rolling mean execution time in microseconds
    pub avg_execution_time_us: f64,
    pub last_invalidation_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MetricsInner {
    metrics: InvalidatorMetrics,
    total_execution_us: u64,
}

/// One entry of the bounded in-memory outcome log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationRecord {
    pub request: InvalidationRequest,
    pub outcome: InvalidationOutcome,
    pub recorded_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidator
// ═══════════════════════════════════════════════════════════════════════════════

/// Queued, batched invalidation pipeline.
pub struct Invalidator {
    config: RwLock<InvalidatorConfig>,
    cache: Arc<AttributeCache>,
    tracker: Option<Arc<DependencyTracker>>,
    events: EventBus<InvalidatorEvent>,

    queue: Mutex<Vec<InvalidationRequest>>,
    /// Incremented on every batch drain; pending timers check it so a batch
    /// flushes at most once even when the size trigger and the timer race.
    batch_epoch: AtomicU64,

    metrics: SyncMutex<MetricsInner>,
    recent: SyncMutex<VecDeque<InvalidationRecord>>,

    initialised: AtomicBool,
    token: SyncMutex<Option<CancellationToken>>,
    tasks: SyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Invalidator {
    /// Create an invalidator over the given cache.
    pub fn new(cache: Arc<AttributeCache>, config: InvalidatorConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config: RwLock::new(config),
            cache,
            tracker: None,
            events,
            queue: Mutex::new(Vec::new()),
            batch_epoch: AtomicU64::new(0),
            metrics: SyncMutex::new(MetricsInner::default()),
            recent: SyncMutex::new(VecDeque::new()),
            initialised: AtomicBool::new(false),
            token: SyncMutex::new(None),
            tasks: SyncMutex::new(Vec::new()),
        }
    }

    /// Attach a dependency tracker for cascade fan-out.
    pub fn with_tracker(mut self, tracker: Arc<DependencyTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Subscribe to invalidator events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<InvalidatorEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Initialise. Fails on double initialisation.
    pub fn initialise(&self) -> Result<()> {
        if self.initialised.swap(true, Ordering::SeqCst) {
            return Err(FacetError::already_initialised("invalidator"));
        }
        *self.token.lock() = Some(CancellationToken::new());
        info!("Invalidator initialised");
        Ok(())
    }

    /// Subscribe to the database change feed. Document changes queue target
    /// invalidations; collection lifecycle changes queue high-priority
    /// collection invalidations.
    pub fn attach_database(self: &Arc<Self>, database: Arc<dyn Database>) -> Result<()> {
        self.ensure_initialised()?;
        let token = self
            .token
            .lock()
            .clone()
            .ok_or_else(|| FacetError::not_initialised("invalidator"))?;

        let invalidator = Arc::clone(self);
        let mut feed = database.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = feed.recv() => match event {
                        Ok(change) => invalidator.ingest_change(change).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Change feed lagged, events dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    /// Shut down: release subscriptions, drain the pending queue, and stop.
    /// Errors during the drain are logged but do not prevent completion.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.initialised.swap(false, Ordering::SeqCst) {
            return Err(FacetError::not_initialised("invalidator"));
        }
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }

        let pending = {
            let mut queue = self.queue.lock().await;
            self.batch_epoch.fetch_add(1, Ordering::SeqCst);
            std::mem::take(&mut *queue)
        };
        if !pending.is_empty() {
            info!(pending = pending.len(), "Draining invalidation queue on shutdown");
            self.process_batch(pending).await;
        }

        info!("Invalidator shut down");
        Ok(())
    }

    fn ensure_initialised(&self) -> Result<()> {
        if self.initialised.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FacetError::not_initialised("invalidator"))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Immediate Invocation
    // ─────────────────────────────────────────────────────────────────────────

    /// Invalidate an attribute (optionally for one target), cascading to its
    /// dependents.
    pub async fn invalidate_by_attribute(
        &self,
        attribute_id: &str,
        target_id: Option<&str>,
    ) -> Result<InvalidationOutcome> {
        self.ensure_initialised()?;
        let mut request = InvalidationRequest::attribute(attribute_id);
        request.target_id = target_id.map(|t| t.to_string());
        self.execute(request).await
    }

    /// Invalidate everything that depends on a tag.
    pub async fn invalidate_by_dependency(&self, tag: &str) -> Result<InvalidationOutcome> {
        self.ensure_initialised()?;
        self.execute(InvalidationRequest::dependency(tag)).await
    }

    /// Invalidate everything computed for a target.
    pub async fn invalidate_by_target(
        &self,
        target_kind: TargetKind,
        target_id: &str,
    ) -> Result<InvalidationOutcome> {
        self.ensure_initialised()?;
        self.execute(InvalidationRequest::target(target_kind, target_id))
            .await
    }

    /// Invalidate everything linked to a collection.
    ///
    /// Selection prefers explicit `collection:<name>` dependency tags; for
    /// entries without tags it falls back to a substring match over the
    /// canonical key, which is best-effort.
    pub async fn invalidate_by_collection(&self, collection: &str) -> Result<InvalidationOutcome> {
        self.ensure_initialised()?;
        self.execute(
            InvalidationRequest::collection(collection)
                .with_priority(InvalidationPriority::High),
        )
        .await
    }

    /// Execute a batch of requests immediately, highest priority first.
    pub async fn batch_invalidate(
        &self,
        requests: Vec<InvalidationRequest>,
    ) -> Result<Vec<InvalidationOutcome>> {
        self.ensure_initialised()?;
        Ok(self.process_batch(requests).await)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queued Invocation
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue a request. With batching enabled the queue flushes when it
    /// reaches `batch_size` or when the oldest request is `batch_timeout`
    /// old, whichever comes first; with batching disabled the request runs
    /// immediately.
    pub async fn queue(self: &Arc<Self>, request: InvalidationRequest) -> Result<()> {
        self.ensure_initialised()?;
        let (batching, batch_size, batch_timeout) = {
            let config = self.config.read();
            (
                config.batching_enabled,
                config.batch_size,
                config.batch_timeout,
            )
        };

        if !batching {
            let _ = self.execute(request).await;
            return Ok(());
        }

        let flush_now = {
            let mut queue = self.queue.lock().await;
            queue.push(request);

            if queue.len() >= batch_size {
                self.batch_epoch.fetch_add(1, Ordering::SeqCst);
                Some(std::mem::take(&mut *queue))
            } else {
                if queue.len() == 1 {
                    self.spawn_batch_timer(batch_timeout);
                }
                None
            }
        };

        if let Some(batch) = flush_now {
            self.process_batch(batch).await;
        }
        Ok(())
    }

    /// Number of requests waiting in the queue.
    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    fn spawn_batch_timer(self: &Arc<Self>, batch_timeout: Duration) {
        let Some(token) = self.token.lock().clone() else {
            return;
        };
        let epoch = self.batch_epoch.load(Ordering::SeqCst);
        // Timers must not keep the invalidator alive past shutdown
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(batch_timeout) => {}
            }
            if let Some(invalidator) = weak.upgrade() {
                invalidator.flush_if_epoch(epoch).await;
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn flush_if_epoch(&self, epoch: u64) {
        let batch = {
            let mut queue = self.queue.lock().await;
            if self.batch_epoch.load(Ordering::SeqCst) != epoch || queue.is_empty() {
                return;
            }
            self.batch_epoch.fetch_add(1, Ordering::SeqCst);
            std::mem::take(&mut *queue)
        };
        self.process_batch(batch).await;
    }

    async fn process_batch(&self, mut requests: Vec<InvalidationRequest>) -> Vec<InvalidationOutcome> {
        requests.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
        });

        let request_count = requests.len();
        let mut outcomes = Vec::with_capacity(request_count);
        let mut invalidated = 0;
        for request in requests {
            if let Ok(outcome) = self.execute(request).await {
                invalidated += outcome.invalidated_count + outcome.cascading_invalidations;
                outcomes.push(outcome);
            }
        }

        self.metrics.lock().metrics.batches_processed += 1;
        debug!(request_count, invalidated, "Invalidation batch processed");
        self.events.emit(InvalidatorEvent::BatchInvalidated {
            request_count,
            invalidated_count: invalidated,
        });
        outcomes
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Execute one request under the per-request deadline, recording metrics
    /// and the outcome log. Lifecycle checks live at the public entry points
    /// so the shutdown drain can still execute.
    #[instrument(skip(self, request), fields(axis = request.axis.as_str()))]
    async fn execute(&self, request: InvalidationRequest) -> Result<InvalidationOutcome> {
        let deadline = self.config.read().invalidation_timeout;
        let started = Instant::now();

        let result = tokio::time::timeout(deadline, self.execute_axes(&request)).await;
        let execution_time = started.elapsed();

        match result {
            Ok(Ok(mut outcome)) => {
                outcome.execution_time = execution_time;
                outcome.success = true;
                self.record_success(&request, &outcome);
                Ok(outcome)
            }
            Ok(Err(error)) => {
                self.record_failure(&request, &error);
                Err(error)
            }
            Err(_) => {
                let error = FacetError::new(
                    ErrorCode::CacheError,
                    format!(
                        "Invalidation request {} exceeded its {} ms deadline",
                        request.id,
                        deadline.as_millis()
                    ),
                );
                self.record_failure(&request, &error);
                Err(error)
            }
        }
    }

    /// Run the primary axis, then fan the cascade out through the tracker.
    async fn execute_axes(&self, request: &InvalidationRequest) -> Result<InvalidationOutcome> {
        let mut outcome = InvalidationOutcome::default();

        let cascade_root = match request.axis {
            InvalidationAxis::Attribute => {
                let attribute_id = request.attribute_id.as_deref().ok_or_else(|| {
                    FacetError::validation("Attribute-axis request without attribute_id")
                })?;
                outcome.invalidated_count = self
                    .cache
                    .invalidate_by_attribute(attribute_id, request.target_id.as_deref());
                Some(attribute_id.to_string())
            }
            InvalidationAxis::Dependency => {
                let tag = request.dependency.as_deref().ok_or_else(|| {
                    FacetError::validation("Dependency-axis request without dependency tag")
                })?;
                outcome.invalidated_count = self.cache.invalidate_by_dependency(tag);
                self.metrics.lock().metrics.dependency_triggered += 1;
                Some(tag.to_string())
            }
            InvalidationAxis::Target => {
                let (kind, id) = match (request.target_kind, request.target_id.as_deref()) {
                    (Some(kind), Some(id)) => (kind, id),
                    _ => {
                        return Err(FacetError::validation(
                            "Target-axis request without target kind and id",
                        ))
                    }
                };
                outcome.invalidated_count = self.cache.invalidate_by_target(kind, id);
                None
            }
            InvalidationAxis::Collection => {
                let name = request.collection_name.as_deref().ok_or_else(|| {
                    FacetError::validation("Collection-axis request without collection name")
                })?;
                outcome.invalidated_count = self.cache.invalidate_by_collection(name);
                None
            }
            InvalidationAxis::Database => {
                outcome.invalidated_count = self.cache.clear();
                None
            }
        };

        // Cascade: remove dependents' entries directly. Derived steps never
        // re-cascade, which bounds the fan-out to one traversal of the graph.
        let config_allows = {
            let config = self.config.read();
            config.enable_cascading
                && (request.axis != InvalidationAxis::Dependency
                    || config.enable_dependency_tracking)
        };
        if request.cascading && config_allows {
            if let (Some(root), Some(tracker)) = (cascade_root, &self.tracker) {
                outcome.affected_attributes = tracker.affected(&root);
                for attribute_id in &outcome.affected_attributes {
                    outcome.cascading_invalidations +=
                        self.cache.invalidate_by_attribute(attribute_id, None);
                }
                if !outcome.affected_attributes.is_empty() {
                    self.metrics.lock().metrics.cascading_invalidations +=
                        outcome.affected_attributes.len() as u64;
                }
            }
        }

        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change-Feed Ingestion
    // ─────────────────────────────────────────────────────────────────────────

    async fn ingest_change(self: &Arc<Self>, change: ChangeEvent) {
        self.metrics.lock().metrics.database_triggered += 1;

        let request = match change.kind {
            ChangeKind::Insert | ChangeKind::Update | ChangeKind::Delete => {
                let Some(document_id) = change.document_id else {
                    warn!(collection = %change.collection_name, "Document change without id");
                    return;
                };
                InvalidationRequest::target(TargetKind::Document, document_id)
                    .with_reason(format!("database {:?}", change.kind))
            }
            ChangeKind::CollectionCreated | ChangeKind::CollectionDropped => {
                InvalidationRequest::collection(change.collection_name.clone())
                    .with_priority(InvalidationPriority::High)
                    .with_reason(format!("collection {:?}", change.kind))
            }
        };

        if let Err(error) = self.queue(request).await {
            warn!(error = %error, "Failed to queue change-triggered invalidation");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics, Log, Config
    // ─────────────────────────────────────────────────────────────────────────

    /// Current counters.
    pub fn get_metrics(&self) -> InvalidatorMetrics {
        let inner = self.metrics.lock();
        let mut metrics = inner.metrics.clone();
        metrics.avg_execution_time_us = if inner.metrics.successful_invalidations > 0 {
            inner.total_execution_us as f64 / inner.metrics.successful_invalidations as f64
        } else {
            0.0
        };
        metrics
    }

    /// Reset counters.
    pub fn clear_metrics(&self) {
        *self.metrics.lock() = MetricsInner::default();
    }

    /// Recent invalidation outcomes, newest first.
    pub fn recent(&self, limit: usize) -> Vec<InvalidationRecord> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Replace the runtime configuration.
    pub fn update_config(&self, config: InvalidatorConfig) {
        *self.config.write() = config;
        self.events.emit(InvalidatorEvent::ConfigUpdated);
    }

    /// Current configuration.
    pub fn get_config(&self) -> InvalidatorConfig {
        self.config.read().clone()
    }

    fn record_success(&self, request: &InvalidationRequest, outcome: &InvalidationOutcome) {
        {
            let mut inner = self.metrics.lock();
            inner.metrics.total_invalidations += 1;
            inner.metrics.successful_invalidations += 1;
            inner.total_execution_us += outcome.execution_time.as_micros() as u64;
            inner.metrics.last_invalidation_at = Some(Utc::now());
            *inner
                .metrics
                .by_axis
                .entry(request.axis.as_str().to_string())
                .or_insert(0) += 1;
            *inner
                .metrics
                .by_priority
                .entry(request.priority.as_str().to_string())
                .or_insert(0) += 1;
        }
        counter!("facet_invalidations_total", "axis" => request.axis.as_str()).increment(1);

        self.events.emit(InvalidatorEvent::Invalidated {
            axis: request.axis,
            invalidated_count: outcome.invalidated_count,
            cascading_invalidations: outcome.cascading_invalidations,
            execution_time_ms: outcome.execution_time.as_millis() as u64,
        });
        self.push_record(request.clone(), outcome.clone());
    }

    fn record_failure(&self, request: &InvalidationRequest, error: &FacetError) {
        {
            let mut inner = self.metrics.lock();
            inner.metrics.total_invalidations += 1;
            inner.metrics.failed_invalidations += 1;
        }
        counter!("facet_invalidation_errors_total", "axis" => request.axis.as_str()).increment(1);
        error.log();

        self.events.emit(InvalidatorEvent::InvalidationError {
            axis: request.axis,
            code: error.code(),
            message: error.message().to_string(),
        });
        self.push_record(
            request.clone(),
            InvalidationOutcome {
                success: false,
                ..Default::default()
            },
        );
    }

    fn push_record(&self, request: InvalidationRequest, outcome: InvalidationOutcome) {
        let max = self.config.read().max_log_entries;
        let mut recent = self.recent.lock();
        if recent.len() >= max {
            recent.pop_front();
        }
        recent.push_back(InvalidationRecord {
            request,
            outcome,
            recorded_at: Utc::now(),
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
