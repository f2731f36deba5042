//! Component event publication.
//!
//! Every core component exposes a listener interface backed by a
//! `tokio::sync::broadcast` channel: subscribers get an independent receiver,
//! slow subscribers lag and lose the oldest events rather than blocking the
//! publisher. Events for a single key are emitted from the mutating
//! call-site, so per-key ordering follows operation order; no global ordering
//! is guaranteed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ErrorCode;
use crate::invalidator::InvalidationAxis;

// ═══════════════════════════════════════════════════════════════════════════════
// Event Bus
// ═══════════════════════════════════════════════════════════════════════════════

/// Broadcast fan-out for a component's events.
#[derive(Debug)]
pub struct EventBus<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Publish an event. Delivery is best-effort: with no subscribers the
    /// event is dropped.
    pub fn emit(&self, event: T) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle and computation events published by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// Engine finished initialisation
    Initialised { at: DateTime<Utc> },

    /// Engine shut down
    Shutdown { at: DateTime<Utc> },

    /// A definition was registered
    AttributeRegistered { attribute_id: String },

    /// A definition was unregistered
    AttributeUnregistered { attribute_id: String },

    /// A compute body finished successfully
    Computed {
        attribute_id: String,
        target_id: String,
        elapsed_ms: u64,
        from_cache: bool,
    },

    /// A lookup was served from the cache
    CacheHit {
        attribute_id: String,
        target_id: String,
    },

    /// A lookup missed the cache and triggered computation
    CacheMiss {
        attribute_id: String,
        target_id: String,
    },

    /// Entries were invalidated through the engine surface
    Invalidated {
        attribute_id: String,
        target_id: Option<String>,
        count: u64,
    },

    /// A computation failed
    Error {
        attribute_id: String,
        target_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// TTL elapsed
    Expired,
    /// Evicted by the LRU policy
    Lru,
    /// Evicted by the LFU policy
    Lfu,
    /// Evicted by the shortest-remaining-TTL policy
    Ttl,
    /// Evicted by the random policy
    Random,
    /// Removed by an invalidation request
    Invalidated,
    /// Removed by an explicit delete or clear
    Explicit,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Ttl => "ttl",
            Self::Random => "random",
            Self::Invalidated => "invalidated",
            Self::Explicit => "explicit",
        }
    }
}

/// Events published by the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CacheEvent {
    /// Read served from the store
    Hit { key: String },

    /// Read found nothing (or an expired entry)
    Miss { key: String },

    /// A value was stored
    Set { key: String, size_bytes: u64 },

    /// An entry was removed by invalidation
    Invalidated { key: String },

    /// An entry was evicted
    Evicted { key: String, reason: RemovalReason },

    /// Internal cache fault
    Error { message: String },

    /// Memory usage crossed the warning threshold
    MemoryWarning { used_bytes: u64, max_bytes: u64 },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dependency Graph Events
// ═══════════════════════════════════════════════════════════════════════════════

/// What changed in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphChangeKind {
    Added,
    Removed,
    Cleared,
}

/// Change event published by the dependency tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEvent {
    /// What happened
    pub kind: GraphChangeKind,

    /// The attribute whose edges changed (absent for `Cleared`)
    pub attribute_id: Option<String>,

    /// The far end of the changed edge, if a single edge changed
    pub edge: Option<String>,

    /// Attributes transitively affected by the change
    pub affected: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidator Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Events published by the invalidator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InvalidatorEvent {
    /// A single request finished
    Invalidated {
        axis: InvalidationAxis,
        invalidated_count: u64,
        cascading_invalidations: u64,
        execution_time_ms: u64,
    },

    /// A queued batch finished
    BatchInvalidated {
        request_count: usize,
        invalidated_count: u64,
    },

    /// A request failed
    InvalidationError {
        axis: InvalidationAxis,
        code: ErrorCode,
        message: String,
    },

    /// A cascade step failed (remaining cascades continue)
    CascadingError {
        attribute_id: String,
        message: String,
    },

    /// Runtime configuration was replaced
    ConfigUpdated,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus: EventBus<CacheEvent> = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(CacheEvent::Hit {
            key: "a:user:1".to_string(),
        });

        match rx.recv().await.unwrap() {
            CacheEvent::Hit { key } => assert_eq!(key, "a:user:1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus: EventBus<CacheEvent> = EventBus::new(16);
        bus.emit(CacheEvent::Miss {
            key: "k".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_per_key_ordering() {
        let bus: EventBus<CacheEvent> = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(CacheEvent::Set {
            key: "k".to_string(),
            size_bytes: 10,
        });
        bus.emit(CacheEvent::Invalidated {
            key: "k".to_string(),
        });

        assert!(matches!(rx.recv().await.unwrap(), CacheEvent::Set { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            CacheEvent::Invalidated { .. }
        ));
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::CacheHit {
            attribute_id: "user.score".to_string(),
            target_id: "u1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("cache-hit"));
    }

    #[test]
    fn test_removal_reason_strings() {
        assert_eq!(RemovalReason::Expired.as_str(), "expired");
        assert_eq!(RemovalReason::Lru.as_str(), "lru");
        assert_eq!(RemovalReason::Invalidated.as_str(), "invalidated");
    }
}
