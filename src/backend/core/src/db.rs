//! Host database collaborator interfaces.
//!
//! The engine never owns a database; it consumes one through the narrow
//! [`Database`] trait: collection handles for compute bodies, and a change
//! feed the invalidator subscribes to. [`MemoryDatabase`] is a small
//! reference implementation backing tests and examples.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{FacetError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Change Feed
// ═══════════════════════════════════════════════════════════════════════════════

/// What happened in the host database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    CollectionCreated,
    CollectionDropped,
}

/// A single change published on the database's change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened
    pub kind: ChangeKind,

    /// Collection the change belongs to
    pub collection_name: String,

    /// Document affected, for document-level changes
    pub document_id: Option<String>,

    /// Changed fields, when the source reports them
    pub changes: Option<serde_json::Value>,

    /// When the change occurred
    pub timestamp: DateTime<Utc>,

    /// Originating node, when known
    pub node_id: Option<String>,
}

impl ChangeEvent {
    /// Convenience constructor for document-level changes.
    pub fn document(
        kind: ChangeKind,
        collection: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            collection_name: collection.into(),
            document_id: Some(document_id.into()),
            changes: None,
            timestamp: Utc::now(),
            node_id: None,
        }
    }

    /// Convenience constructor for collection lifecycle changes.
    pub fn collection(kind: ChangeKind, collection: impl Into<String>) -> Self {
        Self {
            kind,
            collection_name: collection.into(),
            document_id: None,
            changes: None,
            timestamp: Utc::now(),
            node_id: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Database Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle on a named collection, as exposed to compute bodies.
#[async_trait]
pub trait CollectionHandle: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Fetch a document by id.
    async fn get(&self, id: &str) -> Result<Option<serde_json::Value>>;

    /// Count documents in the collection.
    async fn count(&self) -> Result<u64>;
}

/// The host database, as consumed by the engine.
#[async_trait]
pub trait Database: Send + Sync {
    /// Database name.
    fn name(&self) -> &str;

    /// Look up a collection handle.
    async fn collection(&self, name: &str) -> Result<Arc<dyn CollectionHandle>>;

    /// Subscribe to the change feed.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Reference Implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory database used by tests and examples. Mutations publish change
/// events exactly as a real host feed would.
pub struct MemoryDatabase {
    name: String,
    collections: DashMap<String, Arc<MemoryCollection>>,
    changes: broadcast::Sender<ChangeEvent>,
}

/// A collection inside [`MemoryDatabase`].
pub struct MemoryCollection {
    name: String,
    documents: DashMap<String, serde_json::Value>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new(name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            name: name.into(),
            collections: DashMap::new(),
            changes,
        }
    }

    /// Create a collection, publishing a `CollectionCreated` change. Getting
    /// an existing collection is a no-op.
    pub fn create_collection(&self, name: impl Into<String>) -> Arc<MemoryCollection> {
        let name = name.into();
        let mut created = false;
        let collection = self
            .collections
            .entry(name.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(MemoryCollection {
                    name: name.clone(),
                    documents: DashMap::new(),
                })
            })
            .clone();
        if created {
            let _ = self
                .changes
                .send(ChangeEvent::collection(ChangeKind::CollectionCreated, name));
        }
        collection
    }

    /// Drop a collection, publishing a `CollectionDropped` change.
    pub fn drop_collection(&self, name: &str) -> bool {
        let dropped = self.collections.remove(name).is_some();
        if dropped {
            let _ = self
                .changes
                .send(ChangeEvent::collection(ChangeKind::CollectionDropped, name));
        }
        dropped
    }

    /// Insert or replace a document, publishing the matching change.
    pub fn put(&self, collection: &str, id: impl Into<String>, document: serde_json::Value) {
        let id = id.into();
        let handle = self.create_collection(collection);
        let kind = if handle.documents.insert(id.clone(), document).is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        let _ = self
            .changes
            .send(ChangeEvent::document(kind, collection, id));
    }

    /// Delete a document, publishing a `Delete` change.
    pub fn delete(&self, collection: &str, id: &str) -> bool {
        let removed = self
            .collections
            .get(collection)
            .map(|c| c.documents.remove(id).is_some())
            .unwrap_or(false);
        if removed {
            let _ = self
                .changes
                .send(ChangeEvent::document(ChangeKind::Delete, collection, id));
        }
        removed
    }

    /// Publish an arbitrary change event (for driving tests).
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collection(&self, name: &str) -> Result<Arc<dyn CollectionHandle>> {
        self.collections
            .get(name)
            .map(|c| c.clone() as Arc<dyn CollectionHandle>)
            .ok_or_else(|| {
                FacetError::validation(format!("Unknown collection: {}", name))
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl CollectionHandle for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.documents.get(id).map(|d| d.clone()))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.documents.len() as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// User / Auth Shapes
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimal user shape relied upon by example attributes; otherwise opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Authorization context attached to a computation, opaque to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub user: UserRef,
    #[serde(default)]
    pub claims: serde_json::Value,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let db = MemoryDatabase::new("test");
        db.put("users", "u1", json!({"name": "ada"}));

        let users = db.collection("users").await.unwrap();
        let doc = users.get("u1").await.unwrap().unwrap();
        assert_eq!(doc["name"], "ada");
        assert_eq!(users.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let db = MemoryDatabase::new("test");
        assert!(db.collection("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_change_feed_document_events() {
        let db = MemoryDatabase::new("test");
        let mut rx = db.subscribe();

        db.put("users", "u1", json!({}));
        db.put("users", "u1", json!({"v": 2}));
        db.delete("users", "u1");

        // create_collection publishes first, then the document change
        let created = rx.recv().await.unwrap();
        assert_eq!(created.kind, ChangeKind::CollectionCreated);

        let inserted = rx.recv().await.unwrap();
        assert_eq!(inserted.kind, ChangeKind::Insert);
        assert_eq!(inserted.document_id.as_deref(), Some("u1"));

        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.kind, ChangeKind::Update);

        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.kind, ChangeKind::Delete);
    }

    #[tokio::test]
    async fn test_drop_collection_event() {
        let db = MemoryDatabase::new("test");
        db.create_collection("temp");

        let mut rx = db.subscribe();
        assert!(db.drop_collection("temp"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::CollectionDropped);
        assert_eq!(event.collection_name, "temp");

        assert!(!db.drop_collection("temp"));
    }
}
