//! Computation contexts.
//!
//! A [`ComputationContext`] is the capability bundle handed to a compute
//! body: the target object, a database handle, and optionally a collection
//! name, user/auth context, an HTTP client, and bounded custom data. Compute
//! bodies see an immutable bundle and must not reach the cache or tracker
//! directly.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ContextConfig;
use crate::db::{AuthContext, Database, UserRef};
use crate::definition::{AttributeValue, TargetKind};
use crate::error::{ErrorCode, FacetError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Computation Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Capability bundle passed to a compute body. Built per computation, never
/// retained by the engine.
#[derive(Clone)]
pub struct ComputationContext {
    /// The target object itself (opaque JSON)
    pub target: AttributeValue,

    /// Identifier of the target entity
    pub target_id: String,

    /// Kind of the target entity
    pub target_kind: TargetKind,

    /// Host database handle
    pub database: Arc<dyn Database>,

    /// Collection the target belongs to, for document targets
    pub collection: Option<String>,

    /// The acting user, when the builder exposes user context
    pub current_user: Option<UserRef>,

    /// Authorization context, when available
    pub auth: Option<AuthContext>,

    /// When the context was built
    pub timestamp: DateTime<Utc>,

    /// Identity of this process/node
    pub node_id: String,

    http: Option<reqwest::Client>,
    custom_data: HashMap<String, AttributeValue>,
}

impl fmt::Debug for ComputationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationContext")
            .field("target_id", &self.target_id)
            .field("target_kind", &self.target_kind)
            .field("collection", &self.collection)
            .field("node_id", &self.node_id)
            .field("has_http", &self.http.is_some())
            .field("custom_keys", &self.custom_data.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ComputationContext {
    /// The HTTP client, when external access was granted.
    pub fn http(&self) -> Result<&reqwest::Client> {
        self.http.as_ref().ok_or_else(|| {
            FacetError::new(
                ErrorCode::ConfigurationError,
                "This computation is not permitted to make external requests",
            )
        })
    }

    /// Whether external HTTP access was granted.
    pub fn allows_external(&self) -> bool {
        self.http.is_some()
    }

    /// Look up a custom data value.
    pub fn custom(&self, key: &str) -> Option<&AttributeValue> {
        self.custom_data.get(key)
    }

    /// All custom data attached to this context.
    pub fn custom_data(&self) -> &HashMap<String, AttributeValue> {
        &self.custom_data
    }

    /// Fingerprint of the custom data, used to partition cache keys for
    /// parameterised computations. `None` when no custom data is attached.
    pub fn fingerprint(&self) -> Option<String> {
        if self.custom_data.is_empty() {
            return None;
        }
        let mut pairs: Vec<_> = self.custom_data.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        Some(crate::cache::key::hash_for_key(&format!("{:?}", pairs)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builds [`ComputationContext`] values under a [`ContextConfig`] policy.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    config: ContextConfig,
    node_id: String,
}

impl ContextBuilder {
    /// Create a builder with the given policy.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            node_id: Uuid::new_v4().to_string(),
        }
    }

    /// Override the node identity stamped on contexts.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Start a context for the given target.
    pub fn context(
        &self,
        database: Arc<dyn Database>,
        target_kind: TargetKind,
        target_id: impl Into<String>,
    ) -> ContextRequest<'_> {
        ContextRequest {
            builder: self,
            database,
            target_kind,
            target_id: target_id.into(),
            target: AttributeValue::Null,
            collection: None,
            current_user: None,
            auth: None,
            http: None,
            custom_data: HashMap::new(),
        }
    }

    /// Context for a user target.
    pub fn for_user(
        &self,
        database: Arc<dyn Database>,
        user_id: impl Into<String>,
    ) -> ContextRequest<'_> {
        self.context(database, TargetKind::User, user_id)
    }

    /// Context for a document target.
    pub fn for_document(
        &self,
        database: Arc<dyn Database>,
        collection: impl Into<String>,
        document_id: impl Into<String>,
    ) -> ContextRequest<'_> {
        self.context(database, TargetKind::Document, document_id)
            .collection(collection)
    }

    /// Context for a collection target.
    pub fn for_collection(
        &self,
        database: Arc<dyn Database>,
        collection: impl Into<String>,
    ) -> ContextRequest<'_> {
        let name = collection.into();
        self.context(database, TargetKind::Collection, name.clone())
            .collection(name)
    }

    /// Context for the database as a whole.
    pub fn for_database(&self, database: Arc<dyn Database>) -> ContextRequest<'_> {
        let id = database.name().to_string();
        self.context(database, TargetKind::Database, id)
    }
}

/// In-progress context construction.
pub struct ContextRequest<'a> {
    builder: &'a ContextBuilder,
    database: Arc<dyn Database>,
    target_kind: TargetKind,
    target_id: String,
    target: AttributeValue,
    collection: Option<String>,
    current_user: Option<UserRef>,
    auth: Option<AuthContext>,
    http: Option<reqwest::Client>,
    custom_data: HashMap<String, AttributeValue>,
}

impl ContextRequest<'_> {
    /// Attach the target object itself.
    pub fn target(mut self, target: AttributeValue) -> Self {
        self.target = target;
        self
    }

    /// Name the collection the target belongs to.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Attach the acting user.
    pub fn user(mut self, user: UserRef) -> Self {
        self.current_user = Some(user);
        self
    }

    /// Attach an authorization context.
    pub fn auth(mut self, auth: AuthContext) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Grant external HTTP access with the given client. Rejected at build
    /// time when the policy forbids it.
    pub fn http(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Attach a custom data value. The total serialized size of custom data
    /// is bounded by the policy.
    pub fn custom(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.custom_data.insert(key.into(), value);
        self
    }

    /// Validate and build the context.
    pub fn build(self) -> Result<ComputationContext> {
        if self.target_id.is_empty() {
            return Err(FacetError::new(
                ErrorCode::MissingRequiredField,
                "Computation context requires a target id",
            ));
        }
        if self.target_kind == TargetKind::Document && self.collection.is_none() {
            return Err(FacetError::validation(
                "Document contexts must name their collection",
            ));
        }
        if self.http.is_some() && !self.builder.config.allow_http {
            return Err(FacetError::configuration(
                "HTTP capability is disabled by the context policy",
            ));
        }

        let custom_bytes: usize = self
            .custom_data
            .values()
            .map(|v| serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0))
            .sum();
        if custom_bytes > self.builder.config.max_custom_data_bytes {
            return Err(FacetError::memory_limit_exceeded(
                custom_bytes as u64,
                self.builder.config.max_custom_data_bytes as u64,
            ));
        }

        let (current_user, auth) = if self.builder.config.expose_user_context {
            (self.current_user, self.auth)
        } else {
            (None, None)
        };

        Ok(ComputationContext {
            target: self.target,
            target_id: self.target_id,
            target_kind: self.target_kind,
            database: self.database,
            collection: self.collection,
            current_user,
            auth,
            timestamp: Utc::now(),
            node_id: self.builder.node_id.clone(),
            http: self.http,
            custom_data: self.custom_data,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use serde_json::json;

    fn db() -> Arc<dyn Database> {
        Arc::new(MemoryDatabase::new("test"))
    }

    #[test]
    fn test_build_user_context() {
        let builder = ContextBuilder::new(ContextConfig::default());
        let ctx = builder.for_user(db(), "u1").build().unwrap();

        assert_eq!(ctx.target_id, "u1");
        assert_eq!(ctx.target_kind, TargetKind::User);
        assert!(ctx.collection.is_none());
        assert!(!ctx.allows_external());
        assert!(ctx.fingerprint().is_none());
    }

    #[test]
    fn test_document_context_requires_collection() {
        let builder = ContextBuilder::new(ContextConfig::default());

        let bare = builder.context(db(), TargetKind::Document, "d1").build();
        assert_eq!(bare.unwrap_err().code(), ErrorCode::ValidationError);

        let ok = builder.for_document(db(), "articles", "d1").build().unwrap();
        assert_eq!(ok.collection.as_deref(), Some("articles"));
    }

    #[test]
    fn test_empty_target_id_rejected() {
        let builder = ContextBuilder::new(ContextConfig::default());
        let result = builder.context(db(), TargetKind::User, "").build();
        assert_eq!(result.unwrap_err().code(), ErrorCode::MissingRequiredField);
    }

    #[test]
    fn test_http_gated_by_policy() {
        let closed = ContextBuilder::new(ContextConfig::default());
        let denied = closed
            .for_user(db(), "u1")
            .http(reqwest::Client::new())
            .build();
        assert_eq!(denied.unwrap_err().code(), ErrorCode::ConfigurationError);

        let open = ContextBuilder::new(ContextConfig {
            allow_http: true,
            ..Default::default()
        });
        let ctx = open
            .for_user(db(), "u1")
            .http(reqwest::Client::new())
            .build()
            .unwrap();
        assert!(ctx.allows_external());
        assert!(ctx.http().is_ok());
    }

    #[test]
    fn test_custom_data_size_bound() {
        let builder = ContextBuilder::new(ContextConfig {
            max_custom_data_bytes: 16,
            ..Default::default()
        });

        let within = builder
            .for_user(db(), "u1")
            .custom("k", json!("short"))
            .build();
        assert!(within.is_ok());

        let over = builder
            .for_user(db(), "u1")
            .custom("k", json!("a much longer payload than allowed"))
            .build();
        assert_eq!(over.unwrap_err().code(), ErrorCode::MemoryLimitExceeded);
    }

    #[test]
    fn test_fingerprint_stability() {
        let builder = ContextBuilder::new(ContextConfig::default());
        let a = builder
            .for_user(db(), "u1")
            .custom("x", json!(1))
            .custom("y", json!(2))
            .build()
            .unwrap();
        let b = builder
            .for_user(db(), "u1")
            .custom("y", json!(2))
            .custom("x", json!(1))
            .build()
            .unwrap();
        let c = builder
            .for_user(db(), "u1")
            .custom("x", json!(3))
            .build()
            .unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_user_context_suppressed_by_policy() {
        let builder = ContextBuilder::new(ContextConfig {
            expose_user_context: false,
            ..Default::default()
        });
        let ctx = builder
            .for_user(db(), "u1")
            .user(UserRef {
                id: "u1".to_string(),
                roles: vec![],
                attributes: Default::default(),
            })
            .build()
            .unwrap();
        assert!(ctx.current_user.is_none());
    }

    #[test]
    fn test_database_context_uses_db_name() {
        let builder = ContextBuilder::new(ContextConfig::default());
        let ctx = builder.for_database(db()).build().unwrap();
        assert_eq!(ctx.target_kind, TargetKind::Database);
        assert_eq!(ctx.target_id, "test");
    }
}
