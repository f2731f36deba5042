//! Attribute definitions.
//!
//! An [`AttributeDefinition`] is the declarative description of a computed
//! value:
//! the target kind(s) it applies to, an opaque compute body, declared
//! dependencies, and caching/security policies. Definitions are immutable
//! once registered; changing one means unregister + register.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ComputationContext;
use crate::error::{FacetError, Result};

/// Attribute values are opaque JSON documents.
pub type AttributeValue = serde_json::Value;

/// The opaque compute body: user code invoked through a capability-restricted
/// context.
pub type ComputeFn =
    Arc<dyn Fn(ComputationContext) -> BoxFuture<'static, Result<AttributeValue>> + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// Target Kinds
// ═══════════════════════════════════════════════════════════════════════════════

/// The kind of entity an attribute is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A user of the host system
    User,
    /// A document inside a named collection
    Document,
    /// A collection as a whole
    Collection,
    /// The database as a whole
    Database,
}

impl TargetKind {
    /// Segment used in canonical cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Document => "document",
            Self::Collection => "collection",
            Self::Database => "database",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A definition's target: either a single kind or a set of kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSelector {
    /// Applies to exactly one target kind
    One(TargetKind),
    /// Applies to several target kinds
    Many(Vec<TargetKind>),
}

impl TargetSelector {
    /// Check whether this selector covers the given kind.
    pub fn matches(&self, kind: TargetKind) -> bool {
        match self {
            Self::One(k) => *k == kind,
            Self::Many(ks) => ks.contains(&kind),
        }
    }

    /// Whether the selector includes the document kind (which requires a
    /// target collection).
    pub fn includes_document(&self) -> bool {
        self.matches(TargetKind::Document)
    }
}

impl From<TargetKind> for TargetSelector {
    fn from(kind: TargetKind) -> Self {
        Self::One(kind)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dependencies
// ═══════════════════════════════════════════════════════════════════════════════

/// What a declared dependency points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// A field of the target document
    Field,
    /// A whole collection
    Collection,
    /// An external API
    ExternalApi,
    /// A system-provided source (clock, node identity, ...)
    System,
    /// Another computed attribute
    ComputedAttribute,
}

/// Relative priority of a dependency edge (metadata only; does not affect
/// graph shape).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPriority {
    Low,
    Medium,
    High,
}

impl Default for DependencyPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// A declared dependency of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// What the dependency points at (attribute id, field name, collection
    /// name, external source)
    pub target: String,

    /// The kind of dependency
    pub kind: DependencyKind,

    /// Relative priority
    #[serde(default)]
    pub priority: DependencyPriority,

    /// Whether a change to the dependency invalidates the dependent
    #[serde(default = "default_invalidate")]
    pub invalidate_on_change: bool,
}

fn default_invalidate() -> bool {
    true
}

impl DependencySpec {
    /// Declare a dependency on another computed attribute.
    pub fn attribute(id: impl Into<String>) -> Self {
        Self {
            target: id.into(),
            kind: DependencyKind::ComputedAttribute,
            priority: DependencyPriority::default(),
            invalidate_on_change: true,
        }
    }

    /// Declare a dependency on a field of the target.
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            target: name.into(),
            kind: DependencyKind::Field,
            priority: DependencyPriority::default(),
            invalidate_on_change: true,
        }
    }

    /// Declare a dependency on a collection.
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            target: name.into(),
            kind: DependencyKind::Collection,
            priority: DependencyPriority::default(),
            invalidate_on_change: true,
        }
    }

    /// Declare a dependency on an external API.
    pub fn external(source: impl Into<String>) -> Self {
        Self {
            target: source.into(),
            kind: DependencyKind::ExternalApi,
            priority: DependencyPriority::default(),
            invalidate_on_change: true,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: DependencyPriority) -> Self {
        self.priority = priority;
        self
    }

    /// The invalidation tag recorded on cache entries for this dependency.
    ///
    /// Computed-attribute dependencies tag with the bare attribute id so the
    /// dependency axis can match either form; everything else is namespaced
    /// by kind.
    pub fn tag(&self) -> String {
        match self.kind {
            DependencyKind::ComputedAttribute => self.target.clone(),
            DependencyKind::Field => format!("field:{}", self.target),
            DependencyKind::Collection => format!("collection:{}", self.target),
            DependencyKind::ExternalApi => format!("external:{}", self.target),
            DependencyKind::System => format!("system:{}", self.target),
        }
    }

    /// Node key for the dependency graph.
    pub(crate) fn node_key(&self) -> String {
        self.tag()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policies
// ═══════════════════════════════════════════════════════════════════════════════

/// Caching policy for an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Whether results are cached at all
    #[serde(default = "default_invalidate")]
    pub enabled: bool,

    /// TTL for cached results; `None` falls back to the cache default
    #[serde(with = "humantime_serde::option", default)]
    pub ttl: Option<Duration>,

    /// Extra invalidation trigger tags recorded on cache entries
    #[serde(default)]
    pub invalidation_triggers: Vec<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
            invalidation_triggers: Vec::new(),
        }
    }
}

/// Security policy for an attribute's compute body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Whether the compute body may reach external services over HTTP
    #[serde(default)]
    pub allow_external: bool,

    /// Compute deadline; `None` falls back to the engine default (30 s)
    #[serde(with = "humantime_serde::option", default)]
    pub timeout: Option<Duration>,

    /// Advisory memory cap for the computation
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allow_external: false,
            timeout: None,
            max_memory_bytes: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Attribute Definition
// ═══════════════════════════════════════════════════════════════════════════════

/// Declarative description of a computed value.
#[derive(Clone)]
pub struct AttributeDefinition {
    /// Stable identifier (ASCII identifier rules)
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Target kind(s) this attribute applies to
    pub target: TargetSelector,

    /// Collection name, required when the target includes documents
    pub target_collection: Option<String>,

    /// The opaque compute body
    pub compute: ComputeFn,

    /// Declared dependencies
    pub dependencies: Vec<DependencySpec>,

    /// Caching policy
    pub caching: CachePolicy,

    /// Security policy
    pub security: SecurityPolicy,

    /// Who registered the definition
    pub created_by: Option<String>,

    /// When the definition was created
    pub created_at: DateTime<Utc>,

    /// Whether the definition is active
    pub active: bool,
}

impl fmt::Debug for AttributeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("target", &self.target)
            .field("target_collection", &self.target_collection)
            .field("dependencies", &self.dependencies)
            .field("caching", &self.caching)
            .field("security", &self.security)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl AttributeDefinition {
    /// Start building a definition.
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> AttributeDefinitionBuilder {
        AttributeDefinitionBuilder::new(id, name)
    }

    /// Structural validation: id shape, target/collection coupling, policy
    /// sanity. Undeclared runtime dependencies are deliberately not checked.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(FacetError::new(
                crate::error::ErrorCode::MissingRequiredField,
                "Attribute id must not be empty",
            ));
        }
        if !is_valid_identifier(&self.id) {
            return Err(FacetError::validation(format!(
                "Attribute id '{}' is not a valid identifier",
                self.id
            )));
        }
        if self.name.is_empty() {
            return Err(FacetError::new(
                crate::error::ErrorCode::MissingRequiredField,
                "Attribute name must not be empty",
            ));
        }
        if self.target.includes_document() && self.target_collection.is_none() {
            return Err(FacetError::validation(format!(
                "Document-targeted attribute '{}' must name its target collection",
                self.id
            )));
        }
        if let Some(timeout) = self.security.timeout {
            if timeout.is_zero() {
                return Err(FacetError::validation(format!(
                    "Attribute '{}' declares a zero compute timeout",
                    self.id
                )));
            }
        }
        for dep in &self.dependencies {
            if dep.target.is_empty() {
                return Err(FacetError::validation(format!(
                    "Attribute '{}' declares a dependency with an empty target",
                    self.id
                )));
            }
            if dep.kind == DependencyKind::ComputedAttribute && dep.target == self.id {
                return Err(FacetError::circular_dependency(format!(
                    "attribute '{}' depends on itself",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Tags recorded on cache entries for this definition: every declared
    /// dependency plus any extra invalidation triggers.
    pub fn dependency_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.dependencies.iter().map(DependencySpec::tag).collect();
        tags.extend(self.caching.invalidation_triggers.iter().cloned());
        tags
    }
}

/// ASCII identifier rules: leading alpha or underscore, then alphanumerics,
/// underscores, dots, or dashes.
fn is_valid_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`AttributeDefinition`].
pub struct AttributeDefinitionBuilder {
    id: String,
    name: String,
    target: TargetSelector,
    target_collection: Option<String>,
    compute: Option<ComputeFn>,
    dependencies: Vec<DependencySpec>,
    caching: CachePolicy,
    security: SecurityPolicy,
    created_by: Option<String>,
}

impl AttributeDefinitionBuilder {
    fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            target: TargetSelector::One(TargetKind::Document),
            target_collection: None,
            compute: None,
            dependencies: Vec::new(),
            caching: CachePolicy::default(),
            security: SecurityPolicy::default(),
            created_by: None,
        }
    }

    /// Set the target kind.
    pub fn target(mut self, target: impl Into<TargetSelector>) -> Self {
        self.target = target.into();
        self
    }

    /// Set several target kinds.
    pub fn targets(mut self, kinds: impl IntoIterator<Item = TargetKind>) -> Self {
        self.target = TargetSelector::Many(kinds.into_iter().collect());
        self
    }

    /// Name the collection for document-targeted attributes.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.target_collection = Some(name.into());
        self
    }

    /// Install the compute body.
    pub fn compute<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ComputationContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<AttributeValue>> + Send + 'static,
    {
        self.compute = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Add a declared dependency.
    pub fn dependency(mut self, dep: DependencySpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// Add several declared dependencies.
    pub fn dependencies(mut self, deps: impl IntoIterator<Item = DependencySpec>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    /// Set the caching policy.
    pub fn caching(mut self, caching: CachePolicy) -> Self {
        self.caching = caching;
        self
    }

    /// Set the TTL (shorthand for a caching policy tweak).
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.caching.ttl = Some(ttl);
        self
    }

    /// Disable caching for this attribute.
    pub fn no_cache(mut self) -> Self {
        self.caching.enabled = false;
        self
    }

    /// Set the security policy.
    pub fn security(mut self, security: SecurityPolicy) -> Self {
        self.security = security;
        self
    }

    /// Set the compute timeout (shorthand for a security policy tweak).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.security.timeout = Some(timeout);
        self
    }

    /// Record who registered the definition.
    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = Some(who.into());
        self
    }

    /// Finish building. Fails when the compute body is missing or a
    /// structural invariant is violated.
    pub fn build(self) -> Result<AttributeDefinition> {
        let compute = self.compute.ok_or_else(|| {
            FacetError::new(
                crate::error::ErrorCode::MissingRequiredField,
                format!("Attribute '{}' has no compute body", self.id),
            )
        })?;

        let definition = AttributeDefinition {
            id: self.id,
            name: self.name,
            target: self.target,
            target_collection: self.target_collection,
            compute,
            dependencies: self.dependencies,
            caching: self.caching,
            security: self.security,
            created_by: self.created_by,
            created_at: Utc::now(),
            active: true,
        };

        definition.validate()?;
        Ok(definition)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn minimal(id: &str) -> AttributeDefinitionBuilder {
        AttributeDefinition::builder(id, "Test attribute")
            .target(TargetKind::User)
            .compute(|_ctx| async { Ok(json!(42)) })
    }

    #[test]
    fn test_build_minimal_definition() {
        let def = minimal("user.score").build().unwrap();
        assert_eq!(def.id, "user.score");
        assert!(def.active);
        assert!(def.caching.enabled);
        assert!(def.dependencies.is_empty());
    }

    #[test]
    fn test_missing_compute_body() {
        let result = AttributeDefinition::builder("x", "X")
            .target(TargetKind::User)
            .build();
        assert_eq!(result.unwrap_err().code(), ErrorCode::MissingRequiredField);
    }

    #[test]
    fn test_empty_id_rejected() {
        let result = AttributeDefinition::builder("", "X")
            .target(TargetKind::User)
            .compute(|_| async { Ok(json!(null)) })
            .build();
        assert_eq!(result.unwrap_err().code(), ErrorCode::MissingRequiredField);
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("user.score"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("a-b_c.d2"));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("ünïcode"));
    }

    #[test]
    fn test_document_requires_collection() {
        let result = AttributeDefinition::builder("doc.words", "Word count")
            .target(TargetKind::Document)
            .compute(|_| async { Ok(json!(0)) })
            .build();
        assert_eq!(result.unwrap_err().code(), ErrorCode::ValidationError);

        let ok = AttributeDefinition::builder("doc.words", "Word count")
            .target(TargetKind::Document)
            .collection("articles")
            .compute(|_| async { Ok(json!(0)) })
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let result = minimal("a")
            .dependency(DependencySpec::attribute("a"))
            .build();
        assert_eq!(result.unwrap_err().code(), ErrorCode::CircularDependency);
    }

    #[test]
    fn test_target_selector_matching() {
        let one = TargetSelector::One(TargetKind::User);
        assert!(one.matches(TargetKind::User));
        assert!(!one.matches(TargetKind::Document));

        let many = TargetSelector::Many(vec![TargetKind::User, TargetKind::Database]);
        assert!(many.matches(TargetKind::Database));
        assert!(!many.matches(TargetKind::Collection));
    }

    #[test]
    fn test_dependency_tags() {
        let def = minimal("profile.rank")
            .dependency(DependencySpec::attribute("profile.score"))
            .dependency(DependencySpec::field("age"))
            .dependency(DependencySpec::collection("users"))
            .caching(CachePolicy {
                enabled: true,
                ttl: None,
                invalidation_triggers: vec!["custom-tag".to_string()],
            })
            .build()
            .unwrap();

        let tags = def.dependency_tags();
        assert_eq!(
            tags,
            vec!["profile.score", "field:age", "collection:users", "custom-tag"]
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = minimal("x").timeout(Duration::ZERO).build();
        assert_eq!(result.unwrap_err().code(), ErrorCode::ValidationError);
    }

    #[test]
    fn test_target_selector_serde() {
        let one: TargetSelector = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(one, TargetSelector::One(TargetKind::User));

        let many: TargetSelector = serde_json::from_str("[\"user\", \"document\"]").unwrap();
        assert!(many.matches(TargetKind::Document));
    }
}
