//! Cache key generation.
//!
//! A [`CacheKey`] identifies a memoised value by attribute, target kind,
//! target id, and an optional context fingerprint. The canonical delimited
//! string form exists purely for internal indexing; the public API always
//! takes the structured key.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::definition::TargetKind;

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Key
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a cached attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Attribute the value belongs to
    pub attribute_id: String,

    /// Kind of the target entity
    pub target_kind: TargetKind,

    /// Identifier of the target entity
    pub target_id: String,

    /// Fingerprint partitioning parameterised computations
    pub context_fingerprint: Option<String>,
}

impl CacheKey {
    /// Create a key without a context fingerprint.
    pub fn new(
        attribute_id: impl Into<String>,
        target_kind: TargetKind,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            attribute_id: attribute_id.into(),
            target_kind,
            target_id: target_id.into(),
            context_fingerprint: None,
        }
    }

    /// Attach a context fingerprint.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.context_fingerprint = Some(fingerprint.into());
        self
    }

    /// Canonical string form: `attributeId:targetKind:targetId[:fingerprint]`.
    pub fn canonical(&self) -> String {
        match &self.context_fingerprint {
            Some(fp) => format!(
                "{}:{}:{}:{}",
                self.attribute_id,
                self.target_kind.as_str(),
                self.target_id,
                fp
            ),
            None => format!(
                "{}:{}:{}",
                self.attribute_id,
                self.target_kind.as_str(),
                self.target_id
            ),
        }
    }

    /// Parse a canonical string back into a structured key. Returns `None`
    /// for malformed strings.
    pub fn parse(canonical: &str) -> Option<Self> {
        let mut parts = canonical.splitn(4, ':');
        let attribute_id = parts.next()?.to_string();
        let target_kind = match parts.next()? {
            "user" => TargetKind::User,
            "document" => TargetKind::Document,
            "collection" => TargetKind::Collection,
            "database" => TargetKind::Database,
            _ => return None,
        };
        let target_id = parts.next()?.to_string();
        let context_fingerprint = parts.next().map(|s| s.to_string());
        Some(Self {
            attribute_id,
            target_kind,
            target_id,
            context_fingerprint,
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key Hashing Utilities
// ═══════════════════════════════════════════════════════════════════════════════

/// Hash a value for use in cache keys.
pub fn hash_for_key<T: std::hash::Hash>(value: &T) -> String {
    use std::hash::{DefaultHasher, Hasher};
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
