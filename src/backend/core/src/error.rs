//! Error handling for Facet Core.
//!
//! This module provides:
//! - A single crate-wide error type with stable, machine-readable codes
//! - Retryability and severity classification per code
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use facet_core::error::{FacetError, Result, ErrorContext};
//!
//! fn my_function() -> Result<()> {
//!     some_operation()
//!         .context("Failed to perform operation")?;
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Facet operations.
pub type Result<T> = std::result::Result<T, FacetError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation Errors (1000-1099)
    ValidationError,
    MissingRequiredField,
    InvalidTargetKind,
    DuplicateAttribute,

    // Registry Errors (1100-1199)
    AttributeNotFound,

    // Dependency Graph Errors (1200-1299)
    CircularDependency,
    MaxDepthExceeded,
    DependencyLimitExceeded,

    // Computation Errors (1300-1399)
    ComputationFailed,
    ComputationTimeout,
    MemoryLimitExceeded,

    // Cache Errors (2000-2099)
    CacheError,
    SnapshotVersionMismatch,

    // Serialization Errors (2100-2199)
    SerializationError,
    DeserializationError,

    // External Service Errors (3000-3099)
    ExternalRequestFailed,

    // Configuration / Lifecycle Errors (5000-5099)
    ConfigurationError,
    NotInitialised,
    AlreadyInitialised,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Validation
            Self::ValidationError => 1000,
            Self::MissingRequiredField => 1001,
            Self::InvalidTargetKind => 1002,
            Self::DuplicateAttribute => 1003,

            // Registry
            Self::AttributeNotFound => 1100,

            // Dependency graph
            Self::CircularDependency => 1200,
            Self::MaxDepthExceeded => 1201,
            Self::DependencyLimitExceeded => 1202,

            // Computation
            Self::ComputationFailed => 1300,
            Self::ComputationTimeout => 1301,
            Self::MemoryLimitExceeded => 1302,

            // Cache
            Self::CacheError => 2000,
            Self::SnapshotVersionMismatch => 2001,

            // Serialization
            Self::SerializationError => 2100,
            Self::DeserializationError => 2101,

            // External
            Self::ExternalRequestFailed => 3000,

            // Configuration / lifecycle
            Self::ConfigurationError => 5000,
            Self::NotInitialised => 5001,
            Self::AlreadyInitialised => 5002,

            // Internal
            Self::InternalError => 9000,
        }
    }

    /// Get the stable string form of this code (e.g. `ATTRIBUTE_NOT_FOUND`).
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            Self::InvalidTargetKind => "INVALID_TARGET_KIND",
            Self::DuplicateAttribute => "DUPLICATE_ATTRIBUTE",
            Self::AttributeNotFound => "ATTRIBUTE_NOT_FOUND",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
            Self::MaxDepthExceeded => "MAX_DEPTH_EXCEEDED",
            Self::DependencyLimitExceeded => "DEPENDENCY_LIMIT_EXCEEDED",
            Self::ComputationFailed => "COMPUTATION_FAILED",
            Self::ComputationTimeout => "COMPUTATION_TIMEOUT",
            Self::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Self::CacheError => "CACHE_ERROR",
            Self::SnapshotVersionMismatch => "SNAPSHOT_VERSION_MISMATCH",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::DeserializationError => "DESERIALIZATION_ERROR",
            Self::ExternalRequestFailed => "EXTERNAL_REQUEST_FAILED",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::NotInitialised => "NOT_INITIALISED",
            Self::AlreadyInitialised => "ALREADY_INITIALISED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ComputationFailed
                | Self::ComputationTimeout
                | Self::MemoryLimitExceeded
                | Self::CacheError
                | Self::ExternalRequestFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "validation",
            1100..=1199 => "registry",
            1200..=1299 => "dependency",
            1300..=1399 => "computation",
            2000..=2099 => "cache",
            2100..=2199 => "serialization",
            3000..=3099 => "external_service",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown attribute)
    Low,
    /// Operational issues (timeouts, compute failures)
    Medium,
    /// System errors (cache inconsistency, serialization faults)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            // Low severity - caller errors
            ErrorCode::ValidationError
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidTargetKind
            | ErrorCode::DuplicateAttribute
            | ErrorCode::AttributeNotFound
            | ErrorCode::CircularDependency
            | ErrorCode::MaxDepthExceeded
            | ErrorCode::DependencyLimitExceeded => Self::Low,

            // Medium severity - operational
            ErrorCode::ComputationFailed
            | ErrorCode::ComputationTimeout
            | ErrorCode::MemoryLimitExceeded
            | ErrorCode::ExternalRequestFailed => Self::Medium,

            // High severity - system errors
            ErrorCode::CacheError
            | ErrorCode::SnapshotVersionMismatch
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::NotInitialised
            | ErrorCode::AlreadyInitialised => Self::High,

            // Critical severity
            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Facet Core.
///
/// Every error crossing the public API carries a stable [`ErrorCode`], a
/// human-readable message, and optionally the attribute/target the failure
/// relates to plus the original cause.
#[derive(Error, Debug)]
pub struct FacetError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable error message
    message: Cow<'static, str>,

    /// Attribute the error relates to, if any
    attribute_id: Option<String>,

    /// Target the error relates to, if any
    target_id: Option<String>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for FacetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref attr) = self.attribute_id {
            write!(f, " (attribute: {})", attr)?;
        }
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl FacetError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            attribute_id: None,
            target_id: None,
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both public and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration/lifecycle misuse error.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    /// Create a use-before-init error for the named component.
    pub fn not_initialised(component: &str) -> Self {
        Self::new(
            ErrorCode::NotInitialised,
            format!("{} has not been initialised", component),
        )
    }

    /// Create a double-init error for the named component.
    pub fn already_initialised(component: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyInitialised,
            format!("{} is already initialised", component),
        )
    }

    /// Create an unknown-attribute error.
    pub fn attribute_not_found(attribute_id: impl Into<String>) -> Self {
        let id = attribute_id.into();
        Self::new(
            ErrorCode::AttributeNotFound,
            format!("Attribute not found: {}", id),
        )
        .with_attribute(id)
    }

    /// Create a duplicate-registration error.
    pub fn duplicate_attribute(attribute_id: impl Into<String>) -> Self {
        let id = attribute_id.into();
        Self::new(
            ErrorCode::DuplicateAttribute,
            format!("Attribute already registered: {}", id),
        )
        .with_attribute(id)
    }

    /// Create a cycle detected error.
    pub fn circular_dependency(details: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::CircularDependency,
            format!("Circular dependency detected: {}", details.into()),
        )
    }

    /// Create a dependency depth bound error.
    pub fn max_depth_exceeded(attribute_id: impl Into<String>, depth: usize, max: usize) -> Self {
        let id = attribute_id.into();
        Self::new(
            ErrorCode::MaxDepthExceeded,
            format!(
                "Dependency depth {} from '{}' exceeds maximum {}",
                depth, id, max
            ),
        )
        .with_attribute(id)
    }

    /// Create a per-attribute dependency cap error.
    pub fn dependency_limit_exceeded(attribute_id: impl Into<String>, max: usize) -> Self {
        let id = attribute_id.into();
        Self::new(
            ErrorCode::DependencyLimitExceeded,
            format!("Attribute '{}' exceeds the limit of {} dependencies", id, max),
        )
        .with_attribute(id)
    }

    /// Create a compute-body failure error.
    pub fn computation_failed(attribute_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let id = attribute_id.into();
        Self::new(
            ErrorCode::ComputationFailed,
            format!("Computation of '{}' failed: {}", id, reason.into()),
        )
        .with_attribute(id)
    }

    /// Create a compute-body timeout error.
    pub fn computation_timeout(attribute_id: impl Into<String>, timeout_ms: u64) -> Self {
        let id = attribute_id.into();
        Self::new(
            ErrorCode::ComputationTimeout,
            format!("Computation of '{}' exceeded {} ms", id, timeout_ms),
        )
        .with_attribute(id)
    }

    /// Create a memory cap error.
    pub fn memory_limit_exceeded(used: u64, limit: u64) -> Self {
        Self::new(
            ErrorCode::MemoryLimitExceeded,
            format!("Memory limit exceeded: used {} bytes, limit {}", used, limit),
        )
    }

    /// Create a cache inconsistency error.
    pub fn cache(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::CacheError, message)
    }

    /// Create an external-collaborator failure error.
    pub fn external_request_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ExternalRequestFailed,
            format!("External request failed: {}", reason.into()),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach the attribute id this error relates to.
    pub fn with_attribute(mut self, attribute_id: impl Into<String>) -> Self {
        self.attribute_id = Some(attribute_id.into());
        self
    }

    /// Attach the target id this error relates to.
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Attach a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach an internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the related attribute id (if any).
    pub fn attribute_id(&self) -> Option<&str> {
        self.attribute_id.as_deref()
    }

    /// Get the related target id (if any).
    pub fn target_id(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.as_str();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "facet_errors_total",
            "code" => self.code.as_str(),
            "category" => self.code.category(),
            "retryable" => if self.code.is_retryable() { "true" } else { "false" },
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| FacetError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| FacetError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| FacetError::new(ErrorCode::AttributeNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| FacetError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for FacetError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for FacetError {
    fn from(error: reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            "External request timed out"
        } else if error.is_connect() {
            "Failed to connect to external service"
        } else {
            "External request failed"
        };

        Self::with_internal(ErrorCode::ExternalRequestFailed, message, error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for FacetError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::ComputationTimeout,
            "Operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<anyhow::Error> for FacetError {
    fn from(error: anyhow::Error) -> Self {
        // Preserve typed errors raised inside opaque compute bodies
        match error.downcast::<FacetError>() {
            Ok(facet_error) => facet_error,
            Err(error) => Self::with_internal(
                ErrorCode::ComputationFailed,
                "Computation failed",
                error.to_string(),
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::AttributeNotFound.as_str(), "ATTRIBUTE_NOT_FOUND");
        assert_eq!(ErrorCode::CircularDependency.as_str(), "CIRCULAR_DEPENDENCY");
        assert_eq!(ErrorCode::ComputationTimeout.as_str(), "COMPUTATION_TIMEOUT");
        assert_eq!(ErrorCode::MaxDepthExceeded.as_str(), "MAX_DEPTH_EXCEEDED");
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::ComputationTimeout.is_retryable());
        assert!(ErrorCode::ComputationFailed.is_retryable());
        assert!(ErrorCode::ExternalRequestFailed.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::CircularDependency.is_retryable());
        assert!(!ErrorCode::AttributeNotFound.is_retryable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::ValidationError.category(), "validation");
        assert_eq!(ErrorCode::CircularDependency.category(), "dependency");
        assert_eq!(ErrorCode::ComputationTimeout.category(), "computation");
        assert_eq!(ErrorCode::CacheError.category(), "cache");
        assert_eq!(ErrorCode::NotInitialised.category(), "configuration");
    }

    #[test]
    fn test_error_creation() {
        let error = FacetError::attribute_not_found("user.score");
        assert_eq!(error.code(), ErrorCode::AttributeNotFound);
        assert_eq!(error.attribute_id(), Some("user.score"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_error_with_target() {
        let error = FacetError::computation_timeout("doc.summary", 30_000).with_target("doc-1");
        assert_eq!(error.code(), ErrorCode::ComputationTimeout);
        assert_eq!(error.attribute_id(), Some("doc.summary"));
        assert_eq!(error.target_id(), Some("doc-1"));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ValidationError),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ComputationTimeout),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::CacheError),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InternalError),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = FacetError::with_internal(
            ErrorCode::CacheError,
            "Cache inconsistency detected",
            "size accounting drifted",
        );

        let display = format!("{}", error);
        assert!(display.contains("CACHE_ERROR"));
        assert!(display.contains("Cache inconsistency detected"));
        assert!(display.contains("size accounting drifted"));
    }

    #[test]
    fn test_error_serde_code() {
        let json = serde_json::to_string(&ErrorCode::AttributeNotFound).unwrap();
        assert_eq!(json, "\"ATTRIBUTE_NOT_FOUND\"");
    }

    #[test]
    fn test_anyhow_conversion_preserves_typed_errors() {
        let inner = FacetError::attribute_not_found("a");
        let through: FacetError = anyhow::Error::new(inner).into();
        assert_eq!(through.code(), ErrorCode::AttributeNotFound);

        let opaque: FacetError = anyhow::anyhow!("boom").into();
        assert_eq!(opaque.code(), ErrorCode::ComputationFailed);
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.context("Attribute not found: x").unwrap_err();
        assert_eq!(error.code(), ErrorCode::AttributeNotFound);
    }
}
