//! Structured error handling for Modulith Core.
//!
//! This module provides:
//! - A crate-wide error type with stable, machine-readable error codes
//! - Severity classification driving log level
//! - Structured details (entity, context map, suggestion) for diagnostics
//! - Error metrics through the `metrics` facade
//! - Conversions from every component error and common library errors
//!
//! Component-level errors ([`RegistryError`], [`DescriptorError`],
//! [`DispatchError`], [`EventStoreError`]) are plain `thiserror` enums; they
//! convert into [`ModulithError`] at API boundaries that need a single type.
//!
//! # Usage
//!
//! ```rust,ignore
//! use modulith_core::error::{ErrorContext, ErrorCode, Result};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("module.toml").context("Failed to read descriptor")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::events::DispatchError;
use crate::modules::{DescriptorError, RegistryError};
use crate::store::EventStoreError;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Modulith operations.
pub type Result<T> = std::result::Result<T, ModulithError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Module Errors (1000-1099)
    ModuleConfigInvalid,
    ModuleAlreadyRegistered,
    ModuleNotFound,
    MissingDependency,
    CircularDependency,
    ModuleInitializationFailed,
    DescriptorNotFound,
    DescriptorParseFailed,

    // Event Errors (1100-1199)
    EventListenerFailed,
    InvalidEvent,

    // Event Store Errors (1200-1299)
    EventStoreVersionConflict,
    EventStoreSchemaFailed,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    DatabaseTransactionFailed,
    RecordNotFound,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    IoError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ModuleConfigInvalid => 1000,
            Self::ModuleAlreadyRegistered => 1001,
            Self::ModuleNotFound => 1002,
            Self::MissingDependency => 1003,
            Self::CircularDependency => 1004,
            Self::ModuleInitializationFailed => 1005,
            Self::DescriptorNotFound => 1006,
            Self::DescriptorParseFailed => 1007,

            Self::EventListenerFailed => 1100,
            Self::InvalidEvent => 1101,

            Self::EventStoreVersionConflict => 1200,
            Self::EventStoreSchemaFailed => 1201,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::DatabaseTransactionFailed => 2003,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::IoError => 9001,
            Self::UnknownError => 9099,
        }
    }

    /// Check if the failed operation may succeed when retried unchanged.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EventStoreVersionConflict
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::DatabaseTransactionFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "module",
            1100..=1199 => "event",
            1200..=1299 => "event_store",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad descriptor, unknown module)
    Low,
    /// Operational issues (version conflicts, listener failures)
    Medium,
    /// Boot-blocking or storage errors
    High,
    /// Errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ModuleConfigInvalid
            | ErrorCode::ModuleAlreadyRegistered
            | ErrorCode::ModuleNotFound
            | ErrorCode::DescriptorNotFound
            | ErrorCode::DescriptorParseFailed
            | ErrorCode::InvalidEvent
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord => Self::Low,

            ErrorCode::EventListenerFailed | ErrorCode::EventStoreVersionConflict => Self::Medium,

            ErrorCode::MissingDependency
            | ErrorCode::CircularDependency
            | ErrorCode::ModuleInitializationFailed
            | ErrorCode::EventStoreSchemaFailed
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::DatabaseTransactionFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::IoError => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (module name, aggregate id, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Modulith Core.
#[derive(Error, Debug)]
pub struct ModulithError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ModulithError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ModulithError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
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
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "modulith_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
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
        self.map_err(|e| ModulithError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| ModulithError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ModulithError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| ModulithError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Component Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl From<RegistryError> for ModulithError {
    fn from(error: RegistryError) -> Self {
        let (code, details) = match &error {
            RegistryError::ConfigInvalid { module, violations } => (
                ErrorCode::ModuleConfigInvalid,
                ErrorDetails::new()
                    .with_entity("module", module)
                    .with_context("violations", violations)
                    .with_suggestion("Fix the listed descriptor fields and register again"),
            ),
            RegistryError::AlreadyRegistered(name) => (
                ErrorCode::ModuleAlreadyRegistered,
                ErrorDetails::new().with_entity("module", name),
            ),
            RegistryError::ModuleNotFound(name) => (
                ErrorCode::ModuleNotFound,
                ErrorDetails::new().with_entity("module", name),
            ),
            RegistryError::MissingDependency { module, missing } => (
                ErrorCode::MissingDependency,
                ErrorDetails::new()
                    .with_entity("module", module)
                    .with_context("missing", missing),
            ),
            RegistryError::CircularDependency { cycle } => (
                ErrorCode::CircularDependency,
                ErrorDetails::new().with_context("cycle", cycle),
            ),
            RegistryError::InitializationFailed { module, reason } => (
                ErrorCode::ModuleInitializationFailed,
                ErrorDetails::new()
                    .with_entity("module", module)
                    .with_context("reason", reason),
            ),
            RegistryError::Descriptor(_) => (ErrorCode::DescriptorParseFailed, ErrorDetails::new()),
            RegistryError::Io(_) => (ErrorCode::IoError, ErrorDetails::new()),
        };

        Self::new(code, error.to_string())
            .with_details(details)
            .with_source(error)
    }
}

impl From<DescriptorError> for ModulithError {
    fn from(error: DescriptorError) -> Self {
        let code = match &error {
            DescriptorError::NotFound { .. } => ErrorCode::DescriptorNotFound,
            DescriptorError::ParseError { .. } => ErrorCode::DescriptorParseFailed,
            DescriptorError::Invalid { .. } => ErrorCode::ModuleConfigInvalid,
            DescriptorError::Io(_) => ErrorCode::IoError,
        };
        Self::new(code, error.to_string()).with_source(error)
    }
}

impl From<DispatchError> for ModulithError {
    fn from(error: DispatchError) -> Self {
        Self::new(ErrorCode::InvalidEvent, error.to_string()).with_source(error)
    }
}

impl From<EventStoreError> for ModulithError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::VersionConflict {
                ref aggregate_id,
                ref aggregate_type,
                version,
            } => {
                let details = ErrorDetails::new()
                    .with_entity(aggregate_type.clone(), aggregate_id.clone())
                    .with_context("version", version)
                    .with_suggestion("Retry with a freshly read aggregate version");
                Self::new(ErrorCode::EventStoreVersionConflict, error.to_string())
                    .with_details(details)
                    .with_source(error)
            }
            EventStoreError::Database(db) => Self::from(db),
            EventStoreError::Serialization(e) => Self::from(e),
            EventStoreError::Schema(ref message) => {
                Self::with_internal(
                    ErrorCode::EventStoreSchemaFailed,
                    "Event store schema could not be prepared",
                    message.clone(),
                )
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Library Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for ModulithError {
    fn from(error: sqlx::Error) -> Self {
        let (code, msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "The requested record was not found"),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "A record with this identifier already exists",
                        error.to_string(),
                    )
                    .with_source(error);
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for ModulithError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for ModulithError {
    fn from(error: std::io::Error) -> Self {
        let code = match error.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::RecordNotFound,
            _ => ErrorCode::IoError,
        };
        Self::with_internal(code, "An I/O error occurred", error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for ModulithError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ModulithError>() {
            Ok(inner) => inner,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for ModulithError {
    fn from(error: config::ConfigError) -> Self {
        let (code, msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
