// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for the OPC UA adapter.
//!
//! Errors are grouped by how far they are allowed to travel:
//!
//! ```text
//! OpcUaError
//! ├── Configuration  - bad settings                     (fatal)
//! ├── Certificate    - application identity unusable    (fatal)
//! ├── Endpoint       - endpoint discovery/selection     (attempt-scoped)
//! ├── Session        - session handshake and lifecycle  (attempt-scoped)
//! ├── Browse         - address space traversal          (attempt-scoped)
//! ├── Subscription   - subscription/monitored items     (attempt-scoped)
//! ├── Timeout        - bounded operations               (attempt-scoped)
//! └── Conversion     - value to f64                     (per value)
//! ```
//!
//! Only fatal errors stop the adapter. Everything else ends the current
//! connection attempt and is retried by the supervisor or the outer loop.
//!
//! # Examples
//!
//! ```
//! use harvest_opcua::error::{EndpointError, OpcUaError};
//!
//! let error = OpcUaError::from(EndpointError::no_endpoints("opc.tcp://plc:4840"));
//! assert!(error.is_retryable());
//! assert!(!error.is_fatal());
//! ```

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::Level;

/// Result type alias for adapter operations.
pub type OpcUaResult<T> = Result<T, OpcUaError>;

// =============================================================================
// OpcUaError - Main Error Type
// =============================================================================

/// The main error type of the adapter.
#[derive(Debug, Error)]
pub enum OpcUaError {
    /// Invalid configuration.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Local application certificate problems.
    #[error("{0}")]
    Certificate(#[from] CertificateError),

    /// Endpoint discovery and selection failures.
    #[error("{0}")]
    Endpoint(#[from] EndpointError),

    /// Session creation and lifecycle failures.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Browse failures.
    #[error("{0}")]
    Browse(#[from] BrowseError),

    /// Subscription and monitored item failures.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// Value conversion failures.
    #[error("{0}")]
    Conversion(#[from] ConversionError),

    /// Bounded operation timed out.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),
}

impl OpcUaError {
    // =========================================================================
    // Convenience Factory Methods
    // =========================================================================

    /// Creates a session creation failure.
    pub fn session_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Session(SessionError::creation_failed(endpoint, message))
    }

    /// Creates a browse failure.
    pub fn browse_failed(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Browse(BrowseError::browse_failed(node_id, message))
    }

    /// Creates a subscription creation failure.
    pub fn subscription_failed(message: impl Into<String>) -> Self {
        Self::Subscription(SubscriptionError::creation_failed(message))
    }

    /// Creates an error for an operation on a closed session.
    pub fn not_connected() -> Self {
        Self::Session(SessionError::NotConnected)
    }

    // =========================================================================
    // Error Properties
    // =========================================================================

    /// Returns `true` if this error must stop the adapter.
    ///
    /// Fatal errors are never retried: the configuration or the local
    /// application identity has to be fixed first.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Certificate(_))
    }

    /// Returns `true` if a later connection attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(_) | Self::Certificate(_) | Self::Conversion(_) => false,
            Self::Endpoint(_) | Self::Browse(_) | Self::Timeout(_) => true,
            Self::Session(e) => e.is_retryable(),
            Self::Subscription(_) => true,
        }
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Configuration(_) | Self::Certificate(_) => ErrorSeverity::Critical,
            Self::Endpoint(_) | Self::Session(_) | Self::Subscription(_) => ErrorSeverity::Error,
            Self::Browse(_) | Self::Timeout(_) => ErrorSeverity::Warning,
            Self::Conversion(_) => ErrorSeverity::Warning,
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Certificate(_) => "certificate",
            Self::Endpoint(_) => "endpoint",
            Self::Session(_) => "session",
            Self::Browse(_) => "browse",
            Self::Subscription(_) => "subscription",
            Self::Conversion(_) => "conversion",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Returns a unique error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Configuration(e) => e.error_code(),
            Self::Certificate(e) => e.error_code(),
            Self::Endpoint(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::Browse(e) => e.error_code(),
            Self::Subscription(e) => e.error_code(),
            Self::Conversion(e) => e.error_code(),
            Self::Timeout(e) => e.error_code(),
        }
    }

    /// Returns recovery hints for operators.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Configuration(e) => e.recovery_hints(),
            Self::Certificate(e) => e.recovery_hints(),
            Self::Endpoint(e) => e.recovery_hints(),
            Self::Session(e) => e.recovery_hints(),
            Self::Browse(_) => vec![
                "Check that the session user may browse the Objects folder",
                "Retry the connection",
            ],
            Self::Subscription(_) => vec![
                "Check the server's subscription and monitored item limits",
                "The adapter will disconnect and retry",
            ],
            Self::Conversion(_) => vec!["Bind only numeric or boolean variables"],
            Self::Timeout(_) => vec![
                "Check network connectivity to the server",
                "Increase the configured timeout",
            ],
        }
    }

    /// Returns the tracing level for this error.
    pub fn tracing_level(&self) -> Level {
        self.severity().to_tracing_level()
    }

    /// Logs this error with appropriate level and context.
    pub fn log(&self, context: &str) {
        let code = self.error_code();

        match self.tracing_level() {
            Level::ERROR => tracing::error!(
                error_code = %code,
                category = self.category(),
                context = context,
                fatal = self.is_fatal(),
                retryable = self.is_retryable(),
                "{self}"
            ),
            Level::WARN => tracing::warn!(
                error_code = %code,
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
            _ => tracing::debug!(
                error_code = %code,
                category = self.category(),
                context = context,
                "{self}"
            ),
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Invalid adapter settings.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The connection string has no usable server address.
    #[error("Invalid connection string '{value}': {reason}")]
    InvalidConnectionString {
        /// The offending string.
        value: String,
        /// Reason.
        reason: String,
    },

    /// The server URL is malformed.
    #[error("Invalid server URL '{url}': {reason}")]
    InvalidServerUrl {
        /// The offending URL.
        url: String,
        /// Reason.
        reason: String,
    },

    /// A node identifier could not be parsed.
    #[error("Invalid node id '{node_id}': {reason}")]
    InvalidNodeId {
        /// The offending identifier.
        node_id: String,
        /// Reason.
        reason: String,
    },

    /// A setting has an invalid value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Reason.
        reason: String,
    },

    /// The adapter was started outside a Tokio runtime.
    #[error("No Tokio runtime available: {reason}")]
    NoRuntime {
        /// Reason.
        reason: String,
    },
}

impl ConfigurationError {
    /// Creates an invalid connection string error.
    pub fn invalid_connection_string(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConnectionString {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid server URL error.
    pub fn invalid_server_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidServerUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid node id error.
    pub fn invalid_node_id(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNodeId {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidConnectionString { .. } => ErrorCode::new(1, 1),
            Self::InvalidServerUrl { .. } => ErrorCode::new(1, 2),
            Self::InvalidNodeId { .. } => ErrorCode::new(1, 3),
            Self::InvalidValue { .. } => ErrorCode::new(1, 4),
            Self::NoRuntime { .. } => ErrorCode::new(1, 5),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::InvalidConnectionString { .. } => vec![
                "The first ';' separated field must be the server address",
                "Example: opc.tcp://plc01:4840;reserved",
            ],
            Self::InvalidServerUrl { .. } => vec!["Use format: opc.tcp://hostname:port/path"],
            Self::InvalidNodeId { .. } => vec!["Use format: ns=<index>;{i|s|g|b}=<identifier>"],
            Self::InvalidValue { .. } => vec!["Check the configuration file"],
            Self::NoRuntime { .. } => vec!["Start the adapter from within a Tokio runtime"],
        }
    }
}

// =============================================================================
// CertificateError
// =============================================================================

/// Which half of the application identity a certificate error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// The application instance certificate.
    Certificate,
    /// The matching private key.
    PrivateKey,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Certificate => f.write_str("certificate"),
            Self::PrivateKey => f.write_str("private key"),
        }
    }
}

/// The local application identity cannot be used.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// No path configured or file absent.
    #[error("Application instance certificate invalid! Missing {kind} at '{path}'")]
    Missing {
        /// Certificate or key.
        kind: CredentialKind,
        /// Expected location.
        path: PathBuf,
    },

    /// The file exists but could not be read.
    #[error("Application instance certificate invalid! Cannot read {kind} '{path}': {source}")]
    Unreadable {
        /// Certificate or key.
        kind: CredentialKind,
        /// File path.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: io::Error,
    },

    /// The file content is not a usable certificate or key.
    #[error("Application instance certificate invalid! Malformed {kind} '{path}': {reason}")]
    Malformed {
        /// Certificate or key.
        kind: CredentialKind,
        /// File path.
        path: PathBuf,
        /// Reason.
        reason: String,
    },
}

impl CertificateError {
    /// Creates a missing credential error.
    pub fn missing(kind: CredentialKind, path: impl Into<PathBuf>) -> Self {
        Self::Missing {
            kind,
            path: path.into(),
        }
    }

    /// Creates an unreadable credential error.
    pub fn unreadable(kind: CredentialKind, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Unreadable {
            kind,
            path: path.into(),
            source,
        }
    }

    /// Creates a malformed credential error.
    pub fn malformed(
        kind: CredentialKind,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Malformed {
            kind,
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns which credential the error refers to.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::Missing { kind, .. }
            | Self::Unreadable { kind, .. }
            | Self::Malformed { kind, .. } => *kind,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Missing { .. } => ErrorCode::new(2, 1),
            Self::Unreadable { .. } => ErrorCode::new(2, 2),
            Self::Malformed { .. } => ErrorCode::new(2, 3),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Missing { .. } => vec![
                "Configure application.certificate_path and application.private_key_path",
                "Place the application instance certificate in the PKI directory",
            ],
            Self::Unreadable { .. } => vec!["Check file permissions of the PKI directory"],
            Self::Malformed { .. } => vec![
                "The certificate must be DER or PEM (BEGIN CERTIFICATE)",
                "The private key must be DER or PEM (BEGIN PRIVATE KEY)",
            ],
        }
    }
}

// =============================================================================
// EndpointError
// =============================================================================

/// Endpoint discovery or selection failed.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The server advertised no endpoints.
    #[error("No endpoints advertised by '{url}'")]
    NoEndpoints {
        /// Server URL.
        url: String,
    },

    /// The discovery request failed.
    #[error("Endpoint discovery failed for '{url}': {message}")]
    DiscoveryFailed {
        /// Server URL.
        url: String,
        /// Error message.
        message: String,
    },

    /// The discovery request did not complete in time.
    #[error("Endpoint discovery for '{url}' timed out after {timeout:?}")]
    DiscoveryTimedOut {
        /// Server URL.
        url: String,
        /// Configured bound.
        timeout: Duration,
    },
}

impl EndpointError {
    /// Creates a no endpoints error.
    pub fn no_endpoints(url: impl Into<String>) -> Self {
        Self::NoEndpoints { url: url.into() }
    }

    /// Creates a discovery failure.
    pub fn discovery_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DiscoveryFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a discovery timeout.
    pub fn timed_out(url: impl Into<String>, timeout: Duration) -> Self {
        Self::DiscoveryTimedOut {
            url: url.into(),
            timeout,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NoEndpoints { .. } => ErrorCode::new(3, 1),
            Self::DiscoveryFailed { .. } => ErrorCode::new(3, 2),
            Self::DiscoveryTimedOut { .. } => ErrorCode::new(3, 3),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::NoEndpoints { .. } => vec![
                "Verify the server URL points at an OPC UA discovery endpoint",
                "Check the server's endpoint configuration",
            ],
            Self::DiscoveryFailed { .. } => vec![
                "Check if the OPC UA server is running",
                "Check firewall rules allow the connection",
            ],
            Self::DiscoveryTimedOut { .. } => vec![
                "Check network connectivity to the server",
                "Increase endpoint_discovery_timeout",
            ],
        }
    }
}

// =============================================================================
// SessionError
// =============================================================================

/// Session creation and lifecycle failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake, security or identity failure while creating the session.
    #[error("Session creation failed at '{endpoint}': {message}")]
    CreationFailed {
        /// Endpoint URL.
        endpoint: String,
        /// Error message.
        message: String,
    },

    /// The server certificate was untrusted and auto-accept is off.
    #[error("Server certificate rejected: {subject}")]
    CertificateRejected {
        /// Certificate subject.
        subject: String,
    },

    /// Re-establishing the session failed.
    #[error("Session reconnect failed: {message}")]
    ReconnectFailed {
        /// Error message.
        message: String,
    },

    /// The session is closed.
    #[error("Not connected to OPC UA server")]
    NotConnected,
}

impl SessionError {
    /// Creates a creation failure.
    pub fn creation_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CreationFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates a rejected certificate error.
    pub fn certificate_rejected(subject: impl Into<String>) -> Self {
        Self::CertificateRejected {
            subject: subject.into(),
        }
    }

    /// Creates a reconnect failure.
    pub fn reconnect_failed(message: impl Into<String>) -> Self {
        Self::ReconnectFailed {
            message: message.into(),
        }
    }

    /// Returns `true` if the failure may clear up on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::CertificateRejected { .. })
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CreationFailed { .. } => ErrorCode::new(4, 1),
            Self::CertificateRejected { .. } => ErrorCode::new(4, 2),
            Self::ReconnectFailed { .. } => ErrorCode::new(4, 3),
            Self::NotConnected => ErrorCode::new(4, 4),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::CreationFailed { .. } => vec![
                "Check that the server accepts anonymous sessions",
                "Check server logs for the rejection reason",
            ],
            Self::CertificateRejected { .. } => vec![
                "Copy the server certificate into the trusted store",
                "Or set auto_accept_untrusted_certificates for commissioning",
            ],
            Self::ReconnectFailed { .. } => vec!["The supervisor keeps retrying"],
            Self::NotConnected => vec!["Connect before using the session"],
        }
    }
}

// =============================================================================
// BrowseError
// =============================================================================

/// Browse failures.
#[derive(Debug, Error)]
pub enum BrowseError {
    /// The browse service call failed.
    #[error("Browse failed for node '{node_id}': {message}")]
    BrowseFailed {
        /// Node being browsed.
        node_id: String,
        /// Error message.
        message: String,
    },
}

impl BrowseError {
    /// Creates a browse failure.
    pub fn browse_failed(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BrowseFailed {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::BrowseFailed { .. } => ErrorCode::new(5, 1),
        }
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription and monitored item failures.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The server rejected the subscription.
    #[error("Subscription creation failed: {message}")]
    CreationFailed {
        /// Error message.
        message: String,
    },

    /// The server rejected the monitored item request.
    #[error("Creating {count} monitored items failed: {message}")]
    MonitoredItemsFailed {
        /// Items in the request.
        count: usize,
        /// Error message.
        message: String,
    },

    /// Deleting the subscription failed.
    #[error("Subscription {subscription_id} delete failed: {message}")]
    DeleteFailed {
        /// Server subscription id.
        subscription_id: u32,
        /// Error message.
        message: String,
    },
}

impl SubscriptionError {
    /// Creates a creation failure.
    pub fn creation_failed(message: impl Into<String>) -> Self {
        Self::CreationFailed {
            message: message.into(),
        }
    }

    /// Creates a monitored items failure.
    pub fn monitored_items_failed(count: usize, message: impl Into<String>) -> Self {
        Self::MonitoredItemsFailed {
            count,
            message: message.into(),
        }
    }

    /// Creates a delete failure.
    pub fn delete_failed(subscription_id: u32, message: impl Into<String>) -> Self {
        Self::DeleteFailed {
            subscription_id,
            message: message.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CreationFailed { .. } => ErrorCode::new(6, 1),
            Self::MonitoredItemsFailed { .. } => ErrorCode::new(6, 2),
            Self::DeleteFailed { .. } => ErrorCode::new(6, 3),
        }
    }
}

// =============================================================================
// ConversionError
// =============================================================================

/// A value could not be represented as `f64`.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The variant type has no numeric meaning.
    #[error("Cannot convert {type_name} value to floating point")]
    NotNumeric {
        /// Variant type name.
        type_name: &'static str,
    },

    /// A string value did not parse as a number.
    #[error("Cannot parse '{value}' as floating point")]
    Unparsable {
        /// The string value.
        value: String,
    },
}

impl ConversionError {
    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotNumeric { .. } => ErrorCode::new(7, 1),
            Self::Unparsable { .. } => ErrorCode::new(7, 2),
        }
    }
}

// =============================================================================
// TimeoutError
// =============================================================================

/// A bounded operation did not complete in time.
#[derive(Debug, Error)]
#[error("{operation} timed out after {duration:?}")]
pub struct TimeoutError {
    /// Operation name.
    pub operation: &'static str,
    /// Bound that elapsed.
    pub duration: Duration,
}

impl TimeoutError {
    /// Creates a timeout error.
    pub fn new(operation: &'static str, duration: Duration) -> Self {
        Self {
            operation,
            duration,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::new(8, 1)
    }
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational - no action required.
    Info,
    /// Warning - absorbed locally.
    Warning,
    /// Error - ends the current attempt, recoverable.
    Error,
    /// Critical - stops the adapter.
    Critical,
}

impl ErrorSeverity {
    /// Converts to tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ErrorCode
// =============================================================================

/// Structured error code, formatted as `UA-XXYY`.
///
/// Categories: 1 configuration, 2 certificate, 3 endpoint, 4 session,
/// 5 browse, 6 subscription, 7 conversion, 8 timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category.
    pub category: u8,
    /// Specific error within category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }

    /// Returns the full error code as a u16.
    pub fn as_u16(&self) -> u16 {
        ((self.category as u16) << 8) | (self.code as u16)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UA-{:02X}{:02X}", self.category, self.code)
    }
}

// =============================================================================
// Tests
// =============================================================================
