// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session orchestration error types.
//!
//! Every failure the orchestration layer can surface is a [`SessionError`].
//! Lifecycle failures escalate through the controller's state machine; per
//! element failures of one-shot services are reported as status codes and
//! never become a `SessionError` for the whole batch.
//!
//! # Error Categories
//!
//! ```text
//! SessionError
//! ├── Connection    - handshake / transport failure (retryable)
//! ├── Timeout       - no response within a deadline (retryable)
//! ├── Transfer      - durable transfer rejected (fresh connect fallback)
//! ├── Capacity      - server limits exceeded (surfaced, never retried)
//! ├── Fatal         - retry budget exhausted or protocol violation
//! ├── Browse        - address-space traversal failures
//! ├── Subscription  - subscription misuse (already active, stream taken)
//! ├── Operation     - service-level request failures
//! └── Configuration - invalid settings
//! ```
//!
//! # Examples
//!
//! ```
//! use uaconsole_session::error::{ConnectionError, SessionError};
//!
//! let error = SessionError::connection(ConnectionError::refused(
//!     "opc.tcp://localhost:62541",
//! ));
//!
//! assert!(error.is_retryable());
//! assert_eq!(error.error_code().to_string(), "UA-0101");
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::Level;

use crate::types::StatusCode;

// =============================================================================
// SessionError - Main Error Type
// =============================================================================

/// The main error type for session orchestration.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake or transport failure.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// No response within a deadline.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// Durable subscription transfer was rejected.
    #[error("{0}")]
    Transfer(#[from] TransferError),

    /// Server-advertised limits exceeded.
    #[error("{0}")]
    Capacity(#[from] CapacityError),

    /// The session cannot continue.
    #[error("{0}")]
    Fatal(#[from] FatalError),

    /// Address-space traversal failure.
    #[error("{0}")]
    Browse(#[from] BrowseError),

    /// Subscription misuse.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// Service-level request failure.
    #[error("{0}")]
    Operation(#[from] OperationError),

    /// Invalid configuration.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),
}

impl SessionError {
    // =========================================================================
    // Factory Methods
    // =========================================================================

    /// Creates a connection error.
    #[inline]
    pub fn connection(error: ConnectionError) -> Self {
        Self::Connection(error)
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(error: TimeoutError) -> Self {
        Self::Timeout(error)
    }

    /// Creates a transfer error.
    #[inline]
    pub fn transfer(error: TransferError) -> Self {
        Self::Transfer(error)
    }

    /// Creates a capacity error.
    #[inline]
    pub fn capacity(error: CapacityError) -> Self {
        Self::Capacity(error)
    }

    /// Creates a fatal error.
    #[inline]
    pub fn fatal(error: FatalError) -> Self {
        Self::Fatal(error)
    }

    /// Creates a browse error.
    #[inline]
    pub fn browse(error: BrowseError) -> Self {
        Self::Browse(error)
    }

    /// Creates a subscription error.
    #[inline]
    pub fn subscription(error: SubscriptionError) -> Self {
        Self::Subscription(error)
    }

    /// Creates an operation error.
    #[inline]
    pub fn operation(error: OperationError) -> Self {
        Self::Operation(error)
    }

    /// Creates a configuration error.
    #[inline]
    pub fn configuration(error: ConfigurationError) -> Self {
        Self::Configuration(error)
    }

    /// Creates a not connected error.
    pub fn not_connected() -> Self {
        Self::Connection(ConnectionError::NotConnected)
    }

    // =========================================================================
    // Error Properties
    // =========================================================================

    /// Returns `true` if the reconnect policy may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            Self::Timeout(_) => true,
            Self::Operation(e) => e.is_retryable(),
            Self::Browse(e) => e.is_retryable(),
            Self::Transfer(_)
            | Self::Capacity(_)
            | Self::Fatal(_)
            | Self::Subscription(_)
            | Self::Configuration(_) => false,
        }
    }

    /// Returns `true` if this error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Connection(e) => e.severity(),
            Self::Timeout(_) => ErrorSeverity::Warning,
            Self::Transfer(_) => ErrorSeverity::Warning,
            Self::Capacity(_) => ErrorSeverity::Error,
            Self::Fatal(_) => ErrorSeverity::Critical,
            Self::Browse(e) => e.severity(),
            Self::Subscription(_) => ErrorSeverity::Error,
            Self::Operation(_) => ErrorSeverity::Warning,
            Self::Configuration(_) => ErrorSeverity::Critical,
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Transfer(_) => "transfer",
            Self::Capacity(_) => "capacity",
            Self::Fatal(_) => "fatal",
            Self::Browse(_) => "browse",
            Self::Subscription(_) => "subscription",
            Self::Operation(_) => "operation",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Returns a unique error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection(e) => e.error_code(),
            Self::Timeout(e) => e.error_code(),
            Self::Transfer(e) => e.error_code(),
            Self::Capacity(e) => e.error_code(),
            Self::Fatal(e) => e.error_code(),
            Self::Browse(e) => e.error_code(),
            Self::Subscription(e) => e.error_code(),
            Self::Operation(e) => e.error_code(),
            Self::Configuration(e) => e.error_code(),
        }
    }

    /// Returns the OPC UA status code that best describes this error.
    ///
    /// Used when a whole service call fails and each element of the batch
    /// must still receive its own status.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Connection(ConnectionError::NotConnected) => StatusCode::BAD_NOT_CONNECTED,
            Self::Connection(ConnectionError::Closed { .. }) => StatusCode::BAD_SESSION_CLOSED,
            Self::Connection(_) => StatusCode::BAD_COMMUNICATION_ERROR,
            Self::Timeout(_) => StatusCode::BAD_TIMEOUT,
            Self::Capacity(_) => StatusCode::BAD_TOO_MANY_MONITORED_ITEMS,
            Self::Operation(OperationError::BadStatus { status, .. }) => *status,
            Self::Operation(OperationError::ServiceFault { status, .. }) => *status,
            Self::Browse(BrowseError::NodeNotFound { .. }) => StatusCode::BAD_NODE_ID_UNKNOWN,
            _ => StatusCode::BAD_UNEXPECTED_ERROR,
        }
    }

    /// Returns recovery hints for this error.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Connection(e) => e.recovery_hints(),
            Self::Timeout(_) => vec![
                "Check network connectivity to the server",
                "Increase the timeout value",
            ],
            Self::Transfer(_) => vec![
                "The server may have expired the subscription; a fresh subscription is created",
                "Increase the subscription lifetime count to survive longer outages",
            ],
            Self::Capacity(_) => vec![
                "Reduce the number of monitored items",
                "Lower the maximum number of sampled variables",
            ],
            Self::Fatal(_) => vec![
                "Check that the server is running and reachable",
                "Raise the reconnect attempt budget",
            ],
            Self::Browse(_) => vec!["Verify the starting node exists on the server"],
            Self::Subscription(SubscriptionError::MonitoringActive) => {
                vec!["Create the subscription before monitoring starts"]
            }
            Self::Subscription(_) => vec!["Delete the active subscription before creating another"],
            Self::Operation(_) => vec!["Inspect the per-element status codes"],
            Self::Configuration(e) => e.recovery_hints(),
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
                retryable = self.is_retryable(),
                "{self}"
            ),
        }
    }
}

// =============================================================================
// ConnectionError
// =============================================================================

/// Handshake and transport failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection refused by the endpoint.
    #[error("Connection refused to '{endpoint}'")]
    Refused {
        /// Target endpoint.
        endpoint: String,
    },

    /// Handshake rejected (certificate, security policy, identity).
    #[error("Handshake with '{endpoint}' rejected: {reason}")]
    HandshakeRejected {
        /// Target endpoint.
        endpoint: String,
        /// Rejection reason.
        reason: String,
    },

    /// No endpoint matches the requested security mode.
    #[error("No suitable endpoint found with security mode '{security_mode}'")]
    NoSuitableEndpoint {
        /// Required security mode.
        security_mode: String,
    },

    /// The channel was closed underneath us.
    #[error("Channel closed: {reason}")]
    Closed {
        /// Reason for closure.
        reason: String,
    },

    /// No keep-alive or data arrived within the keep-alive window.
    #[error("No keep-alive for subscription {subscription} within {silence:?}")]
    KeepAliveTimeout {
        /// Local subscription identifier.
        subscription: String,
        /// How long the subscription was silent.
        silence: Duration,
    },

    /// No channel is open.
    #[error("Not connected to an OPC UA server")]
    NotConnected,

    /// Transport-level failure reported by the underlying stack.
    #[error("Transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
    },
}

impl ConnectionError {
    /// Creates a connection refused error.
    pub fn refused(endpoint: impl Into<String>) -> Self {
        Self::Refused {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a handshake rejected error.
    pub fn handshake_rejected(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HandshakeRejected {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Creates a no suitable endpoint error.
    pub fn no_suitable_endpoint(security_mode: impl Into<String>) -> Self {
        Self::NoSuitableEndpoint {
            security_mode: security_mode.into(),
        }
    }

    /// Creates a channel closed error.
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }

    /// Creates a keep-alive timeout error.
    pub fn keep_alive_timeout(subscription: impl fmt::Display, silence: Duration) -> Self {
        Self::KeepAliveTimeout {
            subscription: subscription.to_string(),
            silence,
        }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Refused { .. }
            | Self::Closed { .. }
            | Self::KeepAliveTimeout { .. }
            | Self::NotConnected
            | Self::Transport { .. } => true,
            Self::HandshakeRejected { .. } | Self::NoSuitableEndpoint { .. } => false,
        }
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NotConnected | Self::Closed { .. } | Self::KeepAliveTimeout { .. } => {
                ErrorSeverity::Warning
            }
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Refused { .. } => ErrorCode::new(1, 1),
            Self::HandshakeRejected { .. } => ErrorCode::new(1, 2),
            Self::NoSuitableEndpoint { .. } => ErrorCode::new(1, 3),
            Self::Closed { .. } => ErrorCode::new(1, 4),
            Self::KeepAliveTimeout { .. } => ErrorCode::new(1, 5),
            Self::NotConnected => ErrorCode::new(1, 6),
            Self::Transport { .. } => ErrorCode::new(1, 7),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Refused { .. } => vec![
                "Check if the OPC UA server is running",
                "Verify the endpoint URL is correct",
            ],
            Self::HandshakeRejected { .. } => vec![
                "Check that the server trusts the client certificate",
                "Try connecting without security for testing",
            ],
            Self::NoSuitableEndpoint { .. } => {
                vec!["Check available security modes on the server"]
            }
            Self::Closed { .. } | Self::KeepAliveTimeout { .. } => {
                vec!["The session reconnects automatically"]
            }
            Self::NotConnected => vec!["Call connect() before performing operations"],
            Self::Transport { .. } => vec!["Check network connectivity", "Retry the operation"],
        }
    }
}

// =============================================================================
// TimeoutError
// =============================================================================

/// Deadline expiry errors.
#[derive(Debug, Error)]
pub enum TimeoutError {
    /// No response to a connection attempt.
    #[error("Connection to '{endpoint}' timed out after {duration:?}")]
    Connection {
        /// Target endpoint.
        endpoint: String,
        /// Time allowed.
        duration: Duration,
    },

    /// No response to a service request.
    #[error("Request '{service}' timed out after {duration:?}")]
    Request {
        /// Service name.
        service: String,
        /// Time allowed.
        duration: Duration,
    },
}

impl TimeoutError {
    /// Creates a connection timeout.
    pub fn connection(endpoint: impl Into<String>, duration: Duration) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            duration,
        }
    }

    /// Creates a request timeout.
    pub fn request(service: impl Into<String>, duration: Duration) -> Self {
        Self::Request {
            service: service.into(),
            duration,
        }
    }

    /// Returns the deadline that expired.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Connection { duration, .. } | Self::Request { duration, .. } => *duration,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection { .. } => ErrorCode::new(2, 1),
            Self::Request { .. } => ErrorCode::new(2, 2),
        }
    }
}

// =============================================================================
// TransferError
// =============================================================================

/// Durable subscription transfer failures.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The server rejected the transfer.
    #[error("Transfer of subscription {subscription_id} rejected: {status}")]
    Rejected {
        /// Server subscription identifier.
        subscription_id: u32,
        /// Status returned by the server.
        status: StatusCode,
    },

    /// The server no longer knows the subscription.
    #[error("Subscription {subscription_id} no longer exists on the server")]
    NotFound {
        /// Server subscription identifier.
        subscription_id: u32,
    },

    /// The transport cannot transfer subscriptions.
    #[error("Subscription transfer not supported by {transport}")]
    Unsupported {
        /// Transport name.
        transport: String,
    },

    /// Nothing to transfer.
    #[error("No persisted subscription to transfer")]
    NothingToTransfer,
}

impl TransferError {
    /// Creates a rejected transfer error.
    pub fn rejected(subscription_id: u32, status: StatusCode) -> Self {
        Self::Rejected {
            subscription_id,
            status,
        }
    }

    /// Creates a not found transfer error.
    pub fn not_found(subscription_id: u32) -> Self {
        Self::NotFound { subscription_id }
    }

    /// Creates an unsupported transfer error.
    pub fn unsupported(transport: impl Into<String>) -> Self {
        Self::Unsupported {
            transport: transport.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Rejected { .. } => ErrorCode::new(3, 1),
            Self::NotFound { .. } => ErrorCode::new(3, 2),
            Self::Unsupported { .. } => ErrorCode::new(3, 3),
            Self::NothingToTransfer => ErrorCode::new(3, 4),
        }
    }
}

// =============================================================================
// CapacityError
// =============================================================================

/// Server limits exceeded.
#[derive(Debug, Error)]
pub enum CapacityError {
    /// Too many monitored items for one subscription.
    #[error("Too many monitored items: {count} requested, server allows {max}")]
    TooManyMonitoredItems {
        /// Requested count.
        count: usize,
        /// Server limit.
        max: usize,
    },

    /// The server refused to create another subscription.
    #[error("Server refused subscription: {status}")]
    TooManySubscriptions {
        /// Status returned by the server.
        status: StatusCode,
    },
}

impl CapacityError {
    /// Creates a too many monitored items error.
    pub fn too_many_monitored_items(count: usize, max: usize) -> Self {
        Self::TooManyMonitoredItems { count, max }
    }

    /// Creates a too many subscriptions error.
    pub fn too_many_subscriptions(status: StatusCode) -> Self {
        Self::TooManySubscriptions { status }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::TooManyMonitoredItems { .. } => ErrorCode::new(4, 1),
            Self::TooManySubscriptions { .. } => ErrorCode::new(4, 2),
        }
    }
}

// =============================================================================
// FatalError
// =============================================================================

/// Unrecoverable session failures.
#[derive(Debug, Error)]
pub enum FatalError {
    /// Every reconnect attempt failed.
    #[error("Reconnect gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Message of the last failure.
        last_error: String,
    },

    /// The server or the caller broke the session protocol.
    #[error("Protocol violation: {message}")]
    ProtocolViolation {
        /// Description.
        message: String,
    },
}

impl FatalError {
    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32, last_error: impl fmt::Display) -> Self {
        Self::RetriesExhausted {
            attempts,
            last_error: last_error.to_string(),
        }
    }

    /// Creates a protocol violation error.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::RetriesExhausted { .. } => ErrorCode::new(5, 1),
            Self::ProtocolViolation { .. } => ErrorCode::new(5, 2),
        }
    }
}

// =============================================================================
// BrowseError
// =============================================================================

/// Address-space traversal errors.
#[derive(Debug, Error)]
pub enum BrowseError {
    /// The starting node does not exist.
    #[error("Node not found: {node_id}")]
    NodeNotFound {
        /// Node ID.
        node_id: String,
    },

    /// A browse round trip failed as a whole.
    #[error("Browse failed for {node_count} node(s): {message}")]
    BrowseFailed {
        /// Number of parents in the failed request.
        node_count: usize,
        /// Error message.
        message: String,
    },

    /// The node cache snapshot is unavailable.
    #[error("Node cache unavailable: {message}")]
    CacheUnavailable {
        /// Error message.
        message: String,
    },
}

impl BrowseError {
    /// Creates a node not found error.
    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::NodeNotFound {
            node_id: node_id.into(),
        }
    }

    /// Creates a browse failed error.
    pub fn browse_failed(node_count: usize, message: impl Into<String>) -> Self {
        Self::BrowseFailed {
            node_count,
            message: message.into(),
        }
    }

    /// Creates a cache unavailable error.
    pub fn cache_unavailable(message: impl Into<String>) -> Self {
        Self::CacheUnavailable {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BrowseFailed { .. })
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NodeNotFound { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NodeNotFound { .. } => ErrorCode::new(6, 1),
            Self::BrowseFailed { .. } => ErrorCode::new(6, 2),
            Self::CacheUnavailable { .. } => ErrorCode::new(6, 3),
        }
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription misuse errors.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// A subscription is already live on this session.
    #[error("Subscription {existing} is already active")]
    AlreadyActive {
        /// The active subscription.
        existing: String,
    },

    /// The subscription is not known to the manager.
    #[error("Subscription not found: {subscription}")]
    NotFound {
        /// Subscription identifier.
        subscription: String,
    },

    /// The notification stream was already handed out.
    #[error("Notification stream for {subscription} was already taken")]
    StreamTaken {
        /// Subscription identifier.
        subscription: String,
    },

    /// The subscription spec is not usable.
    #[error("Invalid subscription spec: {reason}")]
    InvalidSpec {
        /// Reason.
        reason: String,
    },

    /// The server failed to create the subscription.
    #[error("Failed to create subscription: {message}")]
    CreationFailed {
        /// Error message.
        message: String,
    },

    /// A monitoring phase owns the notification stream.
    #[error("Cannot subscribe while monitoring is running")]
    MonitoringActive,
}

impl SubscriptionError {
    /// Creates an already active error.
    pub fn already_active(existing: impl fmt::Display) -> Self {
        Self::AlreadyActive {
            existing: existing.to_string(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(subscription: impl fmt::Display) -> Self {
        Self::NotFound {
            subscription: subscription.to_string(),
        }
    }

    /// Creates a stream taken error.
    pub fn stream_taken(subscription: impl fmt::Display) -> Self {
        Self::StreamTaken {
            subscription: subscription.to_string(),
        }
    }

    /// Creates an invalid spec error.
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// Creates a creation failed error.
    pub fn creation_failed(message: impl Into<String>) -> Self {
        Self::CreationFailed {
            message: message.into(),
        }
    }

    /// Creates a monitoring active error.
    pub fn monitoring_active() -> Self {
        Self::MonitoringActive
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::AlreadyActive { .. } => ErrorCode::new(7, 1),
            Self::NotFound { .. } => ErrorCode::new(7, 2),
            Self::StreamTaken { .. } => ErrorCode::new(7, 3),
            Self::InvalidSpec { .. } => ErrorCode::new(7, 4),
            Self::CreationFailed { .. } => ErrorCode::new(7, 5),
            Self::MonitoringActive => ErrorCode::new(7, 6),
        }
    }
}

// =============================================================================
// OperationError
// =============================================================================

/// Service request failures.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The whole service call failed.
    #[error("Service '{service}' failed: {status}")]
    ServiceFault {
        /// Service name.
        service: String,
        /// Status returned by the server.
        status: StatusCode,
    },

    /// A single node reported a bad status.
    #[error("Bad status {status} for node '{node_id}'")]
    BadStatus {
        /// Node ID.
        node_id: String,
        /// Status code.
        status: StatusCode,
    },
}

impl OperationError {
    /// Creates a service fault error.
    pub fn service_fault(service: impl Into<String>, status: StatusCode) -> Self {
        Self::ServiceFault {
            service: service.into(),
            status,
        }
    }

    /// Creates a bad status error.
    pub fn bad_status(node_id: impl Into<String>, status: StatusCode) -> Self {
        Self::BadStatus {
            node_id: node_id.into(),
            status,
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ServiceFault { status, .. } => {
                *status == StatusCode::BAD_TIMEOUT
                    || *status == StatusCode::BAD_COMMUNICATION_ERROR
            }
            Self::BadStatus { .. } => false,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::ServiceFault { .. } => ErrorCode::new(8, 1),
            Self::BadStatus { .. } => ErrorCode::new(8, 2),
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Invalid endpoint URL.
    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidEndpoint {
        /// The invalid URL.
        url: String,
        /// Reason.
        reason: String,
    },

    /// Invalid node ID format.
    #[error("Invalid node ID '{node_id}': {reason}")]
    InvalidNodeId {
        /// The invalid node ID.
        node_id: String,
        /// Reason.
        reason: String,
    },

    /// Invalid value for a setting.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Setting name.
        field: String,
        /// Reason.
        reason: String,
    },
}

impl ConfigurationError {
    /// Creates an invalid endpoint error.
    pub fn invalid_endpoint(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid node ID error.
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
            Self::InvalidEndpoint { .. } => ErrorCode::new(9, 1),
            Self::InvalidNodeId { .. } => ErrorCode::new(9, 2),
            Self::InvalidValue { .. } => ErrorCode::new(9, 3),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::InvalidEndpoint { .. } => vec!["Use format: opc.tcp://hostname:port/path"],
            Self::InvalidNodeId { .. } => vec!["Use format: ns=<index>;{i|s|g|b}=<identifier>"],
            Self::InvalidValue { .. } => vec!["Check the command line options"],
        }
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
    /// Warning - action may be required.
    Warning,
    /// Error - action required, but recoverable.
    Error,
    /// Critical - the session cannot continue.
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

/// Structured error code.
///
/// Format: `UA-XXYY` where XX is the category and YY the specific error.
///
/// Categories:
/// - 1: Connection
/// - 2: Timeout
/// - 3: Transfer
/// - 4: Capacity
/// - 5: Fatal
/// - 6: Browse
/// - 7: Subscription
/// - 8: Operation
/// - 9: Configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category (1-9).
    pub category: u8,
    /// Specific error within category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UA-{:02X}{:02X}", self.category, self.code)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A Result type with SessionError.
pub type SessionResult<T> = Result<T, SessionError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_retryability() {
        assert!(SessionError::from(ConnectionError::refused("opc.tcp://x")).is_retryable());
        assert!(SessionError::from(TimeoutError::connection("opc.tcp://x", Duration::from_secs(1)))
            .is_retryable());
        assert!(!SessionError::from(TransferError::not_found(7)).is_retryable());
        assert!(!SessionError::from(CapacityError::too_many_monitored_items(2000, 1000))
            .is_retryable());
        assert!(!SessionError::from(FatalError::retries_exhausted(5, "refused")).is_retryable());
        assert!(!SessionError::from(ConnectionError::handshake_rejected("opc.tcp://x", "cert"))
            .is_retryable());
    }

    #[test]
    fn test_error_codes() {
        let err = SessionError::from(CapacityError::too_many_monitored_items(2000, 1000));
        assert_eq!(err.error_code().to_string(), "UA-0401");
        assert_eq!(err.category(), "capacity");

        let err = SessionError::from(FatalError::retries_exhausted(3, "refused"));
        assert_eq!(err.error_code().to_string(), "UA-0501");
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            SessionError::not_connected().status_code(),
            StatusCode::BAD_NOT_CONNECTED
        );
        assert_eq!(
            SessionError::from(TimeoutError::request("Read", Duration::from_secs(1))).status_code(),
            StatusCode::BAD_TIMEOUT
        );
    }

    #[test]
    fn test_display() {
        let err = CapacityError::too_many_monitored_items(2500, 1000);
        assert_eq!(
            err.to_string(),
            "Too many monitored items: 2500 requested, server allows 1000"
        );

        let err = FatalError::retries_exhausted(5, "Connection refused to 'opc.tcp://x'");
        assert!(err.to_string().contains("after 5 attempts"));
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(ErrorSeverity::Warning.to_tracing_level(), Level::WARN);
        assert_eq!(ErrorSeverity::Critical.to_tracing_level(), Level::ERROR);
        assert!(ErrorSeverity::Critical > ErrorSeverity::Warning);
    }
}
