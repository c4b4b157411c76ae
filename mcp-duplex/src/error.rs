//! Error types for the duplex protocol engine.
//!
//! Errors are grouped by the layer that produced them:
//! - **Transport**: the carrier failed to open, send, or stay open
//! - **Protocol**: malformed messages, unknown ids, failed handshakes, errors
//!   answered by the peer
//! - **Validation**: a capability contract was violated
//! - **Config**: configuration files or values are unusable
//!
//! Cancellation, timeouts, and connection loss get their own variants because
//! callers routinely match on them.

use crate::messages::ErrorCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// The main error type for all engine operations.
///
/// # Examples
///
/// ```rust
/// use mcp_duplex::error::{McpError, TransportError};
///
/// let error = McpError::Transport(TransportError::NotConnected {
///     transport_type: "sse-client".to_string(),
///     reason: "endpoint not received".to_string(),
/// });
///
/// println!("Error: {}", error);
/// ```
#[derive(Error, Debug)]
pub enum McpError {
    /// Transport-related errors (connection, communication, etc.)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-level errors (invalid messages, peer errors, handshake failures)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Capability contract violations
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration errors (invalid config files, missing parameters, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The request was cancelled before a response arrived
    #[error("Request cancelled: {reason}")]
    Cancelled {
        /// Reason given when the request was cancelled
        reason: String,
    },

    /// The operation exceeded its time budget
    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// The timeout duration in milliseconds
        duration_ms: u64,
    },

    /// The connection closed while the operation was outstanding
    #[error("Connection closed")]
    ConnectionClosed,

    /// Serialization/deserialization errors
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        /// The underlying serde_json error
        source: serde_json::Error,
    },

    /// IO errors (file operations, sockets, etc.)
    #[error("IO error: {source}")]
    Io {
        #[from]
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Generic errors for cases not covered by specific variants
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

/// Transport-specific errors.
#[derive(Error, Debug, Clone)]
#[allow(missing_docs)]
pub enum TransportError {
    /// Failed to open the underlying channel
    #[error("Failed to connect via {transport_type}: {reason}")]
    ConnectionFailed {
        transport_type: String,
        reason: String,
    },

    /// `start()` was called a second time
    #[error("{transport_type} transport already started")]
    AlreadyStarted { transport_type: String },

    /// The event sink was installed a second time
    #[error("{transport_type} transport is already attached to a protocol engine")]
    AlreadyAttached { transport_type: String },

    /// The channel is not open for sending
    #[error("Not connected ({transport_type}): {reason}")]
    NotConnected {
        transport_type: String,
        reason: String,
    },

    /// Failed to hand a message to the carrier
    #[error("Failed to send message via {transport_type}: {reason}")]
    SendFailed {
        transport_type: String,
        reason: String,
    },

    /// A non-success HTTP status came back
    #[error("HTTP error: {status_code} - {reason}")]
    HttpError { status_code: u16, reason: String },

    /// The push channel failed or produced a malformed event
    #[error("SSE error: {reason}")]
    SseError { reason: String },

    /// The announced endpoint points at a different origin than the stream
    #[error("Endpoint origin does not match connection origin: {endpoint_origin}")]
    OriginMismatch {
        endpoint_origin: String,
        connection_origin: String,
    },

    /// The carrier was configured with unusable parameters
    #[error("Invalid {transport_type} configuration: {reason}")]
    InvalidConfig {
        transport_type: String,
        reason: String,
    },
}

/// Protocol-level errors.
#[derive(Error, Debug, Clone)]
#[allow(missing_docs)]
pub enum ProtocolError {
    /// Inbound payload is not a well-formed JSON-RPC message
    #[error("Invalid JSON-RPC message: {reason}")]
    InvalidJsonRpc { reason: String },

    /// A response arrived for an id with no pending request
    #[error("Received a response for an unknown message ID: {id}")]
    UnknownResponseId { id: i64 },

    /// A progress notification named a token with no registered callback
    #[error("Received a progress notification for an unknown token: {token}")]
    UnknownProgressToken { token: String },

    /// The peer (or a local handler) answered with an error object
    #[error("{code} {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// The peer selected a protocol version this side does not speak
    #[error("Unsupported protocol version: {version}, supported versions: {supported:?}")]
    UnsupportedVersion {
        version: String,
        supported: Vec<String>,
    },

    /// The initialize exchange produced an unusable result
    #[error("Protocol initialization failed: {reason}")]
    InitializationFailed { reason: String },

    /// Operation is only legal in a different lifecycle state
    #[error("Protocol state violation: {reason}")]
    StateViolation { reason: String },
}

/// Capability contract violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ValidationError {
    /// The named role never declared the capability a method needs
    #[error("{role} does not support {capability} (required for {method})")]
    MissingCapability {
        role: String,
        capability: String,
        method: String,
    },
}

/// Configuration-related errors.
#[derive(Error, Debug, Clone)]
#[allow(missing_docs)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration file has invalid format
    #[error("Invalid configuration format in {path}: {reason}")]
    InvalidFormat { path: String, reason: String },

    /// Required configuration parameter is missing
    #[error("Missing required configuration parameter: {parameter}")]
    MissingParameter { parameter: String },

    /// Configuration parameter has invalid value
    #[error("Invalid value for parameter '{parameter}': {value} - {reason}")]
    InvalidValue {
        parameter: String,
        value: String,
        reason: String,
    },
}

/// Convenience type alias for Results using McpError.
pub type McpResult<T> = Result<T, McpError>;

impl McpError {
    /// Create a new internal error with a custom message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a new timeout error.
    ///
    /// ```rust
    /// use mcp_duplex::error::McpError;
    /// use std::time::Duration;
    ///
    /// let error = McpError::timeout("tools/call", Duration::from_secs(30));
    /// assert_eq!(error.code(), -32001);
    /// ```
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create an error that is answered to the peer with an explicit code.
    pub fn rpc(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::Remote {
            code: code.code(),
            message: message.into(),
            data: None,
        })
    }

    /// Shorthand for an `InvalidParams` error, the usual answer to params
    /// that fail to deserialize inside a handler.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::rpc(ErrorCode::InvalidParams, message)
    }

    /// The JSON-RPC error code this error is reported with.
    ///
    /// Errors that carry a code keep it; everything else collapses to
    /// `InternalError`.
    pub fn code(&self) -> i32 {
        match self {
            McpError::Protocol(ProtocolError::Remote { code, .. }) => *code,
            McpError::Protocol(ProtocolError::InvalidJsonRpc { .. }) => {
                ErrorCode::InvalidRequest.code()
            }
            McpError::Serialization { .. } => ErrorCode::ParseError.code(),
            McpError::ConnectionClosed => ErrorCode::ConnectionClosed.code(),
            McpError::Timeout { .. } => ErrorCode::RequestTimeout.code(),
            _ => ErrorCode::InternalError.code(),
        }
    }

    /// Message used when this error is answered to a peer.
    ///
    /// Remote errors are passed through without the code prefix so a relayed
    /// error does not accumulate codes.
    pub fn rpc_message(&self) -> String {
        match self {
            McpError::Protocol(ProtocolError::Remote { message, .. }) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Extra data attached to a remote error, if any.
    pub fn rpc_data(&self) -> Option<Value> {
        match self {
            McpError::Protocol(ProtocolError::Remote { data, .. }) => data.clone(),
            _ => None,
        }
    }

    /// Whether this is the bulk failure produced when the connection dropped.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, McpError::ConnectionClosed)
    }

    /// Get the error category for this error.
    pub fn category(&self) -> &'static str {
        match self {
            McpError::Transport(_) => "transport",
            McpError::Protocol(_) => "protocol",
            McpError::Validation(_) => "validation",
            McpError::Config(_) => "config",
            McpError::Cancelled { .. } => "cancelled",
            McpError::Timeout { .. } => "timeout",
            McpError::ConnectionClosed => "connection",
            McpError::Serialization { .. } => "serialization",
            McpError::Io { .. } => "io",
            McpError::Internal { .. } => "internal",
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            McpError::Transport(TransportError::ConnectionFailed {
                transport_type: "sse-client".to_string(),
                reason: err.to_string(),
            })
        } else if let Some(status) = err.status() {
            McpError::Transport(TransportError::HttpError {
                status_code: status.as_u16(),
                reason: err.to_string(),
            })
        } else {
            McpError::Transport(TransportError::SendFailed {
                transport_type: "sse-client".to_string(),
                reason: err.to_string(),
            })
        }
    }
}

impl From<url::ParseError> for McpError {
    fn from(err: url::ParseError) -> Self {
        McpError::Config(ConfigError::InvalidValue {
            parameter: "url".to_string(),
            value: err.to_string(),
            reason: "Invalid URL format".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = McpError::timeout("test operation", Duration::from_secs(30));
        assert_eq!(
            error.to_string(),
            "Operation timed out after 30000ms: test operation"
        );

        let missing = ValidationError::MissingCapability {
            role: "Server".to_string(),
            capability: "tools".to_string(),
            method: "tools/call".to_string(),
        };
        assert_eq!(
            missing.to_string(),
            "Server does not support tools (required for tools/call)"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(McpError::ConnectionClosed.code(), -32000);
        assert_eq!(
            McpError::timeout("x", Duration::from_millis(5)).code(),
            -32001
        );
        assert_eq!(McpError::internal("boom").code(), -32603);
        assert_eq!(McpError::invalid_params("bad").code(), -32602);

        let remote = McpError::Protocol(ProtocolError::Remote {
            code: 42,
            message: "custom".to_string(),
            data: Some(serde_json::json!({"detail": true})),
        });
        assert_eq!(remote.code(), 42);
        assert_eq!(remote.rpc_message(), "custom");
        assert!(remote.rpc_data().is_some());
    }

    #[test]
    fn test_remote_error_display_carries_code() {
        let remote = ProtocolError::Remote {
            code: -32601,
            message: "Method not found".to_string(),
            data: None,
        };
        assert_eq!(remote.to_string(), "-32601 Method not found");
    }

    #[test]
    fn test_error_categories() {
        let cancelled = McpError::Cancelled {
            reason: "user".to_string(),
        };
        assert_eq!(cancelled.category(), "cancelled");
        assert_eq!(McpError::ConnectionClosed.category(), "connection");

        let transport_error = McpError::Transport(TransportError::AlreadyStarted {
            transport_type: "sse-server".to_string(),
        });
        assert_eq!(transport_error.category(), "transport");
    }
}
