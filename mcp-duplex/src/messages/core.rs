//! Core JSON-RPC 2.0 message structures.
//!
//! Every payload exchanged over a transport is one of three shapes:
//!
//! - **Request**: carries an `id` and a `method`; the peer must answer it
//! - **Response**: carries the `id` of a request and exactly one of
//!   `result` / `error`
//! - **Notification**: carries a `method` and no `id`; never answered
//!
//! Inbound payloads are classified by field presence, not by a tag:
//! no `method` means Response, `method` plus `id` means Request, `method`
//! alone means Notification. [`JsonRpcMessage::from_value`] applies that rule
//! and rejects responses that carry both or neither of `result`/`error`.
//!
//! # Examples
//!
//! ```rust
//! use mcp_duplex::messages::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, JsonRpcError};
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new(0, "tools/list", Some(json!({})));
//! let ok = JsonRpcResponse::success(0, json!({"tools": []}));
//! let err = JsonRpcResponse::error(1, JsonRpcError::method_not_found());
//!
//! let parsed = JsonRpcMessage::from_value(json!({"jsonrpc": "2.0", "method": "ping", "id": 3})).unwrap();
//! assert!(parsed.is_request());
//! ```

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::JSONRPC_VERSION;

/// Per-connection correlation identifier.
///
/// Allocated by the side that originates a request from a counter starting
/// at zero and never reused within one connection.
pub type RequestId = i64;

/// Numeric error codes used in error responses.
///
/// The standard JSON-RPC range plus two codes for failures synthesized
/// locally (connection loss and timeouts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The connection closed before the request completed
    ConnectionClosed,
    /// The request exceeded its caller-supplied timeout
    RequestTimeout,
    /// Invalid JSON was received
    ParseError,
    /// The JSON sent is not a valid request object
    InvalidRequest,
    /// The method does not exist or has no handler
    MethodNotFound,
    /// Invalid method parameters
    InvalidParams,
    /// Internal error while handling the request
    InternalError,
}

impl ErrorCode {
    /// The wire value of this code.
    pub const fn code(self) -> i32 {
        match self {
            ErrorCode::ConnectionClosed => -32000,
            ErrorCode::RequestTimeout => -32001,
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
        }
    }

    /// Look up a known code by its wire value.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32000 => Some(ErrorCode::ConnectionClosed),
            -32001 => Some(ErrorCode::RequestTimeout),
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            _ => None,
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Correlation identifier
    pub id: RequestId,

    /// Method name being invoked
    pub method: String,

    /// Parameters for the method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new request.
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Deserialize the parameters into a typed struct.
    ///
    /// Missing params deserialize as an empty object so structs whose fields
    /// are all optional still parse.
    ///
    /// ```rust
    /// use mcp_duplex::messages::JsonRpcRequest;
    /// use serde::Deserialize;
    /// use serde_json::json;
    ///
    /// #[derive(Deserialize)]
    /// struct ReadParams {
    ///     uri: String,
    /// }
    ///
    /// let request = JsonRpcRequest::new(4, "resources/read", Some(json!({"uri": "file:///a"})));
    /// let params: ReadParams = request.params_as().unwrap();
    /// assert_eq!(params.uri, "file:///a");
    /// ```
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        params_as(self.params.as_ref())
    }
}

/// JSON-RPC 2.0 response message.
///
/// Exactly one of `result` and `error` is present. The constructors uphold
/// that; inbound payloads are checked in [`JsonRpcMessage::from_value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// ID from the corresponding request
    pub id: RequestId,

    /// Success result (mutually exclusive with error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error result (mutually exclusive with result)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a successful response with the given result.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Check if this response represents a success.
    pub fn is_success(&self) -> bool {
        self.result.is_some() && self.error.is_none()
    }

    /// Split the response into its outcome.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Err(JsonRpcError::internal_error(
                "Response carried neither result nor error",
            )),
        }
    }
}

/// JSON-RPC 2.0 notification message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name being invoked
    pub method: String,

    /// Parameters for the method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// Deserialize the parameters into a typed struct.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        params_as(self.params.as_ref())
    }
}

fn params_as<T: DeserializeOwned>(params: Option<&Value>) -> Result<T, serde_json::Error> {
    match params {
        Some(params) => serde_json::from_value(params.clone()),
        None => serde_json::from_value(Value::Object(Map::new())),
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create a new error object.
    pub fn new(code: impl Into<i32>, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data,
        }
    }

    /// `MethodNotFound` with the standard message.
    pub fn method_not_found() -> Self {
        Self::new(ErrorCode::MethodNotFound, "Method not found", None)
    }

    /// `InvalidParams` with a custom message.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, None)
    }

    /// `InternalError` with a custom message.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, None)
    }

    /// The known error code, if this is one of the predefined codes.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{} {} {}", self.code, self.message, data),
            None => write!(f, "{} {}", self.code, self.message),
        }
    }
}

impl std::error::Error for JsonRpcError {}

/// Any message that can travel over a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Request expecting a response
    Request(JsonRpcRequest),
    /// Response to an earlier request
    Response(JsonRpcResponse),
    /// One-way notification
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Classify and decode a raw JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::InvalidJsonRpc {
                reason: "message is not a JSON object".to_string(),
            })?;

        let invalid = |e: serde_json::Error| ProtocolError::InvalidJsonRpc {
            reason: e.to_string(),
        };

        if !object.contains_key("method") {
            let has_result = object.contains_key("result");
            let has_error = object.contains_key("error");
            if has_result == has_error {
                return Err(ProtocolError::InvalidJsonRpc {
                    reason: "response must carry exactly one of result or error".to_string(),
                });
            }
            serde_json::from_value(value)
                .map(JsonRpcMessage::Response)
                .map_err(invalid)
        } else if object.contains_key("id") {
            serde_json::from_value(value)
                .map(JsonRpcMessage::Request)
                .map_err(invalid)
        } else {
            serde_json::from_value(value)
                .map(JsonRpcMessage::Notification)
                .map_err(invalid)
        }
    }

    /// Parse a JSON text into a message.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJsonRpc {
            reason: format!("Parse error: {}", e),
        })?;
        Self::from_value(value)
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(req) => Some(&req.method),
            JsonRpcMessage::Notification(notif) => Some(&notif.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    /// Correlation id for requests and responses.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            JsonRpcMessage::Request(req) => Some(req.id),
            JsonRpcMessage::Response(resp) => Some(resp.id),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    /// Whether this is a request.
    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    /// Whether this is a response.
    pub fn is_response(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_))
    }

    /// Whether this is a notification.
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Notification(_))
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcMessage::Request(req) => req.serialize(serializer),
            JsonRpcMessage::Response(resp) => resp.serialize(serializer),
            JsonRpcMessage::Notification(notif) => notif.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(request)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(response)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(notification)
    }
}
