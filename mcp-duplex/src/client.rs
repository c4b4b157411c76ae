//! Client role.
//!
//! [`Client`] wraps a [`Protocol`] and adds the client half of the
//! `initialize` handshake plus typed helpers for the requests a client sends.
//!
//! `connect` does the whole handshake: it attaches the transport, sends
//! `initialize`, checks that the server picked a protocol version this client
//! supports, records what the server declared, and finally sends
//! `notifications/initialized`. If any step fails the connection is closed
//! before the error is returned.
//!
//! ```rust,no_run
//! use mcp_duplex::client::{Client, ClientOptions};
//! use mcp_duplex::messages::{CallToolParams, Implementation};
//! use mcp_duplex::transport::sse_client::SseClientTransport;
//! use std::sync::Arc;
//!
//! # async fn demo() -> mcp_duplex::McpResult<()> {
//! let transport = SseClientTransport::connect_to("http://localhost:3000/sse".parse().unwrap())?;
//! let client = Client::new(Implementation::new("demo-client", "0.1.0"), ClientOptions::default());
//! let server = client.connect(Arc::new(transport)).await?;
//! println!("Connected to {} {}", server.server_info.name, server.server_info.version);
//!
//! let tools = client.list_tools(None).await?;
//! println!("{}", tools);
//! client.close().await
//! # }
//! ```

use crate::capabilities::{Capabilities, Side};
use crate::error::{McpError, McpResult, ProtocolError};
use crate::messages::{
    methods, CallToolParams, CompleteParams, GetPromptParams, Implementation, InitializeParams,
    InitializeResult, JsonRpcNotification, JsonRpcRequest, LoggingLevel, PaginatedParams,
    ReadResourceParams, SetLevelParams, SubscribeParams, LATEST_PROTOCOL_VERSION,
};
use crate::protocol::{Protocol, ProtocolOptions, RequestExtra, RequestOptions};
use crate::transport::Transport;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration options for the client role.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Capabilities this client declares in `initialize`
    pub capabilities: Capabilities,

    /// Protocol version requested in `initialize`
    pub protocol_version: String,

    /// Versions the server may answer with
    pub supported_versions: Vec<String>,

    /// Timeout for the `initialize` request (none by default)
    pub init_timeout: Option<Duration>,

    /// Engine settings
    pub protocol: ProtocolOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::new(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            supported_versions: vec![LATEST_PROTOCOL_VERSION.to_string()],
            init_timeout: None,
            protocol: ProtocolOptions::default(),
        }
    }
}

impl ClientOptions {
    /// Declare `capabilities`.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Request `version` and accept only that version back.
    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.supported_versions = vec![version.clone()];
        self.protocol_version = version;
        self
    }

    /// Accept any of `versions` from the server.
    pub fn supported_versions(mut self, versions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.supported_versions = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Bound the `initialize` request.
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = Some(timeout);
        self
    }

    /// Check server capabilities before every request.
    pub fn strict(mut self) -> Self {
        self.protocol.enforce_strict_capabilities = true;
        self
    }
}

/// Client side of a connection.
#[derive(Debug, Clone)]
pub struct Client {
    protocol: Protocol,
    client_info: Implementation,
    options: Arc<ClientOptions>,
    server: Arc<RwLock<Option<InitializeResult>>>,
}

impl Client {
    /// Create a client identifying itself as `client_info`.
    pub fn new(client_info: Implementation, options: ClientOptions) -> Self {
        let protocol = Protocol::new(
            Side::Client,
            options.capabilities.clone(),
            options.protocol.clone(),
        );
        let client = Self {
            protocol,
            client_info,
            options: Arc::new(options),
            server: Arc::new(RwLock::new(None)),
        };
        client.set_on_close(|| {});
        client
    }

    /// The underlying engine.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Attach `transport` and run the handshake.
    ///
    /// Returns what the server answered to `initialize`. On failure the
    /// transport has been closed again.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<InitializeResult> {
        info!(client = %self.client_info.name, "Connecting client");
        self.protocol.connect(transport).await?;
        self.forget_server();

        match self.initialize().await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(error = %e, "Handshake failed, closing connection");
                if let Err(close_error) = self.protocol.close().await {
                    debug!(error = %close_error, "Error while closing after failed handshake");
                }
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = InitializeParams::new(
            self.options.protocol_version.clone(),
            self.protocol.local_capabilities(),
            self.client_info.clone(),
        );
        let mut request_options = RequestOptions::new();
        if let Some(timeout) = self.options.init_timeout {
            request_options = request_options.timeout(timeout);
        }

        let value = self
            .protocol
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(params)?),
                request_options,
            )
            .await?;

        let result: InitializeResult =
            serde_json::from_value(value).map_err(|e| ProtocolError::InitializationFailed {
                reason: format!("Server sent invalid initialize result: {}", e),
            })?;

        if !self
            .options
            .supported_versions
            .contains(&result.protocol_version)
        {
            return Err(ProtocolError::UnsupportedVersion {
                version: result.protocol_version,
                supported: self.options.supported_versions.clone(),
            }
            .into());
        }

        self.protocol
            .set_peer_capabilities(result.capabilities.clone());
        *self.server.write().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());

        self.protocol
            .notification(methods::NOTIFICATION_INITIALIZED, None)
            .await?;

        info!(
            server = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "Client initialized"
        );
        Ok(result)
    }

    /// The server's answer to `initialize`, once the handshake completed.
    pub fn initialize_result(&self) -> Option<InitializeResult> {
        self.server
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Capabilities the server declared.
    pub fn server_capabilities(&self) -> Option<Capabilities> {
        self.initialize_result().map(|result| result.capabilities)
    }

    /// Name and version of the server.
    pub fn server_version(&self) -> Option<Implementation> {
        self.initialize_result().map(|result| result.server_info)
    }

    /// Protocol version the server selected.
    pub fn negotiated_version(&self) -> Option<String> {
        self.initialize_result().map(|result| result.protocol_version)
    }

    /// Usage hints the server sent, if any.
    pub fn instructions(&self) -> Option<String> {
        self.initialize_result().and_then(|result| result.instructions)
    }

    /// Close the connection. The server details learned in the handshake
    /// are forgotten.
    pub async fn close(&self) -> McpResult<()> {
        let result = self.protocol.close().await;
        self.forget_server();
        result
    }

    /// Run `callback` whenever the connection closes, after the server
    /// details have been forgotten.
    ///
    /// Use this rather than the engine's own close callback, which would
    /// replace the one that clears those details.
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let server = Arc::clone(&self.server);
        self.protocol.set_on_close(move || {
            *server.write().unwrap_or_else(PoisonError::into_inner) = None;
            callback();
        });
    }

    fn forget_server(&self) {
        *self.server.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Declare more capabilities. Only legal before connecting.
    pub fn register_capabilities(&self, capabilities: &Capabilities) -> McpResult<()> {
        self.protocol.register_capabilities(capabilities)
    }

    /// Handle a request the server sends, such as `sampling/createMessage`
    /// or `roots/list`. Fails if this client never declared the capability.
    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F) -> McpResult<()>
    where
        F: Fn(JsonRpcRequest, RequestExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<Value>> + Send + 'static,
    {
        self.protocol.set_request_handler(method, handler)
    }

    /// Handle a notification the server sends.
    pub fn set_notification_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        self.protocol.set_notification_handler(method, handler)
    }

    async fn call<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        let params = params.map(serde_json::to_value).transpose()?;
        self.protocol.request(method, params, options).await
    }

    /// Check that the server is alive.
    pub async fn ping(&self) -> McpResult<Value> {
        self.call::<Value>(methods::PING, None, RequestOptions::new())
            .await
    }

    /// Ask for argument completions.
    pub async fn complete(&self, params: CompleteParams) -> McpResult<Value> {
        self.call(methods::COMPLETION_COMPLETE, Some(params), RequestOptions::new())
            .await
    }

    /// Set the minimum level of log messages the server sends.
    pub async fn set_logging_level(&self, level: LoggingLevel) -> McpResult<Value> {
        self.call(
            methods::LOGGING_SET_LEVEL,
            Some(SetLevelParams { level }),
            RequestOptions::new(),
        )
        .await
    }

    /// Fetch a prompt.
    pub async fn get_prompt(&self, params: GetPromptParams) -> McpResult<Value> {
        self.call(methods::PROMPTS_GET, Some(params), RequestOptions::new())
            .await
    }

    /// List prompts, starting after `cursor`.
    pub async fn list_prompts(&self, cursor: Option<String>) -> McpResult<Value> {
        self.list(methods::PROMPTS_LIST, cursor).await
    }

    /// List resources, starting after `cursor`.
    pub async fn list_resources(&self, cursor: Option<String>) -> McpResult<Value> {
        self.list(methods::RESOURCES_LIST, cursor).await
    }

    /// List resource templates, starting after `cursor`.
    pub async fn list_resource_templates(&self, cursor: Option<String>) -> McpResult<Value> {
        self.list(methods::RESOURCES_TEMPLATES_LIST, cursor).await
    }

    /// Read one resource.
    pub async fn read_resource(&self, uri: impl Into<String>) -> McpResult<Value> {
        self.call(
            methods::RESOURCES_READ,
            Some(ReadResourceParams::new(uri)),
            RequestOptions::new(),
        )
        .await
    }

    /// Ask to be notified when a resource changes.
    pub async fn subscribe_resource(&self, uri: impl Into<String>) -> McpResult<Value> {
        self.call(
            methods::RESOURCES_SUBSCRIBE,
            Some(SubscribeParams::new(uri)),
            RequestOptions::new(),
        )
        .await
    }

    /// Stop notifications for a resource.
    pub async fn unsubscribe_resource(&self, uri: impl Into<String>) -> McpResult<Value> {
        self.call(
            methods::RESOURCES_UNSUBSCRIBE,
            Some(SubscribeParams::new(uri)),
            RequestOptions::new(),
        )
        .await
    }

    /// Invoke a tool. Use `options` for progress, cancellation, or a timeout.
    pub async fn call_tool(
        &self,
        params: CallToolParams,
        options: RequestOptions,
    ) -> McpResult<Value> {
        self.call(methods::TOOLS_CALL, Some(params), options).await
    }

    /// List tools, starting after `cursor`.
    pub async fn list_tools(&self, cursor: Option<String>) -> McpResult<Value> {
        self.list(methods::TOOLS_LIST, cursor).await
    }

    /// Tell the server the client's roots changed.
    pub async fn send_roots_list_changed(&self) -> McpResult<()> {
        self.protocol
            .notification(methods::NOTIFICATION_ROOTS_LIST_CHANGED, None)
            .await
    }

    async fn list(&self, method: &str, cursor: Option<String>) -> McpResult<Value> {
        let params = PaginatedParams { cursor };
        self.call(method, Some(params), RequestOptions::new()).await
    }
}

/// Whether `error` is the version rejection raised by [`Client::connect`].
pub fn is_unsupported_version(error: &McpError) -> bool {
    matches!(
        error,
        McpError::Protocol(ProtocolError::UnsupportedVersion { .. })
    )
}
