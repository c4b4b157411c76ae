//! Server role.
//!
//! [`Server`] answers the client's `initialize` request, records what the
//! client declared, and offers typed helpers for the requests and
//! notifications a server sends. Everything else the server serves is
//! registered with [`Server::set_request_handler`].

use crate::capabilities::{Capabilities, Side};
use crate::error::{McpError, McpResult};
use crate::messages::{
    methods, CreateMessageParams, Implementation, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, LoggingMessageParams, ResourceUpdatedParams,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::protocol::{Protocol, ProtocolOptions, RequestExtra, RequestOptions, WeakProtocol};
use crate::transport::Transport;
use futures::future::FutureExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

type InitializedCallback = Arc<dyn Fn() + Send + Sync>;

/// Configuration options for the server role.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Capabilities this server declares in its `initialize` answer
    pub capabilities: Capabilities,

    /// Usage hints sent to the client
    pub instructions: Option<String>,

    /// Engine settings
    pub protocol: ProtocolOptions,
}

impl ServerOptions {
    /// Declare `capabilities`.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Send `instructions` to connecting clients.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Check client capabilities before every request.
    pub fn strict(mut self) -> Self {
        self.protocol.enforce_strict_capabilities = true;
        self
    }
}

struct ServerState {
    server_info: Implementation,
    instructions: Option<String>,
    client: RwLock<Option<InitializeParams>>,
    on_initialized: Mutex<Option<InitializedCallback>>,
}

impl ServerState {
    fn client(&self) -> Option<InitializeParams> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn initialized(&self) {
        let callback = self
            .on_initialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Server side of a connection.
#[derive(Clone)]
pub struct Server {
    protocol: Protocol,
    state: Arc<ServerState>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("server_info", &self.state.server_info)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl Server {
    /// Create a server identifying itself as `server_info`.
    pub fn new(server_info: Implementation, options: ServerOptions) -> Self {
        let protocol = Protocol::new(Side::Server, options.capabilities, options.protocol);
        let state = Arc::new(ServerState {
            server_info,
            instructions: options.instructions,
            client: RwLock::new(None),
            on_initialized: Mutex::new(None),
        });

        let weak = protocol.downgrade();
        let handler_state = Arc::clone(&state);
        protocol.set_request_handler_unchecked(
            methods::INITIALIZE,
            Arc::new(move |request, _extra| {
                let result = answer_initialize(&weak, &handler_state, &request);
                async move { result }.boxed()
            }),
        );

        for method in [
            methods::NOTIFICATION_INITIALIZED,
            methods::NOTIFICATION_INITIALIZED_LEGACY,
        ] {
            let state = Arc::clone(&state);
            protocol.set_notification_handler(method, move |_notification| {
                state.initialized();
                async { Ok(()) }
            });
        }

        Self { protocol, state }
    }

    /// The underlying engine.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Attach `transport` and start answering the client.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        info!(server = %self.state.server_info.name, "Server accepting connection");
        self.protocol.connect(transport).await
    }

    /// Close the connection.
    pub async fn close(&self) -> McpResult<()> {
        self.protocol.close().await
    }

    /// Run `callback` when the client reports the handshake complete.
    pub fn set_on_initialized<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .state
            .on_initialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Declare more capabilities. Only legal before connecting.
    pub fn register_capabilities(&self, capabilities: &Capabilities) -> McpResult<()> {
        self.protocol.register_capabilities(capabilities)
    }

    /// Capabilities this server declares.
    pub fn capabilities(&self) -> Capabilities {
        self.protocol.local_capabilities()
    }

    /// Capabilities the client declared, once it sent `initialize`.
    pub fn client_capabilities(&self) -> Option<Capabilities> {
        self.state.client().map(|client| client.capabilities)
    }

    /// Name and version of the client.
    pub fn client_version(&self) -> Option<Implementation> {
        self.state.client().map(|client| client.client_info)
    }

    /// Handle a client request. Fails if this server never declared the
    /// capability the method belongs to.
    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F) -> McpResult<()>
    where
        F: Fn(JsonRpcRequest, RequestExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<Value>> + Send + 'static,
    {
        self.protocol.set_request_handler(method, handler)
    }

    /// Handle a client notification.
    pub fn set_notification_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        self.protocol.set_notification_handler(method, handler)
    }

    /// Check that the client is alive.
    pub async fn ping(&self) -> McpResult<Value> {
        self.protocol
            .request(methods::PING, None, RequestOptions::new())
            .await
    }

    /// Ask the client to sample its language model.
    pub async fn create_message(
        &self,
        params: CreateMessageParams,
        options: RequestOptions,
    ) -> McpResult<Value> {
        self.protocol
            .request(
                methods::SAMPLING_CREATE_MESSAGE,
                Some(serde_json::to_value(params)?),
                options,
            )
            .await
    }

    /// Ask the client for its roots.
    pub async fn list_roots(&self) -> McpResult<Value> {
        self.protocol
            .request(methods::ROOTS_LIST, None, RequestOptions::new())
            .await
    }

    /// Send a log message. Needs the `logging` capability.
    pub async fn send_logging_message(&self, params: LoggingMessageParams) -> McpResult<()> {
        self.notify(methods::NOTIFICATION_MESSAGE, Some(serde_json::to_value(params)?))
            .await
    }

    /// Tell a subscribed client that `uri` changed. Needs the `resources`
    /// capability.
    pub async fn send_resource_updated(&self, uri: impl Into<String>) -> McpResult<()> {
        let params = serde_json::to_value(ResourceUpdatedParams::new(uri))?;
        self.notify(methods::NOTIFICATION_RESOURCES_UPDATED, Some(params))
            .await
    }

    /// Announce a changed resource list.
    pub async fn send_resource_list_changed(&self) -> McpResult<()> {
        self.notify(methods::NOTIFICATION_RESOURCES_LIST_CHANGED, None)
            .await
    }

    /// Announce a changed tool list.
    pub async fn send_tool_list_changed(&self) -> McpResult<()> {
        self.notify(methods::NOTIFICATION_TOOLS_LIST_CHANGED, None)
            .await
    }

    /// Announce a changed prompt list.
    pub async fn send_prompt_list_changed(&self) -> McpResult<()> {
        self.notify(methods::NOTIFICATION_PROMPTS_LIST_CHANGED, None)
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.protocol.notification(method, params).await
    }
}

/// Pick the version to answer with: the requested one when supported,
/// otherwise the latest.
pub fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|supported| *supported == requested)
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

fn answer_initialize(
    weak: &WeakProtocol,
    state: &ServerState,
    request: &JsonRpcRequest,
) -> McpResult<Value> {
    let protocol = weak
        .upgrade()
        .ok_or_else(|| McpError::internal("Server dropped while initializing"))?;
    let params: InitializeParams = request
        .params_as()
        .map_err(|e| McpError::invalid_params(format!("Invalid initialize params: {}", e)))?;

    let version = negotiate_version(&params.protocol_version);
    debug!(
        client = %params.client_info.name,
        requested = %params.protocol_version,
        selected = version,
        "Answering initialize"
    );

    protocol.set_peer_capabilities(params.capabilities.clone());
    *state.client.write().unwrap_or_else(PoisonError::into_inner) = Some(params);

    let mut result = InitializeResult::new(
        version,
        protocol.local_capabilities(),
        state.server_info.clone(),
    );
    result.instructions = state.instructions.clone();
    Ok(serde_json::to_value(result)?)
}
