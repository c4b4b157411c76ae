//! The protocol engine shared by the client and server roles.
//!
//! A [`Protocol`] owns one transport at a time. It numbers outbound requests,
//! correlates responses by id, routes progress notifications to the caller
//! that asked for them, dispatches inbound requests and notifications to
//! registered handlers, and propagates cancellation in both directions.
//!
//! # Concurrency
//!
//! Inbound events are consumed by a single dispatch task. Handlers are looked
//! up and invoked in arrival order, but the futures they return are spawned,
//! so a slow handler never holds up unrelated messages. Callers of
//! [`Protocol::request`] suspend only on their own response.
//!
//! # Connection loss
//!
//! When the transport reports that it closed, or [`Protocol::close`] is
//! called, every pending request fails with [`McpError::ConnectionClosed`],
//! every in-flight handler sees its cancellation token fire, and the close
//! callback runs exactly once.
//!
//! ```rust,no_run
//! use mcp_duplex::capabilities::{Capabilities, Side};
//! use mcp_duplex::protocol::{Protocol, ProtocolOptions, RequestOptions};
//! use mcp_duplex::transport::memory::MemoryTransport;
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> mcp_duplex::McpResult<()> {
//! let (left, right) = MemoryTransport::pair();
//! let a = Protocol::new(Side::Client, Capabilities::new(), ProtocolOptions::default());
//! let b = Protocol::new(Side::Server, Capabilities::new(), ProtocolOptions::default());
//! b.set_request_handler("echo", |request, _extra| async move {
//!     Ok(request.params.unwrap_or(json!({})))
//! })?;
//! b.connect(Arc::new(right)).await?;
//! a.connect(Arc::new(left)).await?;
//!
//! let result = a
//!     .request(
//!         "echo",
//!         Some(json!({"hello": "world"})),
//!         RequestOptions::new().timeout(Duration::from_secs(5)),
//!     )
//!     .await?;
//! assert_eq!(result, json!({"hello": "world"}));
//! # Ok(())
//! # }
//! ```

use crate::capabilities::{
    assert_capability_for_method, assert_notification_capability,
    assert_request_handler_capability, Capabilities, Side,
};
use crate::error::{McpError, McpResult, ProtocolError, TransportError};
use crate::messages::{
    methods, CancelledParams, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, Progress, ProgressParams, RequestId,
};
use crate::transport::config::read_config_file;
use crate::transport::{EventReceiver, Transport, TransportEvent};
use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Handler for an inbound request.
pub type RequestHandler =
    Arc<dyn Fn(JsonRpcRequest, RequestExtra) -> BoxFuture<'static, McpResult<Value>> + Send + Sync>;

/// Handler for an inbound notification.
pub type NotificationHandler =
    Arc<dyn Fn(JsonRpcNotification) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;

/// Receives progress updates for one outbound request.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

type CloseCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&McpError) + Send + Sync>;

/// Context handed to every request handler.
#[derive(Debug, Clone)]
pub struct RequestExtra {
    /// Fires when the peer cancels this request or the connection closes
    pub cancellation: CancellationToken,

    /// Session id of the transport the request arrived on, if it has one
    pub session_id: Option<String>,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolOptions {
    /// Check the peer's declared capabilities before every outbound request
    /// instead of letting the peer answer `MethodNotFound`.
    pub enforce_strict_capabilities: bool,
}

impl ProtocolOptions {
    /// Options with strict capability checks enabled.
    pub fn strict() -> Self {
        Self {
            enforce_strict_capabilities: true,
        }
    }

    /// Load options from a `.json`, `.yaml`/`.yml`, or `.toml` file.
    /// Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> McpResult<Self> {
        read_config_file(path.as_ref())
    }
}

/// Per-request settings for [`Protocol::request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    on_progress: Option<ProgressCallback>,
    cancellation: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl RequestOptions {
    /// No progress callback, no cancellation, no timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the peer for progress updates and deliver them to `callback`.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Cancel the request when `token` fires.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Give up, and tell the peer, after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("on_progress", &self.on_progress.is_some())
            .field("cancellation", &self.cancellation)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Default)]
struct State {
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
    pending: HashMap<RequestId, oneshot::Sender<McpResult<Value>>>,
    progress: HashMap<RequestId, ProgressCallback>,
    /// Outbound ids given up locally; a late response for one is dropped.
    cancelled: RecentIds,
    /// Inbound requests whose handlers are still running.
    in_flight: HashMap<RequestId, CancellationToken>,
}

/// How many locally cancelled ids are remembered for late responses.
const CANCELLED_HISTORY: usize = 256;

/// The most recent [`CANCELLED_HISTORY`] ids, oldest evicted first.
#[derive(Default)]
struct RecentIds {
    order: VecDeque<RequestId>,
    ids: HashSet<RequestId>,
}

impl RecentIds {
    fn insert(&mut self, id: RequestId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > CANCELLED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &RequestId) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.order.retain(|kept| kept != id);
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Default)]
struct Handlers {
    requests: HashMap<String, RequestHandler>,
    notifications: HashMap<String, NotificationHandler>,
    fallback_request: Option<RequestHandler>,
    fallback_notification: Option<NotificationHandler>,
}

#[derive(Default)]
struct Callbacks {
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
}

struct Inner {
    side: Side,
    options: ProtocolOptions,
    next_id: AtomicI64,
    state: Mutex<State>,
    handlers: Mutex<Handlers>,
    local_capabilities: Mutex<Capabilities>,
    peer_capabilities: Mutex<Option<Capabilities>>,
    callbacks: Mutex<Callbacks>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_connected() -> McpError {
    TransportError::NotConnected {
        transport_type: "protocol".to_string(),
        reason: "Not connected".to_string(),
    }
    .into()
}

/// Bidirectional JSON-RPC engine.
///
/// Cloning is cheap and yields another handle to the same engine.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("side", &self.inner.side)
            .field("options", &self.inner.options)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Protocol {
    /// Create an engine for `side` declaring `capabilities`.
    ///
    /// `ping`, `notifications/cancelled`, and `notifications/progress` are
    /// handled out of the box; `ping` may be overridden.
    pub fn new(side: Side, capabilities: Capabilities, options: ProtocolOptions) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let mut handlers = Handlers::default();

            handlers.requests.insert(
                methods::PING.to_string(),
                Arc::new(|_request: JsonRpcRequest, _extra: RequestExtra| {
                    future::ready(Ok::<_, McpError>(json!({}))).boxed()
                }),
            );

            let cancel_target = weak.clone();
            handlers.notifications.insert(
                methods::NOTIFICATION_CANCELLED.to_string(),
                Arc::new(move |notification: JsonRpcNotification| {
                    let outcome = match notification.params_as::<CancelledParams>() {
                        Ok(params) => {
                            if let Some(inner) = cancel_target.upgrade() {
                                inner.cancel_inbound(&params);
                            }
                            Ok(())
                        }
                        Err(e) => Err(McpError::invalid_params(format!(
                            "Invalid cancellation notice: {}",
                            e
                        ))),
                    };
                    future::ready(outcome).boxed()
                }),
            );

            let progress_target = weak.clone();
            handlers.notifications.insert(
                methods::NOTIFICATION_PROGRESS.to_string(),
                Arc::new(move |notification: JsonRpcNotification| {
                    let outcome = match notification.params_as::<ProgressParams>() {
                        Ok(params) => {
                            if let Some(inner) = progress_target.upgrade() {
                                inner.deliver_progress(params);
                            }
                            Ok(())
                        }
                        Err(e) => Err(McpError::invalid_params(format!(
                            "Invalid progress notification: {}",
                            e
                        ))),
                    };
                    future::ready(outcome).boxed()
                }),
            );

            Inner {
                side,
                options,
                next_id: AtomicI64::new(0),
                state: Mutex::new(State::default()),
                handlers: Mutex::new(handlers),
                local_capabilities: Mutex::new(capabilities),
                peer_capabilities: Mutex::new(None),
                callbacks: Mutex::new(Callbacks::default()),
            }
        });

        Self { inner }
    }

    /// Which role this engine plays.
    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// Engine-wide settings.
    pub fn options(&self) -> &ProtocolOptions {
        &self.inner.options
    }

    /// Attach `transport` and start it.
    ///
    /// Fails if a transport is already attached, if the transport refuses the
    /// event sink, or if it fails to start. A transport that failed to start
    /// is detached again without running the close callback. Events it emits
    /// while starting are queued and dispatched once the start succeeds.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        let generation = {
            let mut state = lock(&self.inner.state);
            if state.transport.is_some() {
                return Err(ProtocolError::StateViolation {
                    reason: "Already connected to a transport".to_string(),
                }
                .into());
            }
            state.generation += 1;
            state.transport = Some(Arc::clone(&transport));
            state.generation
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = transport.attach(events_tx) {
            self.inner.detach(generation);
            return Err(e);
        }

        if let Err(e) = transport.start().await {
            self.inner.detach(generation);
            return Err(e);
        }

        tokio::spawn(run_dispatch(
            Arc::downgrade(&self.inner),
            events_rx,
            generation,
        ));

        debug!(side = %self.inner.side, "Protocol connected");
        Ok(())
    }

    /// Whether a transport is attached.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).transport.is_some()
    }

    /// The attached transport, if any.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport()
    }

    /// Close the attached transport and fail everything pending.
    ///
    /// Closing an engine with no transport is a no-op.
    pub async fn close(&self) -> McpResult<()> {
        let (transport, generation) = {
            let state = lock(&self.inner.state);
            match &state.transport {
                Some(transport) => (Arc::clone(transport), state.generation),
                None => return Ok(()),
            }
        };

        let result = transport.close().await;
        self.inner.handle_close(generation);
        result
    }

    /// Send a request and wait for its response.
    ///
    /// Settles with the peer's result, the peer's error as
    /// [`ProtocolError::Remote`], [`McpError::Cancelled`],
    /// [`McpError::Timeout`], or [`McpError::ConnectionClosed`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        let inner = &self.inner;
        let transport = inner.transport().ok_or_else(not_connected)?;

        if inner.options.enforce_strict_capabilities {
            let peer = inner.peer_capabilities().unwrap_or_default();
            assert_capability_for_method(method, &peer, inner.side.peer())?;
        }

        let RequestOptions {
            on_progress,
            cancellation,
            timeout,
        } = options;
        let cancellation = cancellation.unwrap_or_default();
        if cancellation.is_cancelled() {
            return Err(McpError::Cancelled {
                reason: "Request cancelled before it was sent".to_string(),
            });
        }

        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (response_tx, response_rx) = oneshot::channel();
        let mut params = params;
        {
            let mut state = lock(&inner.state);
            state.pending.insert(id, response_tx);
            if let Some(callback) = on_progress {
                state.progress.insert(id, callback);
                params = Some(with_progress_token(params, id));
            }
        }
        let _guard = PendingGuard {
            inner: inner.as_ref(),
            id,
        };

        trace!(side = %inner.side, id, method, "Sending request");
        transport
            .send(JsonRpcRequest::new(id, method, params).into())
            .await?;

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            response = response_rx => response.unwrap_or(Err(McpError::ConnectionClosed)),
            _ = cancellation.cancelled() => {
                let reason = "Request cancelled".to_string();
                inner.cancel_outbound(&transport, id, &reason).await;
                Err(McpError::Cancelled { reason })
            }
            _ = deadline => {
                let error = McpError::timeout(method, timeout.unwrap_or_default());
                inner.cancel_outbound(&transport, id, &error.to_string()).await;
                Err(error)
            }
        }
    }

    /// Send a notification.
    ///
    /// Fails when no transport is attached or when this side never declared
    /// the capability the notification belongs to.
    pub async fn notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let transport = self.inner.transport().ok_or_else(not_connected)?;
        assert_notification_capability(method, &self.local_capabilities(), self.inner.side)?;
        transport
            .send(JsonRpcNotification::new(method, params).into())
            .await
    }

    /// Register the handler for `method`, replacing any previous one.
    ///
    /// Fails if this side never declared the capability `method` belongs to.
    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F) -> McpResult<()>
    where
        F: Fn(JsonRpcRequest, RequestExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<Value>> + Send + 'static,
    {
        assert_request_handler_capability(method, &self.local_capabilities(), self.inner.side)?;
        self.set_request_handler_unchecked(
            method,
            Arc::new(move |request, extra| handler(request, extra).boxed()),
        );
        Ok(())
    }

    /// Register a handler without the capability check. Used by the roles
    /// for the handshake methods they always answer.
    pub(crate) fn set_request_handler_unchecked(&self, method: &str, handler: RequestHandler) {
        lock(&self.inner.handlers)
            .requests
            .insert(method.to_string(), handler);
    }

    /// Forget the handler for `method`. Returns whether one was registered.
    pub fn remove_request_handler(&self, method: &str) -> bool {
        lock(&self.inner.handlers).requests.remove(method).is_some()
    }

    /// Handle requests that have no specific handler.
    pub fn set_fallback_request_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(JsonRpcRequest, RequestExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<Value>> + Send + 'static,
    {
        lock(&self.inner.handlers).fallback_request =
            Some(Arc::new(move |request, extra| handler(request, extra).boxed()));
    }

    /// Register the handler for notification `method`, replacing any
    /// previous one.
    pub fn set_notification_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        lock(&self.inner.handlers).notifications.insert(
            method.to_string(),
            Arc::new(move |notification| handler(notification).boxed()),
        );
    }

    /// Forget the handler for notification `method`.
    pub fn remove_notification_handler(&self, method: &str) -> bool {
        lock(&self.inner.handlers)
            .notifications
            .remove(method)
            .is_some()
    }

    /// Handle notifications that have no specific handler.
    pub fn set_fallback_notification_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        lock(&self.inner.handlers).fallback_notification =
            Some(Arc::new(move |notification| handler(notification).boxed()));
    }

    /// Run `callback` once whenever the connection closes.
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).on_close = Some(Arc::new(callback));
    }

    /// Run `callback` for every non-fatal error the engine or its transport
    /// reports.
    pub fn set_on_error<F>(&self, callback: F)
    where
        F: Fn(&McpError) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).on_error = Some(Arc::new(callback));
    }

    /// Widen this side's capabilities. Only legal before connecting.
    pub fn register_capabilities(&self, capabilities: &Capabilities) -> McpResult<()> {
        if self.is_connected() {
            return Err(ProtocolError::StateViolation {
                reason: "Cannot register capabilities after connecting to transport".to_string(),
            }
            .into());
        }
        lock(&self.inner.local_capabilities).merge(capabilities);
        Ok(())
    }

    /// Capabilities this side declared.
    pub fn local_capabilities(&self) -> Capabilities {
        lock(&self.inner.local_capabilities).clone()
    }

    /// Capabilities the peer declared during the handshake, once known.
    pub fn peer_capabilities(&self) -> Option<Capabilities> {
        self.inner.peer_capabilities()
    }

    pub(crate) fn set_peer_capabilities(&self, capabilities: Capabilities) {
        *lock(&self.inner.peer_capabilities) = Some(capabilities);
    }

    /// Handle that does not keep the engine alive. Handlers stored inside
    /// the engine capture this instead of a [`Protocol`].
    pub(crate) fn downgrade(&self) -> WeakProtocol {
        WeakProtocol(Arc::downgrade(&self.inner))
    }
}

#[derive(Clone)]
pub(crate) struct WeakProtocol(Weak<Inner>);

impl WeakProtocol {
    pub(crate) fn upgrade(&self) -> Option<Protocol> {
        self.0.upgrade().map(|inner| Protocol { inner })
    }
}

/// Removes the bookkeeping of a request however its wait ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        state.pending.remove(&self.id);
        state.progress.remove(&self.id);
    }
}

/// Add `_meta.progressToken` to the params, keeping whatever else is there.
fn with_progress_token(params: Option<Value>, token: RequestId) -> Value {
    let mut object = match params {
        Some(Value::Object(object)) => object,
        _ => Map::new(),
    };
    let meta = object
        .entry("_meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Value::Object(meta) = meta {
        meta.insert("progressToken".to_string(), json!(token));
    }
    Value::Object(object)
}

async fn run_dispatch(inner: Weak<Inner>, mut events: EventReceiver, generation: u64) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(message) => inner.dispatch(message),
            TransportEvent::Error(error) => inner.report_error(error),
            TransportEvent::Closed => {
                inner.handle_close(generation);
                return;
            }
        }
    }

    // The transport dropped its sender without saying goodbye.
    if let Some(inner) = inner.upgrade() {
        inner.handle_close(generation);
    }
}

impl Inner {
    fn transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.state).transport.clone()
    }

    fn peer_capabilities(&self) -> Option<Capabilities> {
        lock(&self.peer_capabilities).clone()
    }

    fn dispatch(self: &Arc<Self>, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(response) => self.on_response(response),
            JsonRpcMessage::Request(request) => self.on_request(request),
            JsonRpcMessage::Notification(notification) => self.on_notification(notification),
        }
    }

    fn on_response(&self, response: JsonRpcResponse) {
        let id = response.id;
        let sender = {
            let mut state = lock(&self.state);
            state.progress.remove(&id);
            match state.pending.remove(&id) {
                Some(sender) => sender,
                None => {
                    let cancelled = state.cancelled.remove(&id);
                    drop(state);
                    if cancelled {
                        debug!(side = %self.side, id, "Dropping late response to cancelled request");
                    } else {
                        self.report_error(ProtocolError::UnknownResponseId { id }.into());
                    }
                    return;
                }
            }
        };

        let outcome = response.into_result().map_err(|error| {
            McpError::from(ProtocolError::Remote {
                code: error.code,
                message: error.message,
                data: error.data,
            })
        });
        // The caller may have stopped waiting in the meantime.
        let _ = sender.send(outcome);
    }

    fn on_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let Some(transport) = self.transport() else {
            return;
        };
        let id = request.id;
        let handler = {
            let handlers = lock(&self.handlers);
            handlers
                .requests
                .get(&request.method)
                .cloned()
                .or_else(|| handlers.fallback_request.clone())
        };

        let weak = Arc::downgrade(self);
        let Some(handler) = handler else {
            debug!(side = %self.side, id, method = %request.method, "No handler for request");
            tokio::spawn(async move {
                let response = JsonRpcResponse::error(id, JsonRpcError::method_not_found());
                if let Err(e) = transport.send(response.into()).await {
                    if let Some(inner) = weak.upgrade() {
                        inner.report_error(e);
                    }
                }
            });
            return;
        };

        let token = CancellationToken::new();
        lock(&self.state).in_flight.insert(id, token.clone());
        let extra = RequestExtra {
            cancellation: token.clone(),
            session_id: transport.session_id(),
        };
        trace!(side = %self.side, id, method = %request.method, "Dispatching request");
        let handling = handler(request, extra);

        tokio::spawn(async move {
            let outcome = handling.await;
            let inner = weak.upgrade();
            if let Some(inner) = &inner {
                lock(&inner.state).in_flight.remove(&id);
            }

            if token.is_cancelled() {
                debug!(id, "Request was cancelled, discarding its response");
                return;
            }

            let response = match outcome {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(
                    id,
                    JsonRpcError::new(e.code(), e.rpc_message(), e.rpc_data()),
                ),
            };
            if let Err(e) = transport.send(response.into()).await {
                if let Some(inner) = inner {
                    inner.report_error(e);
                }
            }
        });
    }

    fn on_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        let handler = {
            let handlers = lock(&self.handlers);
            handlers
                .notifications
                .get(&notification.method)
                .cloned()
                .or_else(|| handlers.fallback_notification.clone())
        };
        let Some(handler) = handler else {
            trace!(side = %self.side, method = %notification.method, "Ignoring notification");
            return;
        };

        let handling = handler(notification);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Err(e) = handling.await {
                if let Some(inner) = weak.upgrade() {
                    inner.report_error(McpError::internal(format!(
                        "Uncaught error in notification handler: {}",
                        e
                    )));
                }
            }
        });
    }

    fn cancel_inbound(&self, params: &CancelledParams) {
        let token = lock(&self.state).in_flight.get(&params.request_id).cloned();
        match token {
            Some(token) => {
                debug!(
                    side = %self.side,
                    id = params.request_id,
                    reason = ?params.reason,
                    "Peer cancelled request"
                );
                token.cancel();
            }
            None => trace!(id = params.request_id, "Cancellation for a request no longer running"),
        }
    }

    fn deliver_progress(&self, params: ProgressParams) {
        let callback = lock(&self.state)
            .progress
            .get(&params.progress_token)
            .cloned();
        match callback {
            Some(callback) => callback(params.progress),
            None => self.report_error(
                ProtocolError::UnknownProgressToken {
                    token: params.progress_token.to_string(),
                }
                .into(),
            ),
        }
    }

    async fn cancel_outbound(&self, transport: &Arc<dyn Transport>, id: RequestId, reason: &str) {
        {
            let mut state = lock(&self.state);
            state.pending.remove(&id);
            state.progress.remove(&id);
            state.cancelled.insert(id);
        }

        let params = CancelledParams {
            request_id: id,
            reason: Some(reason.to_string()),
        };
        let notice = match serde_json::to_value(&params) {
            Ok(params) => JsonRpcNotification::new(methods::NOTIFICATION_CANCELLED, Some(params)),
            Err(e) => {
                warn!(id, error = %e, "Failed to encode cancellation notice");
                return;
            }
        };
        if let Err(e) = transport.send(notice.into()).await {
            warn!(side = %self.side, id, error = %e, "Failed to send cancellation notice");
        }
    }

    /// Forget a transport that never started; no close callback.
    fn detach(&self, generation: u64) {
        let mut state = lock(&self.state);
        if state.generation == generation {
            state.transport = None;
        }
    }

    fn handle_close(&self, generation: u64) {
        let pending = {
            let mut state = lock(&self.state);
            if state.generation != generation || state.transport.is_none() {
                return;
            }
            state.transport = None;
            state.progress.clear();
            state.cancelled.clear();
            for (_, token) in state.in_flight.drain() {
                token.cancel();
            }
            std::mem::take(&mut state.pending)
        };

        debug!(side = %self.side, pending = pending.len(), "Connection closed");
        let on_close = lock(&self.callbacks).on_close.clone();
        if let Some(on_close) = on_close {
            on_close();
        }
        for (_, sender) in pending {
            let _ = sender.send(Err(McpError::ConnectionClosed));
        }
    }

    fn report_error(&self, error: McpError) {
        warn!(side = %self.side, category = error.category(), error = %error, "Protocol error");
        let on_error = lock(&self.callbacks).on_error.clone();
        if let Some(on_error) = on_error {
            on_error(&error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{EventSender, EventSink, TransportInfo};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Transport that records what the engine sends and lets the test inject
    /// inbound messages.
    struct ScriptedTransport {
        sink: EventSink,
        sent: Mutex<Vec<JsonRpcMessage>>,
        sent_tx: mpsc::UnboundedSender<JsonRpcMessage>,
        closes: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<JsonRpcMessage>) {
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                sink: EventSink::new("scripted"),
                sent: Mutex::new(Vec::new()),
                sent_tx,
                closes: AtomicUsize::new(0),
            });
            (transport, sent_rx)
        }

        fn inject(&self, message: impl Into<JsonRpcMessage>) {
            self.sink.message(message.into());
        }

        fn sent_with_method(&self, method: &str) -> usize {
            lock(&self.sent)
                .iter()
                .filter(|message| message.method() == Some(method))
                .count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn attach(&self, events: EventSender) -> McpResult<()> {
            self.sink.install(events)
        }

        async fn start(&self) -> McpResult<()> {
            Ok(())
        }

        async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
            lock(&self.sent).push(message.clone());
            let _ = self.sent_tx.send(message);
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.sink.closed();
            Ok(())
        }

        fn info(&self) -> TransportInfo {
            self.sink.info()
        }
    }

    fn engine(side: Side, capabilities: Capabilities) -> Protocol {
        Protocol::new(side, capabilities, ProtocolOptions::default())
    }

    async fn next_request(sent: &mut mpsc::UnboundedReceiver<JsonRpcMessage>) -> JsonRpcRequest {
        match sent.recv().await {
            Some(JsonRpcMessage::Request(request)) => request,
            other => panic!("expected a request, got {:?}", other),
        }
    }

    async fn connected_pair(server: &Protocol) -> Protocol {
        let (left, right) = MemoryTransport::pair();
        server.connect(Arc::new(right)).await.unwrap();
        let client = engine(Side::Client, Capabilities::new());
        client.connect(Arc::new(left)).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let protocol = engine(Side::Client, Capabilities::new());
        let (transport, mut sent) = ScriptedTransport::new();
        protocol.connect(transport.clone()).await.unwrap();

        let calls: Vec<_> = (0..3)
            .map(|n| {
                let protocol = protocol.clone();
                tokio::spawn(async move {
                    protocol
                        .request("echo", Some(json!({ "n": n })), RequestOptions::new())
                        .await
                })
            })
            .collect();

        let mut by_n = HashMap::new();
        for _ in 0..3 {
            let request = next_request(&mut sent).await;
            by_n.insert(request.params.unwrap()["n"].as_i64().unwrap(), request.id);
        }
        let mut ids: Vec<_> = by_n.values().copied().collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);

        for n in [2, 0, 1] {
            transport.inject(JsonRpcResponse::success(by_n[&n], json!({ "n": n })));
        }

        for (n, call) in calls.into_iter().enumerate() {
            let result = call.await.unwrap().unwrap();
            assert_eq!(result, json!({ "n": n }));
        }
    }

    #[tokio::test]
    async fn test_cancel_sends_one_notice_and_ignores_late_response() {
        let protocol = engine(Side::Client, Capabilities::new());
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        protocol.set_on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (transport, mut sent) = ScriptedTransport::new();
        protocol.connect(transport.clone()).await.unwrap();

        let token = CancellationToken::new();
        let call = {
            let protocol = protocol.clone();
            let token = token.clone();
            tokio::spawn(async move {
                protocol
                    .request("slow", None, RequestOptions::new().cancellation(token))
                    .await
            })
        };

        let request = next_request(&mut sent).await;
        token.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Cancelled { .. }));

        match sent.recv().await {
            Some(JsonRpcMessage::Notification(notice)) => {
                assert_eq!(notice.method, methods::NOTIFICATION_CANCELLED);
                let params: CancelledParams = notice.params_as().unwrap();
                assert_eq!(params.request_id, request.id);
            }
            other => panic!("expected cancellation notice, got {:?}", other),
        }

        transport.inject(JsonRpcResponse::success(request.id, json!({"late": true})));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(transport.sent_with_method(methods::NOTIFICATION_CANCELLED), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_reported() {
        let protocol = engine(Side::Client, Capabilities::new());
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        protocol.set_on_error(move |error| {
            let _ = error_tx.send(error.to_string());
        });
        let (transport, _sent) = ScriptedTransport::new();
        protocol.connect(transport.clone()).await.unwrap();

        transport.inject(JsonRpcResponse::success(99, json!({})));
        let message = error_rx.recv().await.unwrap();
        assert!(message.contains("unknown message ID: 99"));
        assert!(protocol.is_connected());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_fires_callback_once() {
        let protocol = engine(Side::Client, Capabilities::new());
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        protocol.set_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (transport, mut sent) = ScriptedTransport::new();
        protocol.connect(transport.clone()).await.unwrap();

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let protocol = protocol.clone();
                tokio::spawn(async move { protocol.request("wait", None, RequestOptions::new()).await })
            })
            .collect();
        for _ in 0..3 {
            next_request(&mut sent).await;
        }

        protocol.close().await.unwrap();
        protocol.close().await.unwrap();

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(err.is_connection_closed());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn test_request_requires_connection() {
        let protocol = engine(Side::Client, Capabilities::new());
        let err = protocol
            .request("ping", None, RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            McpError::Transport(TransportError::NotConnected { .. })
        ));
        assert!(protocol.notification("notifications/initialized", None).await.is_err());
    }

    #[test]
    fn test_handler_registration_checks_local_capabilities() {
        let protocol = engine(Side::Server, Capabilities::new());
        let err = protocol
            .set_request_handler("tools/call", |_request, _extra| async { Ok(json!({})) })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: Server does not support tools (required for tools/call)"
        );

        let protocol = engine(Side::Server, Capabilities::new().with("tools", json!({})));
        assert!(protocol
            .set_request_handler("tools/call", |_request, _extra| async { Ok(json!({})) })
            .is_ok());
    }

    #[tokio::test]
    async fn test_register_capabilities_only_before_connect() {
        let protocol = engine(Side::Server, Capabilities::new().with("resources", json!({})));
        protocol
            .register_capabilities(&Capabilities::new().with("tools", json!({})))
            .unwrap();
        assert!(protocol.local_capabilities().has("resources"));
        assert!(protocol.local_capabilities().has("tools"));

        let (transport, _sent) = ScriptedTransport::new();
        protocol.connect(transport).await.unwrap();
        let err = protocol
            .register_capabilities(&Capabilities::new().with("logging", json!({})))
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Cannot register capabilities after connecting to transport"));
    }

    #[tokio::test]
    async fn test_strict_mode_checks_peer_capabilities() {
        let protocol = Protocol::new(Side::Client, Capabilities::new(), ProtocolOptions::strict());
        let (transport, _sent) = ScriptedTransport::new();
        protocol.connect(transport).await.unwrap();

        let err = protocol
            .request("tools/call", None, RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Validation(_)));
        assert!(err.to_string().contains("Server does not support tools"));
    }

    #[tokio::test]
    async fn test_notification_checks_local_capabilities() {
        let protocol = engine(Side::Server, Capabilities::new());
        let (transport, _sent) = ScriptedTransport::new();
        protocol.connect(transport).await.unwrap();

        let err = protocol
            .notification("notifications/tools/list_changed", None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Validation(_)));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let protocol = engine(Side::Client, Capabilities::new());
        let (first, _sent) = ScriptedTransport::new();
        let (second, _sent2) = ScriptedTransport::new();
        protocol.connect(first).await.unwrap();
        assert!(protocol.connect(second).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_handler_answers_method_not_found() {
        let server = engine(Side::Server, Capabilities::new());
        let client = connected_pair(&server).await;

        let err = client
            .request("nope", None, RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32601);
    }

    #[tokio::test]
    async fn test_ping_is_built_in() {
        let server = engine(Side::Server, Capabilities::new());
        let client = connected_pair(&server).await;
        let result = client.request("ping", None, RequestOptions::new()).await.unwrap();
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn test_handler_error_code_is_preserved() {
        let server = engine(Side::Server, Capabilities::new());
        server
            .set_request_handler("strict", |_request, _extra| async {
                Err(McpError::invalid_params("missing field"))
            })
            .unwrap();
        server
            .set_request_handler("broken", |_request, _extra| async {
                Err(McpError::internal("boom"))
            })
            .unwrap();
        let client = connected_pair(&server).await;

        let err = client
            .request("strict", None, RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32602);
        assert_eq!(err.rpc_message(), "missing field");

        let err = client
            .request("broken", None, RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32603);
    }

    #[tokio::test]
    async fn test_fallback_handlers() {
        let server = engine(Side::Server, Capabilities::new());
        server.set_fallback_request_handler(|request, _extra| async move {
            Ok(json!({ "method": request.method }))
        });
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        server.set_fallback_notification_handler(move |notification| {
            let _ = seen_tx.send(notification.method);
            async { Ok(()) }
        });
        let client = connected_pair(&server).await;

        let result = client
            .request("vendor/thing", None, RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"method": "vendor/thing"}));

        client.notification("vendor/event", None).await.unwrap();
        assert_eq!(seen_rx.recv().await.as_deref(), Some("vendor/event"));
    }

    #[tokio::test]
    async fn test_progress_routed_to_caller() {
        let server = engine(Side::Server, Capabilities::new());
        let server_handle = server.clone();
        server
            .set_request_handler("work", move |request, _extra| {
                let server = server_handle.clone();
                async move {
                    let token = request.params.as_ref().unwrap()["_meta"]["progressToken"].clone();
                    assert_eq!(request.params.as_ref().unwrap()["task"], "build");
                    for step in 1..=2 {
                        server
                            .notification(
                                methods::NOTIFICATION_PROGRESS,
                                Some(json!({"progressToken": token, "progress": step, "total": 2})),
                            )
                            .await?;
                    }
                    Ok(json!({"done": true}))
                }
            })
            .unwrap();
        let client = connected_pair(&server).await;

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let result = client
            .request(
                "work",
                Some(json!({"task": "build"})),
                RequestOptions::new().on_progress(move |progress| {
                    lock(&sink).push(progress.progress);
                }),
            )
            .await
            .unwrap();

        assert_eq!(result, json!({"done": true}));
        assert_eq!(*lock(&updates), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_unknown_progress_token_is_reported() {
        let protocol = engine(Side::Client, Capabilities::new());
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        protocol.set_on_error(move |error| {
            let _ = error_tx.send(error.to_string());
        });
        let (transport, _sent) = ScriptedTransport::new();
        protocol.connect(transport.clone()).await.unwrap();

        transport.inject(JsonRpcNotification::new(
            methods::NOTIFICATION_PROGRESS,
            Some(json!({"progressToken": 7, "progress": 1})),
        ));
        assert!(error_rx.recv().await.unwrap().contains("unknown token: 7"));
    }

    #[tokio::test]
    async fn test_timeout_cancels_request() {
        let protocol = engine(Side::Client, Capabilities::new());
        let (transport, _sent) = ScriptedTransport::new();
        protocol.connect(transport.clone()).await.unwrap();

        let err = protocol
            .request(
                "slow",
                None,
                RequestOptions::new().timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32001);
        assert_eq!(transport.sent_with_method(methods::NOTIFICATION_CANCELLED), 1);
    }

    #[tokio::test]
    async fn test_peer_cancellation_suppresses_response() {
        let server = engine(Side::Server, Capabilities::new());
        let (observed_tx, mut observed_rx) = mpsc::unbounded_channel();
        server
            .set_request_handler("slow", move |_request, extra| {
                let observed_tx = observed_tx.clone();
                async move {
                    extra.cancellation.cancelled().await;
                    let _ = observed_tx.send(());
                    Ok(json!({"finished": true}))
                }
            })
            .unwrap();
        let (left, right) = MemoryTransport::pair();
        server.connect(Arc::new(right)).await.unwrap();

        let client = engine(Side::Client, Capabilities::new());
        client.connect(Arc::new(left)).await.unwrap();

        let err = client
            .request(
                "slow",
                None,
                RequestOptions::new().timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));

        observed_rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let server_info = server.transport().unwrap().info();
        assert_eq!(server_info.messages_received, 2);
        assert_eq!(server_info.messages_sent, 0);
    }

    #[tokio::test]
    async fn test_notification_handler_errors_reach_on_error() {
        let server = engine(Side::Server, Capabilities::new());
        server.set_notification_handler("explode", |_notification| async {
            Err(McpError::internal("kaboom"))
        });
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        server.set_on_error(move |error| {
            let _ = errors_tx.send(error.to_string());
        });
        let client = connected_pair(&server).await;

        client.notification("explode", None).await.unwrap();
        let message = errors_rx.recv().await.unwrap();
        assert!(message.contains("Uncaught error in notification handler"));
        assert!(message.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_requests() {
        let server = engine(Side::Server, Capabilities::new());
        server
            .set_request_handler("hang", |_request, _extra| future::pending())
            .unwrap();
        let (left, right) = MemoryTransport::pair();
        server.connect(Arc::new(right)).await.unwrap();
        let client = engine(Side::Client, Capabilities::new());
        client.connect(Arc::new(left)).await.unwrap();

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("hang", None, RequestOptions::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close().await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_connection_closed());
        assert!(!client.is_connected());
    }

    /// Transport whose start reports the connection closed and then fails.
    struct RefusingTransport {
        sink: EventSink,
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        fn attach(&self, events: EventSender) -> McpResult<()> {
            self.sink.install(events)
        }

        async fn start(&self) -> McpResult<()> {
            self.sink.closed();
            tokio::task::yield_now().await;
            Err(McpError::ConnectionClosed)
        }

        async fn send(&self, _message: JsonRpcMessage) -> McpResult<()> {
            Err(not_connected())
        }

        async fn close(&self) -> McpResult<()> {
            Ok(())
        }

        fn info(&self) -> TransportInfo {
            self.sink.info()
        }
    }

    #[tokio::test]
    async fn test_failed_start_skips_close_callback() {
        let protocol = engine(Side::Client, Capabilities::new());
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        protocol.set_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let refusing = Arc::new(RefusingTransport {
            sink: EventSink::new("refusing"),
        });
        assert!(protocol.connect(refusing).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert!(!protocol.is_connected());

        // The engine is free for another transport afterwards.
        let (transport, _sent) = ScriptedTransport::new();
        protocol.connect(transport).await.unwrap();
        protocol.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_ids_are_bounded() {
        let protocol = engine(Side::Client, Capabilities::new());
        let (transport, _sent) = ScriptedTransport::new();
        protocol.connect(transport.clone()).await.unwrap();

        for _ in 0..CANCELLED_HISTORY + 20 {
            let err = protocol
                .request(
                    "slow",
                    None,
                    RequestOptions::new().timeout(Duration::from_millis(1)),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, McpError::Timeout { .. }));
        }

        let state = lock(&protocol.inner.state);
        assert_eq!(state.cancelled.len(), CANCELLED_HISTORY);
        assert!(state.pending.is_empty());
        // Oldest ids are forgotten, the newest are still recognised.
        assert!(!state.cancelled.ids.contains(&0));
        assert!(state
            .cancelled
            .ids
            .contains(&((CANCELLED_HISTORY + 19) as RequestId)));
    }

    #[test]
    fn test_recent_ids_evicts_oldest() {
        let mut recent = RecentIds::default();
        for id in 0..(CANCELLED_HISTORY as RequestId + 2) {
            recent.insert(id);
        }
        assert_eq!(recent.len(), CANCELLED_HISTORY);
        assert!(!recent.remove(&0));
        assert!(!recent.remove(&1));
        assert!(recent.remove(&2));
        assert!(!recent.remove(&2));
        assert_eq!(recent.len(), CANCELLED_HISTORY - 1);

        recent.insert(5);
        assert_eq!(recent.len(), CANCELLED_HISTORY - 1);
        recent.clear();
        assert_eq!(recent.len(), 0);
    }

    #[test]
    fn test_options_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            ("engine.json", r#"{"enforce_strict_capabilities": true}"#),
            ("engine.yaml", "enforce_strict_capabilities: true\n"),
            ("engine.toml", "enforce_strict_capabilities = true\n"),
        ];
        for (name, content) in cases {
            let path = dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            assert_eq!(ProtocolOptions::from_file(&path).unwrap(), ProtocolOptions::strict());
        }

        let path = dir.path().join("empty.json");
        std::fs::write(&path, "{}").unwrap();
        assert_eq!(ProtocolOptions::from_file(&path).unwrap(), ProtocolOptions::default());

        let path = dir.path().join("engine.ini");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            ProtocolOptions::from_file(&path).unwrap_err(),
            McpError::Config(crate::error::ConfigError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_progress_token_keeps_existing_params() {
        let params = with_progress_token(Some(json!({"a": 1, "_meta": {"trace": "x"}})), 5);
        assert_eq!(params, json!({"a": 1, "_meta": {"trace": "x", "progressToken": 5}}));

        let params = with_progress_token(None, 0);
        assert_eq!(params, json!({"_meta": {"progressToken": 0}}));
    }
}
