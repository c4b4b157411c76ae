//! Server half of the HTTP+SSE duplex transport.
//!
//! Each client holds one long-lived GET that receives a Server-Sent Events
//! stream, and sends its own messages as separate POSTs. The first event on
//! the stream is `endpoint`, whose data is the relative URL (with a
//! `sessionId` query parameter) the client must POST to. Every outbound
//! message afterwards is a `message` event carrying one JSON document.
//!
//! [`SseServerTransport`] is one such session. [`SseServer`] wires sessions
//! into an axum [`Router`]: a GET on the stream path creates a transport and
//! hands it to a [`SessionFactory`], and POSTs to the message path are routed
//! to the transport named by `sessionId`.
//!
//! ```rust,no_run
//! use mcp_duplex::server::{Server, ServerOptions};
//! use mcp_duplex::transport::{sse_server::SseServer, SseServerConfig};
//! use mcp_duplex::messages::Implementation;
//!
//! # async fn demo() -> mcp_duplex::McpResult<()> {
//! let server = SseServer::new(SseServerConfig::default(), |transport| async move {
//!     let server = Server::new(Implementation::new("demo", "0.1.0"), ServerOptions::default());
//!     server.connect(transport.clone()).await?;
//!     tokio::spawn(async move {
//!         transport.closed().await;
//!         drop(server);
//!     });
//!     Ok(())
//! });
//! server.serve().await
//! # }
//! ```

use super::{EventSender, EventSink, SseServerConfig, Transport, TransportInfo};
use crate::error::{McpError, McpResult, ProtocolError, TransportError};
use crate::messages::JsonRpcMessage;
use async_trait::async_trait;
use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Router,
};
use futures::future::BoxFuture;
use futures::Stream;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TRANSPORT_TYPE: &str = "sse-server";

/// Default largest accepted POST body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    Streaming,
    Closed,
}

/// One client session of the HTTP+SSE transport.
#[derive(Debug)]
pub struct SseServerTransport {
    endpoint: String,
    session_id: String,
    max_body_bytes: usize,
    sink: EventSink,
    state: Mutex<StreamState>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    closed: CancellationToken,
}

impl SseServerTransport {
    /// Create a session that tells its client to POST to `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            endpoint: endpoint.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            sink: EventSink::new(TRANSPORT_TYPE),
            state: Mutex::new(StreamState::Idle),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Set the largest accepted POST body.
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// The session identifier announced in the endpoint event.
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// URL announced to the client in the `endpoint` event.
    pub fn endpoint_url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}sessionId={}", self.endpoint, separator, self.session_id)
    }

    /// Take the outbound event stream to serve as the GET response body.
    ///
    /// Can be taken once. Dropping the stream, which is what happens when the
    /// client disconnects, closes the transport.
    pub fn event_stream(self: &Arc<Self>) -> McpResult<SessionStream> {
        let receiver = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: "event stream already taken".to_string(),
            })?;

        Ok(SessionStream {
            inner: UnboundedReceiverStream::new(receiver),
            transport: Arc::downgrade(self),
        })
    }

    /// Resolves once the transport has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Whether the transport has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn state(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Event) -> McpResult<()> {
        let guard = self.events_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or_else(not_connected)?;
        sender.send(event).map_err(|_| not_connected())?;
        Ok(())
    }

    /// Process one POST carrying a client message.
    ///
    /// Answers `202 Accepted` once the message is handed to the engine.
    /// Every rejection is also reported to the engine as an error event.
    pub async fn handle_post_message(&self, request: Request) -> Response {
        if self.state() != StreamState::Streaming {
            let message = "SSE connection not established";
            self.sink.error(not_connected_reason(message));
            return (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
        }

        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let essence = content_type.split(';').next().unwrap_or("").trim();
        if !essence.eq_ignore_ascii_case("application/json") {
            let message = format!("Unsupported content-type: {}", content_type);
            return self.reject(StatusCode::BAD_REQUEST, message);
        }

        let declared_length = request
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if let Some(length) = declared_length.filter(|length| *length > self.max_body_bytes) {
            let message = format!(
                "Request body of {} bytes exceeds limit of {} bytes",
                length, self.max_body_bytes
            );
            return self.reject(StatusCode::PAYLOAD_TOO_LARGE, message);
        }

        let body = match axum::body::to_bytes(request.into_body(), self.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => {
                let message = format!("Request body rejected: {}", e);
                return self.reject(StatusCode::PAYLOAD_TOO_LARGE, message);
            }
        };

        let parsed = std::str::from_utf8(&body)
            .map_err(|e| ProtocolError::InvalidJsonRpc {
                reason: e.to_string(),
            })
            .and_then(JsonRpcMessage::from_json);

        match parsed {
            Ok(message) => {
                self.handle_message(message);
                (StatusCode::ACCEPTED, "Accepted").into_response()
            }
            Err(e) => {
                let message = format!("Invalid message: {}", e);
                self.sink.error(e.into());
                (StatusCode::BAD_REQUEST, message).into_response()
            }
        }
    }

    fn reject(&self, status: StatusCode, message: String) -> Response {
        self.sink.error(
            TransportError::SseError {
                reason: message.clone(),
            }
            .into(),
        );
        (status, message).into_response()
    }

    /// Deliver a message that arrived by other means, as if it had been
    /// POSTed.
    pub fn handle_message(&self, message: JsonRpcMessage) {
        debug!(session_id = %self.session_id, method = ?message.method(), "Inbound message");
        self.sink.message(message);
    }

    fn shut(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == StreamState::Closed {
                return;
            }
            *state = StreamState::Closed;
        }
        // Dropping the sender ends the SSE response.
        self.events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.cancel();
        debug!(session_id = %self.session_id, reason, "SSE session closed");
        self.sink.closed();
    }
}

fn not_connected() -> McpError {
    not_connected_reason("Not connected")
}

fn not_connected_reason(reason: &str) -> McpError {
    TransportError::NotConnected {
        transport_type: TRANSPORT_TYPE.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[async_trait]
impl Transport for SseServerTransport {
    fn attach(&self, events: EventSender) -> McpResult<()> {
        self.sink.install(events)
    }

    async fn start(&self) -> McpResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != StreamState::Idle {
                return Err(TransportError::AlreadyStarted {
                    transport_type: TRANSPORT_TYPE.to_string(),
                }
                .into());
            }
            *state = StreamState::Streaming;
        }

        self.push(Event::default().event("endpoint").data(self.endpoint_url()))?;
        self.sink
            .set_connected(true, Some(self.session_id.clone()));
        info!(session_id = %self.session_id, "SSE session started");
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.state() != StreamState::Streaming {
            return Err(not_connected());
        }
        let data = serde_json::to_string(&message)?;
        self.push(Event::default().event("message").data(data))?;
        self.sink.record_sent();
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.shut("closed locally");
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }

    fn info(&self) -> TransportInfo {
        self.sink.info()
    }
}

/// Outbound SSE events of one session.
///
/// Closes its transport when dropped.
#[derive(Debug)]
pub struct SessionStream {
    inner: UnboundedReceiverStream<Event>,
    transport: Weak<SseServerTransport>,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|event| event.map(Ok))
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.shut("event stream dropped");
        }
    }
}

/// Live sessions, keyed by session id.
#[derive(Debug, Clone, Default)]
pub struct SseSessions {
    inner: Arc<RwLock<HashMap<String, Arc<SseServerTransport>>>>,
}

impl SseSessions {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its id.
    pub async fn insert(&self, transport: Arc<SseServerTransport>) {
        let id = transport.id().to_string();
        self.inner.write().await.insert(id, transport);
    }

    /// Look up a session.
    pub async fn get(&self, id: &str) -> Option<Arc<SseServerTransport>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Forget a session. Returns whether it was registered.
    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no session is live.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Called with each new session, before its stream is served.
///
/// The factory is expected to attach and start the transport, typically by
/// connecting a [`Server`](crate::server::Server) to it, and to keep that
/// server alive until [`SseServerTransport::closed`] resolves.
pub type SessionFactory =
    Arc<dyn Fn(Arc<SseServerTransport>) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;

/// HTTP front end hosting many SSE sessions.
#[derive(Clone)]
pub struct SseServer {
    config: SseServerConfig,
    sessions: SseSessions,
    factory: SessionFactory,
}

impl std::fmt::Debug for SseServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseServer")
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

impl SseServer {
    /// Create a front end that calls `factory` for every new session.
    pub fn new<F, Fut>(config: SseServerConfig, factory: F) -> Self
    where
        F: Fn(Arc<SseServerTransport>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        Self {
            config,
            sessions: SseSessions::new(),
            factory: Arc::new(move |transport| Box::pin(factory(transport))),
        }
    }

    /// Registry of live sessions.
    pub fn sessions(&self) -> SseSessions {
        self.sessions.clone()
    }

    /// Build the axum router serving the stream and message paths.
    pub fn into_router(self) -> Router {
        let stream_path = self.config.sse_path.clone();
        let message_path = self.config.message_path.clone();
        Router::new()
            .route(&stream_path, get(handle_stream))
            .route(&message_path, post(handle_post))
            .with_state(Arc::new(self))
    }

    /// Bind to the configured address and serve until the process exits.
    pub async fn serve(self) -> McpResult<()> {
        self.serve_with_shutdown(CancellationToken::new()).await
    }

    /// Bind to the configured address and serve until `shutdown` fires.
    pub async fn serve_with_shutdown(self, shutdown: CancellationToken) -> McpResult<()> {
        self.config.validate()?;
        let listener = tokio::net::TcpListener::bind(self.config.bind).await?;
        info!(
            address = %listener.local_addr()?,
            sse_path = %self.config.sse_path,
            message_path = %self.config.message_path,
            "SSE server listening"
        );
        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn handle_stream(State(server): State<Arc<SseServer>>) -> Response {
    let transport = Arc::new(
        SseServerTransport::new(server.config.message_path.clone())
            .with_max_body_bytes(server.config.max_body_bytes),
    );
    let stream = match transport.event_stream() {
        Ok(stream) => stream,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let session_id = transport.id().to_string();
    server.sessions.insert(Arc::clone(&transport)).await;

    if let Err(e) = (server.factory)(Arc::clone(&transport)).await {
        warn!(session_id = %session_id, error = %e, "Session setup failed");
        server.sessions.remove(&session_id).await;
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    let sessions = server.sessions.clone();
    tokio::spawn(async move {
        transport.closed().await;
        sessions.remove(&session_id).await;
        debug!(session_id = %session_id, "Session removed");
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(server.config.keep_alive))
        .into_response()
}

async fn handle_post(
    State(server): State<Arc<SseServer>>,
    Query(query): Query<SessionQuery>,
    request: Request,
) -> Response {
    let session_id = match query.session_id {
        Some(id) => id,
        None => return (StatusCode::BAD_REQUEST, "Missing sessionId parameter").into_response(),
    };

    match server.sessions.get(&session_id).await {
        Some(transport) => transport.handle_post_message(request).await,
        None => (StatusCode::NOT_FOUND, "Session not found").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::JsonRpcNotification;
    use crate::transport::TransportEvent;
    use axum::body::Body;
    use futures::StreamExt;

    fn post(body: impl Into<Body>, content_type: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/messages")
            .header("Content-Type", content_type)
            .body(body.into())
            .unwrap()
    }

    fn attached() -> (Arc<SseServerTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = Arc::new(SseServerTransport::new("/messages"));
        let (tx, rx) = mpsc::unbounded_channel();
        transport.attach(tx).unwrap();
        (transport, rx)
    }

    #[test]
    fn test_endpoint_url_carries_session_id() {
        let transport = SseServerTransport::new("/messages");
        assert_eq!(
            transport.endpoint_url(),
            format!("/messages?sessionId={}", transport.id())
        );

        let transport = SseServerTransport::new("/messages?tenant=a");
        assert!(transport.endpoint_url().contains("&sessionId="));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (transport, _rx) = attached();
        transport.start().await.unwrap();
        let err = transport.start().await.unwrap_err();
        assert!(matches!(
            err,
            McpError::Transport(TransportError::AlreadyStarted { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_requires_stream() {
        let (transport, _rx) = attached();
        let err = transport
            .send(JsonRpcNotification::new("ping", None).into())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Not connected"));
    }

    #[tokio::test]
    async fn test_post_before_start_is_rejected() {
        let (transport, _rx) = attached();
        let response = transport
            .handle_post_message(post(r#"{"jsonrpc":"2.0","method":"x"}"#, "application/json"))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_post_validation() {
        let (transport, mut rx) = attached();
        transport.start().await.unwrap();

        let response = transport
            .handle_post_message(post(r#"{"jsonrpc":"2.0","method":"x"}"#, "text/plain"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(rx.recv().await, Some(TransportEvent::Error(_))));

        let response = transport
            .handle_post_message(post("{not json", "application/json"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(rx.recv().await, Some(TransportEvent::Error(_))));

        let response = transport
            .handle_post_message(post(
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
                "application/json; charset=utf-8",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        match rx.recv().await {
            Some(TransportEvent::Message(message)) => {
                assert_eq!(message.method(), Some("notifications/initialized"))
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let transport = Arc::new(SseServerTransport::new("/messages").with_max_body_bytes(16));
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.attach(tx).unwrap();
        transport.start().await.unwrap();

        let body = format!(r#"{{"jsonrpc":"2.0","method":"{}"}}"#, "x".repeat(64));
        let response = transport
            .handle_post_message(post(body, "application/json"))
            .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_declared_length_checked_before_reading() {
        let transport = Arc::new(SseServerTransport::new("/messages").with_max_body_bytes(16));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.attach(tx).unwrap();
        transport.start().await.unwrap();

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/messages")
            .header("Content-Type", "application/json")
            .header("Content-Length", "1048576")
            .body(Body::from("{}"))
            .unwrap();
        let response = transport.handle_post_message(request).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        match rx.recv().await {
            Some(TransportEvent::Error(e)) => assert!(e.to_string().contains("1048576")),
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, mut rx) = attached();
        transport.start().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(transport.is_closed());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_transport() {
        let (transport, mut rx) = attached();
        let mut stream = transport.event_stream().unwrap();
        transport.start().await.unwrap();

        // endpoint event
        assert!(stream.next().await.is_some());
        assert!(transport.event_stream().is_err());

        drop(stream);
        assert!(transport.is_closed());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed)));
    }
}
