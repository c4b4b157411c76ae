//! Client half of the HTTP+SSE duplex transport.
//!
//! `start()` opens a GET on the configured stream URL and waits for the
//! server's `endpoint` event. That event's data is resolved against the
//! stream URL and must share its origin. Afterwards every `message` event is
//! parsed and delivered to the engine, and every outbound message is POSTed
//! to the endpoint as `application/json`.
//!
//! Messages that arrive before the endpoint is known are held back and
//! delivered, in order, once it is.

use super::{AuthConfig, EventSender, EventSink, SseClientConfig, Transport, TransportInfo};
use crate::error::{McpError, McpResult, TransportError};
use crate::messages::JsonRpcMessage;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, Url};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TRANSPORT_TYPE: &str = "sse-client";

/// Client end of an HTTP+SSE session.
#[derive(Debug)]
pub struct SseClientTransport {
    config: SseClientConfig,
    http: Client,
    shared: Arc<Shared>,
    started: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Shared {
    sink: EventSink,
    endpoint: RwLock<Option<Url>>,
    closed: AtomicBool,
    abort: CancellationToken,
}

impl Shared {
    fn endpoint(&self) -> Option<Url> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_endpoint(&self, url: Url) {
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(url);
    }

    /// Close once: stop the reader, abort in-flight POSTs, announce it.
    fn shut(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort.cancel();
        self.sink.closed();
    }

    fn fail(&self, error: TransportError) -> McpError {
        self.sink.error(error.clone().into());
        error.into()
    }
}

impl SseClientTransport {
    /// Create a transport for the stream described by `config`.
    pub fn new(config: SseClientConfig) -> McpResult<Self> {
        config.validate()?;
        let http = build_http_client(&config)?;
        Ok(Self {
            config,
            http,
            shared: Arc::new(Shared {
                sink: EventSink::new(TRANSPORT_TYPE),
                endpoint: RwLock::new(None),
                closed: AtomicBool::new(false),
                abort: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    /// Shorthand for a transport with default settings.
    pub fn connect_to(url: Url) -> McpResult<Self> {
        Self::new(SseClientConfig::new(url))
    }

    /// The POST endpoint announced by the server, once known.
    pub fn endpoint(&self) -> Option<Url> {
        self.shared.endpoint()
    }

    /// Whether the transport has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn open_stream(&self) -> Result<Response, TransportError> {
        let request = self
            .http
            .get(self.config.url.clone())
            .header(ACCEPT, "text/event-stream");

        let response = tokio::select! {
            _ = self.shared.abort.cancelled() => {
                return Err(TransportError::ConnectionFailed {
                    transport_type: TRANSPORT_TYPE.to_string(),
                    reason: "closed while connecting".to_string(),
                });
            }
            response = request.send() => response.map_err(|e| TransportError::ConnectionFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: e.to_string(),
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpError {
                status_code: status.as_u16(),
                reason: format!("Error opening event stream (HTTP {})", status),
            });
        }
        Ok(response)
    }
}

/// Headers sent with the stream GET and every POST.
fn config_headers(config: &SseClientConfig) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    let mut insert = |name: &str, value: &str| -> Result<(), String> {
        let name = name
            .parse::<HeaderName>()
            .map_err(|e| format!("Invalid header name '{}': {}", name, e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| format!("Invalid value for header '{}': {}", name, e))?;
        headers.insert(name, value);
        Ok(())
    };

    for (name, value) in &config.headers {
        insert(name, value)?;
    }

    match &config.auth {
        Some(AuthConfig::Bearer { token }) => {
            insert(AUTHORIZATION.as_str(), &format!("Bearer {}", token))?
        }
        Some(AuthConfig::Header { name, value }) => insert(name, value)?,
        None => {}
    }

    Ok(headers)
}

fn build_http_client(config: &SseClientConfig) -> McpResult<Client> {
    let headers = config_headers(config).map_err(|reason| TransportError::InvalidConfig {
        transport_type: TRANSPORT_TYPE.to_string(),
        reason,
    })?;

    // No client-wide timeout: it would cut the long-lived stream. POSTs get
    // the configured timeout individually.
    Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| {
            TransportError::InvalidConfig {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: format!("Failed to build HTTP client: {}", e),
            }
            .into()
        })
}

/// Resolve the announced endpoint against the stream URL and check that it
/// stays on the same origin.
pub fn resolve_endpoint(stream_url: &Url, announced: &str) -> Result<Url, TransportError> {
    let endpoint = stream_url
        .join(announced.trim())
        .map_err(|e| TransportError::SseError {
            reason: format!("Invalid endpoint '{}': {}", announced, e),
        })?;

    if endpoint.origin() != stream_url.origin() {
        return Err(TransportError::OriginMismatch {
            endpoint_origin: endpoint.origin().ascii_serialization(),
            connection_origin: stream_url.origin().ascii_serialization(),
        });
    }
    Ok(endpoint)
}

async fn read_events(
    shared: Arc<Shared>,
    response: Response,
    stream_url: Url,
    ready: oneshot::Sender<McpResult<()>>,
) {
    let mut ready = Some(ready);
    let mut held_back: Vec<JsonRpcMessage> = Vec::new();
    let mut events = response.bytes_stream().eventsource();

    loop {
        let next = tokio::select! {
            _ = shared.abort.cancelled() => break,
            next = events.next() => next,
        };

        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                let error = shared.fail(TransportError::SseError {
                    reason: e.to_string(),
                });
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(error));
                    }
                    None => warn!(error = %error, "Event stream failed"),
                }
                break;
            }
            None => {
                debug!("Event stream ended");
                break;
            }
        };

        match event.event.as_str() {
            "endpoint" => match resolve_endpoint(&stream_url, &event.data) {
                Ok(endpoint) => {
                    info!(endpoint = %endpoint, "Received POST endpoint");
                    shared.set_endpoint(endpoint);
                    for message in held_back.drain(..) {
                        shared.sink.message(message);
                    }
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                }
                Err(e) => {
                    let error = shared.fail(e);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(error));
                    }
                    break;
                }
            },
            "" | "message" => match JsonRpcMessage::from_json(&event.data) {
                Ok(message) if shared.endpoint().is_some() => {
                    shared.sink.message(message);
                }
                Ok(message) => held_back.push(message),
                Err(e) => {
                    shared.sink.error(e.into());
                }
            },
            other => debug!(event = other, "Ignoring SSE event"),
        }
    }

    if let Some(ready) = ready.take() {
        let _ = ready.send(Err(McpError::ConnectionClosed));
    }
    shared.shut();
}

#[async_trait]
impl Transport for SseClientTransport {
    fn attach(&self, events: EventSender) -> McpResult<()> {
        self.shared.sink.install(events)
    }

    async fn start(&self) -> McpResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted {
                transport_type: TRANSPORT_TYPE.to_string(),
            }
            .into());
        }

        let response = match self.open_stream().await {
            Ok(response) => response,
            Err(e) => {
                let error = self.shared.fail(e);
                self.shared.shut();
                return Err(error);
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(read_events(
            Arc::clone(&self.shared),
            response,
            self.config.url.clone(),
            ready_tx,
        ));
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        match ready_rx.await {
            Ok(Ok(())) => {
                self.shared.sink.set_connected(true, self.session_id());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(McpError::ConnectionClosed),
        }
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        let endpoint = match self.shared.endpoint() {
            Some(endpoint) if !self.is_closed() => endpoint,
            _ => {
                return Err(TransportError::NotConnected {
                    transport_type: TRANSPORT_TYPE.to_string(),
                    reason: "Not connected".to_string(),
                }
                .into())
            }
        };

        let body = serde_json::to_string(&message)?;
        let request = self
            .http
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.config.timeout)
            .body(body);

        let response = tokio::select! {
            _ = self.shared.abort.cancelled() => return Err(McpError::ConnectionClosed),
            response = request.send() => response,
        };

        let response = response.map_err(|e| {
            self.shared.fail(TransportError::SendFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: e.to_string(),
            })
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.shared.fail(TransportError::HttpError {
                status_code: status.as_u16(),
                reason: format!("Error POSTing to endpoint (HTTP {}): {}", status, text),
            }));
        }

        self.shared.sink.record_sent();
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.shared.shut();
        if let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            reader.abort();
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.shared.endpoint().and_then(|endpoint| {
            endpoint
                .query_pairs()
                .find(|(key, _)| key == "sessionId")
                .map(|(_, value)| value.into_owned())
        })
    }

    fn info(&self) -> TransportInfo {
        self.shared.sink.info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn stream_url() -> Url {
        "http://localhost:3000/sse".parse().unwrap()
    }

    fn sse_body(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body)
    }

    #[test]
    fn test_resolve_relative_endpoint() {
        let endpoint = resolve_endpoint(&stream_url(), "/messages?sessionId=abc").unwrap();
        assert_eq!(endpoint.as_str(), "http://localhost:3000/messages?sessionId=abc");
    }

    #[test]
    fn test_resolve_rejects_foreign_origin() {
        let err = resolve_endpoint(&stream_url(), "http://evil.example/messages").unwrap_err();
        assert!(matches!(err, TransportError::OriginMismatch { .. }));

        let err = resolve_endpoint(&stream_url(), "http://localhost:4000/messages").unwrap_err();
        assert!(matches!(err, TransportError::OriginMismatch { .. }));
    }

    #[test]
    fn test_invalid_auth_header_rejected() {
        let config = SseClientConfig::new(stream_url()).auth(AuthConfig::header("bad header", "v"));
        assert!(SseClientTransport::new(config).is_err());
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let transport = SseClientTransport::connect_to(stream_url()).unwrap();
        let err = transport
            .send(crate::messages::JsonRpcNotification::new("ping", None).into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            McpError::Transport(TransportError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_fails_on_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let url: Url = format!("{}/sse", server.uri()).parse().unwrap();
        let transport = SseClientTransport::connect_to(url).unwrap();
        let err = transport.start().await.unwrap_err();
        assert!(matches!(
            err,
            McpError::Transport(TransportError::HttpError {
                status_code: 500,
                ..
            })
        ));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_start_fails_on_origin_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(sse_body(
                "event: endpoint\ndata: http://evil.example/messages\n\n",
            ))
            .mount(&server)
            .await;

        let url: Url = format!("{}/sse", server.uri()).parse().unwrap();
        let transport = SseClientTransport::connect_to(url).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.attach(tx).unwrap();

        let err = transport.start().await.unwrap_err();
        assert!(matches!(
            err,
            McpError::Transport(TransportError::OriginMismatch { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(crate::transport::TransportEvent::Error(_))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(crate::transport::TransportEvent::Closed)
        ));
    }

    #[tokio::test]
    async fn test_failed_start_does_not_close_engine() {
        use crate::capabilities::{Capabilities, Side};
        use crate::protocol::{Protocol, ProtocolOptions};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(sse_body(
                "event: endpoint\ndata: http://evil.example/messages\n\n",
            ))
            .mount(&server)
            .await;

        let protocol = Protocol::new(Side::Client, Capabilities::new(), ProtocolOptions::default());
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        protocol.set_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let url: Url = format!("{}/sse", server.uri()).parse().unwrap();
        let transport = Arc::new(SseClientTransport::connect_to(url).unwrap());
        assert!(protocol.connect(transport).await.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn test_start_fails_when_stream_ends_without_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(sse_body(": nothing here\n\n"))
            .mount(&server)
            .await;

        let url: Url = format!("{}/sse", server.uri()).parse().unwrap();
        let transport = SseClientTransport::connect_to(url).unwrap();
        let err = transport.start().await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_endpoint_and_buffered_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(sse_body(concat!(
                "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"early\"}\n\n",
                "event: endpoint\ndata: /messages?sessionId=s1\n\n",
                "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"late\"}\n\n",
            )))
            .mount(&server)
            .await;

        let url: Url = format!("{}/sse", server.uri()).parse().unwrap();
        let transport = SseClientTransport::connect_to(url).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.attach(tx).unwrap();
        transport.start().await.unwrap();

        assert_eq!(transport.session_id().as_deref(), Some("s1"));
        for expected in ["early", "late"] {
            match rx.recv().await {
                Some(crate::transport::TransportEvent::Message(message)) => {
                    assert_eq!(message.method(), Some(expected))
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
