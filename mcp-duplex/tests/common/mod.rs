//! Shared helpers for the integration tests.

#![allow(dead_code)]

use mcp_duplex::messages::{methods, CallToolParams};
use mcp_duplex::transport::sse_server::{SseServer, SseServerTransport};
use mcp_duplex::transport::SseServerConfig;
use mcp_duplex::{Capabilities, Implementation, McpError, McpResult, Server, ServerOptions};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound for anything a test waits on.
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Await `future`, failing the test if it takes longer than [`test_timeout`].
pub async fn with_timeout<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(test_timeout(), future)
        .await
        .expect("operation timed out")
}

/// Poll `condition` until it holds or the test timeout passes.
pub async fn wait_for_condition<F, Fut>(condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + test_timeout();
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A server exposing an `echo` tool that returns its arguments.
pub fn echo_server() -> Server {
    let server = Server::new(
        Implementation::new("echo-server", "1.0.0"),
        ServerOptions::default()
            .capabilities(Capabilities::new().with("tools", json!({"listChanged": true})))
            .instructions("Call the echo tool"),
    );
    server
        .set_request_handler(methods::TOOLS_CALL, |request, _extra| async move {
            let params: CallToolParams = request.params_as()?;
            if params.name != "echo" {
                return Err(McpError::invalid_params(format!("Unknown tool: {}", params.name)));
            }
            Ok(json!({
                "content": [{"type": "text", "text": serde_json::to_string(&params.arguments)?}],
            }))
        })
        .expect("tools capability declared");
    server
}

/// Serve one [`echo_server`] per session.
pub fn echo_sse_server(config: SseServerConfig) -> SseServer {
    SseServer::new(config, |transport: Arc<SseServerTransport>| async move {
        let server = echo_server();
        server.connect(transport.clone()).await?;
        tokio::spawn(async move {
            transport.closed().await;
            drop(server);
        });
        McpResult::Ok(())
    })
}

/// Bind `server` on an ephemeral local port and serve it until the returned
/// token is cancelled.
pub async fn spawn_sse_server(server: SseServer) -> (SocketAddr, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, server.into_router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .expect("serve");
    });
    (addr, shutdown)
}
