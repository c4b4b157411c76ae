use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mcp_duplex::messages::{methods, CallToolParams};
use mcp_duplex::transport::sse_client::SseClientTransport;
use mcp_duplex::transport::sse_server::{SseServer, SseServerTransport};
use mcp_duplex::transport::{AuthConfig, SseClientConfig, SseServerConfig, TransportConfig};
use mcp_duplex::{
    Capabilities, Client, ClientOptions, Implementation, McpError, Server, ServerOptions,
    Transport,
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
#[command(name = "mcp-duplex")]
#[command(about = "Demo server and ping client for the MCP HTTP+SSE transport")]
#[command(version)]
pub struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve an echo server over HTTP+SSE
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        bind: SocketAddr,

        /// Transport config file (json, yaml or toml); overrides --bind
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Connect to a server, run the handshake and ping it
    Ping {
        /// URL of the server's event stream
        #[arg(short, long, default_value = "http://127.0.0.1:3000/sse")]
        url: Url,

        /// Transport config file (json, yaml or toml); overrides --url
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of pings to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Bearer token sent with every request
        #[arg(long)]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve { bind, config } => {
            let config = match config {
                Some(path) => match load_config(&path)? {
                    TransportConfig::SseServer(config) => config,
                    other => bail!(
                        "{} holds a {} config, expected sse-server",
                        path.display(),
                        other.transport_type()
                    ),
                },
                None => SseServerConfig {
                    bind,
                    ..Default::default()
                },
            };
            run_server(config).await
        }
        Commands::Ping {
            url,
            config,
            count,
            api_key,
        } => {
            let mut config = match config {
                Some(path) => match load_config(&path)? {
                    TransportConfig::SseClient(config) => config,
                    other => bail!(
                        "{} holds a {} config, expected sse-client",
                        path.display(),
                        other.transport_type()
                    ),
                },
                None => SseClientConfig::new(url),
            };
            if let Some(token) = api_key {
                config = config.auth(AuthConfig::bearer(token));
            }
            run_ping(config, count).await
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Path) -> Result<TransportConfig> {
    TransportConfig::from_file(path)
        .with_context(|| format!("Failed to load transport config from {}", path.display()))
}

fn echo_server() -> Result<Server> {
    let server = Server::new(
        Implementation::new("mcp-duplex-echo", env!("CARGO_PKG_VERSION")),
        ServerOptions::default()
            .capabilities(Capabilities::new().with("tools", json!({})))
            .instructions("Call the echo tool to get your arguments back"),
    );

    server.set_request_handler(methods::TOOLS_LIST, |_request, _extra| async {
        Ok(json!({
            "tools": [{
                "name": "echo",
                "description": "Returns its arguments",
                "inputSchema": {"type": "object"},
            }]
        }))
    })?;
    server.set_request_handler(methods::TOOLS_CALL, |request, _extra| async move {
        let params: CallToolParams = request.params_as()?;
        if params.name != "echo" {
            return Err(McpError::invalid_params(format!("Unknown tool: {}", params.name)));
        }
        let text = serde_json::to_string(&params.arguments.unwrap_or_default())?;
        Ok(json!({"content": [{"type": "text", "text": text}]}))
    })?;
    Ok(server)
}

async fn run_server(config: SseServerConfig) -> Result<()> {
    // Fail on a bad handler setup before accepting connections.
    echo_server()?;

    let server = SseServer::new(config, |transport: Arc<SseServerTransport>| async move {
        let server = echo_server().map_err(|e| McpError::internal(e.to_string()))?;
        let session_id = transport.id().to_string();
        server.set_on_initialized(move || info!(session_id = %session_id, "Client initialized"));
        server.connect(transport.clone()).await?;
        tokio::spawn(async move {
            transport.closed().await;
            if let Some(client) = server.client_version() {
                info!(session_id = %transport.id(), client = %client.name, "Session ended");
            }
        });
        Ok::<(), McpError>(())
    });

    let shutdown = shutdown_on_ctrl_c();
    server
        .serve_with_shutdown(shutdown)
        .await
        .context("SSE server failed")
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            trigger.cancel();
        }
    });
    token
}

async fn run_ping(config: SseClientConfig, count: u32) -> Result<()> {
    let transport = Arc::new(SseClientTransport::new(config)?);
    let client = Client::new(
        Implementation::new("mcp-duplex-ping", env!("CARGO_PKG_VERSION")),
        ClientOptions::default()
            .supported_versions(mcp_duplex::messages::SUPPORTED_PROTOCOL_VERSIONS.iter().copied())
            .init_timeout(Duration::from_secs(30)),
    );

    let result = client
        .connect(transport.clone())
        .await
        .context("Handshake failed")?;
    println!(
        "Connected to {} {} (protocol {})",
        result.server_info.name, result.server_info.version, result.protocol_version
    );
    if let Some(instructions) = &result.instructions {
        println!("Instructions: {}", instructions);
    }
    if let Some(session_id) = transport.session_id() {
        println!("Session: {}", session_id);
    }

    for sequence in 1..=count {
        let started = Instant::now();
        client.ping().await.context("Ping failed")?;
        println!("ping {}: {:.1} ms", sequence, started.elapsed().as_secs_f64() * 1000.0);
    }

    client.close().await?;
    Ok(())
}
