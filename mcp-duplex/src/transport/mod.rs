//! Transport contract and implementations.
//!
//! A transport moves whole [`JsonRpcMessage`]s between two peers. It has no
//! notion of requests or correlation; that belongs to the protocol engine.
//!
//! - [`memory`]: in-process transport pair, used for embedding and tests
//! - [`sse_server`]: server half of the HTTP+SSE duplex transport (axum)
//! - [`sse_client`]: client half of the HTTP+SSE duplex transport (reqwest)
//!
//! # Event delivery
//!
//! Inbound traffic is pushed to the engine through an [`EventSender`] that the
//! engine installs exactly once, before `start()`, via [`Transport::attach`].
//! Installing it hands the transport's inbound side over to the engine; a
//! second `attach` fails.
//!
//! ```rust,no_run
//! use mcp_duplex::transport::{memory::MemoryTransport, Transport, TransportEvent};
//! use tokio::sync::mpsc;
//!
//! # async fn demo() -> mcp_duplex::McpResult<()> {
//! let (left, right) = MemoryTransport::pair();
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! right.attach(tx)?;
//! right.start().await?;
//! left.start().await?;
//!
//! while let Some(event) = rx.recv().await {
//!     if let TransportEvent::Message(message) = event {
//!         println!("{:?}", message);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod memory;

#[cfg(feature = "sse-server")]
pub mod sse_server;

#[cfg(feature = "sse-client")]
pub mod sse_client;

pub use config::*;

use crate::error::{McpError, McpResult, TransportError};
use crate::messages::JsonRpcMessage;
use async_trait::async_trait;
use std::sync::{Mutex, OnceLock, PoisonError};
use tokio::sync::mpsc;

/// Something that happened on the inbound side of a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A message arrived from the peer
    Message(JsonRpcMessage),
    /// The carrier hit an error that did not close it
    Error(McpError),
    /// The channel closed; nothing more will arrive
    Closed,
}

/// Sending half of the engine's event channel.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of the engine's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Contract every carrier satisfies.
///
/// - `start` begins delivering inbound messages; a second call fails
/// - `send` fails while the channel is not open
/// - `close` releases the channel and may be called any number of times
#[async_trait]
pub trait Transport: Send + Sync {
    /// Install the engine's event sender. Must happen before `start`, once.
    fn attach(&self, events: EventSender) -> McpResult<()>;

    /// Open the channel and begin delivering inbound events.
    async fn start(&self) -> McpResult<()>;

    /// Send one message to the peer.
    async fn send(&self, message: JsonRpcMessage) -> McpResult<()>;

    /// Close the channel.
    async fn close(&self) -> McpResult<()>;

    /// Session identifier for multiplexed carriers; `None` when the carrier
    /// has no session concept.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Current state and counters.
    fn info(&self) -> TransportInfo;
}

/// Transport state and traffic counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TransportInfo {
    /// Type of transport (memory, sse-server, sse-client)
    pub transport_type: String,

    /// Whether the channel is currently open
    pub connected: bool,

    /// Session identifier, if the carrier has one
    pub session_id: Option<String>,

    /// Messages handed to the peer
    pub messages_sent: u64,

    /// Messages delivered to the engine
    pub messages_received: u64,

    /// Errors reported
    pub errors: u64,
}

impl TransportInfo {
    /// Create a new transport info structure.
    pub fn new(transport_type: impl Into<String>) -> Self {
        Self {
            transport_type: transport_type.into(),
            ..Default::default()
        }
    }
}

/// One-shot slot for the engine's [`EventSender`] plus the traffic counters
/// every transport keeps.
///
/// Shared by the transports in this crate; custom transports may use it too.
#[derive(Debug)]
pub struct EventSink {
    transport_type: &'static str,
    sender: OnceLock<EventSender>,
    info: Mutex<TransportInfo>,
}

impl EventSink {
    /// Create an empty sink for a transport of the given type.
    pub fn new(transport_type: &'static str) -> Self {
        Self {
            transport_type,
            sender: OnceLock::new(),
            info: Mutex::new(TransportInfo::new(transport_type)),
        }
    }

    /// Install the engine's sender; fails if one is already installed.
    pub fn install(&self, sender: EventSender) -> McpResult<()> {
        self.sender.set(sender).map_err(|_| {
            McpError::from(TransportError::AlreadyAttached {
                transport_type: self.transport_type.to_string(),
            })
        })
    }

    /// Whether an engine is attached.
    pub fn is_attached(&self) -> bool {
        self.sender.get().is_some()
    }

    /// Deliver an inbound message. Returns `false` when nobody is listening.
    pub fn message(&self, message: JsonRpcMessage) -> bool {
        self.update_info(|info| info.messages_received += 1);
        self.emit(TransportEvent::Message(message))
    }

    /// Report a non-fatal error.
    pub fn error(&self, error: McpError) -> bool {
        self.update_info(|info| info.errors += 1);
        self.emit(TransportEvent::Error(error))
    }

    /// Report that the channel closed.
    pub fn closed(&self) -> bool {
        self.update_info(|info| info.connected = false);
        self.emit(TransportEvent::Closed)
    }

    /// Count one outbound message.
    pub fn record_sent(&self) {
        self.update_info(|info| info.messages_sent += 1);
    }

    /// Update the connected flag and session id.
    pub fn set_connected(&self, connected: bool, session_id: Option<String>) {
        self.update_info(|info| {
            info.connected = connected;
            if session_id.is_some() {
                info.session_id = session_id;
            }
        });
    }

    /// Snapshot of the counters.
    pub fn info(&self) -> TransportInfo {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: TransportEvent) -> bool {
        match self.sender.get() {
            Some(sender) => sender.send(event).is_ok(),
            None => {
                tracing::debug!(
                    transport = self.transport_type,
                    "Dropping transport event, no engine attached"
                );
                false
            }
        }
    }

    fn update_info(&self, update: impl FnOnce(&mut TransportInfo)) {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut info);
    }
}
