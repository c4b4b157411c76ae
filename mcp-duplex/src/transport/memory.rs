//! In-process transport pair.
//!
//! [`MemoryTransport::pair`] returns two connected ends. Messages sent on one
//! end arrive, in order, on the other once it has been started. Closing
//! either end closes both.

use super::{EventSink, EventSender, Transport, TransportInfo};
use crate::error::{McpResult, TransportError};
use crate::messages::JsonRpcMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const TRANSPORT_TYPE: &str = "memory";

/// One end of an in-process duplex channel.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

#[derive(Debug)]
struct Shared {
    sink: EventSink,
    closed: AtomicBool,
}

impl Shared {
    /// Mark closed and announce it; only the first call announces.
    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.sink.closed();
        true
    }
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (Self::end(left_tx, left_rx), Self::end(right_tx, right_rx))
    }

    fn end(
        outbound: mpsc::UnboundedSender<JsonRpcMessage>,
        inbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink: EventSink::new(TRANSPORT_TYPE),
                closed: AtomicBool::new(false),
            }),
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            pump: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Whether this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
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

        let mut inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::NotConnected {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: "channel already consumed".to_string(),
            })?;

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if !shared.sink.message(message) {
                    debug!("Engine went away, stopping memory pump");
                    break;
                }
            }
            // Peer dropped its sender: the connection is gone.
            shared.shut();
        });

        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.shared.sink.set_connected(true, None);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = match guard.as_ref() {
            Some(sender) if !self.is_closed() => sender,
            _ => {
                return Err(TransportError::NotConnected {
                    transport_type: TRANSPORT_TYPE.to_string(),
                    reason: "Not connected".to_string(),
                }
                .into())
            }
        };

        sender.send(message).map_err(|_| TransportError::SendFailed {
            transport_type: TRANSPORT_TYPE.to_string(),
            reason: "peer end dropped".to_string(),
        })?;
        self.shared.sink.record_sent();
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        // Dropping the sender ends the peer's pump, which closes the peer.
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
        self.shared.shut();
        Ok(())
    }

    fn info(&self) -> TransportInfo {
        self.shared.sink.info()
    }
}
