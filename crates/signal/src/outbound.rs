//! Single-writer serialization over a bidirectional message transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::{Envelope, Result, SignalError, WireMessage};

/// Default bound of the outbound queue; senders block when it fills.
const MESSAGE_BUFFER_SIZE: usize = 256;

/// The already-accepted bidirectional text transport under the serializer.
///
/// `receive_text` returning `Ok(None)` means the peer closed cleanly.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;
    async fn receive_text(&self) -> Result<Option<String>>;
    async fn close(&self) -> Result<()>;
}

/// Concurrency-safe socket wrapper.
///
/// Any session task may call [`send`](Self::send); exactly one background
/// writer touches the transport, so messages never interleave and preserve
/// enqueue order. [`close`](Self::close) is idempotent: it stops intake,
/// lets the writer drain the queue, then closes the transport.
pub struct OutboundSocket {
    sender: std::sync::Mutex<Option<mpsc::Sender<WireMessage>>>,
    transport: Arc<dyn MessageTransport>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundSocket {
    pub fn start(transport: Arc<dyn MessageTransport>) -> Self {
        Self::with_capacity(transport, MESSAGE_BUFFER_SIZE)
    }

    pub fn with_capacity(transport: Arc<dyn MessageTransport>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let writer = tokio::spawn(writer_loop(rx, Arc::clone(&transport)));
        Self {
            sender: std::sync::Mutex::new(Some(tx)),
            transport,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Enqueue a message for the writer. Blocks when the queue is full;
    /// fails once the socket is closed.
    pub async fn send(&self, message: WireMessage) -> Result<()> {
        let sender = {
            let guard = self.sender.lock().expect("outbound sender mutex poisoned");
            guard.clone().ok_or(SignalError::Closed)?
        };
        sender.send(message).await.map_err(|_| SignalError::Closed)
    }

    /// Read one envelope off the transport. Only the session's main loop
    /// calls this; it is not serialized with `send`.
    pub async fn receive(&self) -> Result<Option<WireMessage>> {
        match self.transport.receive_text().await? {
            None => Ok(None),
            Some(text) => Ok(Some(Envelope::decode(&text)?.message)),
        }
    }

    /// Stop intake, drain the queue, close the transport. Idempotent.
    pub async fn close(&self) {
        {
            let mut guard = self.sender.lock().expect("outbound sender mutex poisoned");
            guard.take();
        }
        let handle = { self.writer.lock().await.take() };
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "outbound writer task panicked");
            }
        }
    }
}

async fn writer_loop(mut rx: mpsc::Receiver<WireMessage>, transport: Arc<dyn MessageTransport>) {
    while let Some(message) = rx.recv().await {
        let text = match Envelope::new(message).encode() {
            Ok(text) => text,
            Err(error) => {
                tracing::error!(%error, "failed to encode outbound message");
                continue;
            }
        };
        if let Err(error) = transport.send_text(text).await {
            tracing::warn!(%error, "outbound transport write failed, stopping writer");
            break;
        }
    }
    if let Err(error) = transport.close().await {
        tracing::debug!(%error, "transport close reported an error");
    }
}
