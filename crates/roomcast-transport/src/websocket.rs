//! WebSocket connections backed by axum.
//!
//! An upgraded socket is split in two: a [`WebSocketConnection`] handle that
//! partitions send through, and a [`WebSocketReader`] the host drives to
//! receive client events. Outbound messages are queued to a writer task so
//! that a slow client never blocks the partition delivering to it.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::traits::{Connection, ConnectionId, TransportError};

/// Default maximum inbound message size (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Split an upgraded socket into a shared sending handle and a reader.
///
/// Spawns the writer task; it exits once the handle and every clone of it
/// are dropped, or the socket fails.
#[must_use]
pub fn split(
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
) -> (Arc<WebSocketConnection>, WebSocketReader) {
    let id = ConnectionId::generate();
    let (sink, stream) = socket.split();
    let (outbound, rx) = mpsc::unbounded_channel();
    let is_open = Arc::new(AtomicBool::new(true));

    tokio::spawn(write_loop(id.clone(), sink, rx, Arc::clone(&is_open)));

    let connection = Arc::new(WebSocketConnection {
        id: id.clone(),
        outbound,
        attachment: RwLock::new(None),
        is_open: Arc::clone(&is_open),
        remote_addr,
    });

    let reader = WebSocketReader {
        id,
        stream,
        is_open,
        max_message_size,
    };

    (connection, reader)
}

async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    is_open: Arc<AtomicBool>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(connection = %id, error = %e, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    is_open.store(false, Ordering::SeqCst);
    trace!(connection = %id, "Writer task finished");
}

/// Sending half of an upgraded WebSocket.
pub struct WebSocketConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
    attachment: RwLock<Option<Bytes>>,
    is_open: Arc<AtomicBool>,
    remote_addr: Option<SocketAddr>,
}

impl WebSocketConnection {
    fn enqueue(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let message = match std::str::from_utf8(&payload) {
            Ok(text) => Message::Text(text.to_owned()),
            Err(_) => Message::Binary(payload.to_vec()),
        };
        self.enqueue(message)
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        let result = self.enqueue(Message::Close(Some(frame)));
        self.is_open.store(false, Ordering::SeqCst);
        match result {
            Err(TransportError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    fn attachment(&self) -> Option<Bytes> {
        self.attachment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn set_attachment(&self, attachment: Bytes) -> Result<(), TransportError> {
        *self
            .attachment
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(attachment);
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

/// Receiving half of an upgraded WebSocket.
pub struct WebSocketReader {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    is_open: Arc<AtomicBool>,
    max_message_size: usize,
}

impl WebSocketReader {
    /// Identifier of the connection this reader belongs to.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Receive the next text message from the client.
    ///
    /// Binary messages holding valid UTF-8 are accepted as text. Returns
    /// `None` when the client closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails or a message is too large.
    pub async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
            };

            match message {
                Message::Text(text) => {
                    self.check_size(text.len())?;
                    return Ok(Some(text));
                }
                Message::Binary(data) => {
                    self.check_size(data.len())?;
                    match String::from_utf8(data) {
                        Ok(text) => return Ok(Some(text)),
                        Err(_) => {
                            warn!(connection = %self.id, "Ignoring non-UTF-8 binary message");
                        }
                    }
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // Pongs are answered by the socket itself
                }
                Message::Close(_) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                connection = %self.id,
                "Message too large: {} bytes (max: {})",
                len,
                self.max_message_size
            );
            return Err(TransportError::MessageTooLarge(len));
        }
        Ok(())
    }
}
