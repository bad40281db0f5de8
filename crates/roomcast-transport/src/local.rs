//! In-process connections.
//!
//! A [`LocalConnection`] delivers payloads to a [`LocalReceiver`] over an
//! unbounded channel. It backs embedded use of the relay, benchmarks, and
//! tests that need to inject send or attachment failures.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, TransportError};

/// Create a connected local pair with a generated ID.
#[must_use]
pub fn pair() -> (Arc<LocalConnection>, LocalReceiver) {
    pair_with_id(ConnectionId::generate())
}

/// Create a connected local pair with the given ID.
#[must_use]
pub fn pair_with_id(id: impl Into<ConnectionId>) -> (Arc<LocalConnection>, LocalReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = Arc::new(LocalConnection {
        id: id.into(),
        tx,
        attachment: RwLock::new(None),
        closed_with: RwLock::new(None),
        is_open: AtomicBool::new(true),
        fail_sends: AtomicBool::new(false),
        fail_attachments: AtomicBool::new(false),
    });
    (connection, LocalReceiver { rx })
}

/// Sending side of an in-process connection.
#[derive(Debug)]
pub struct LocalConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
    attachment: RwLock<Option<Bytes>>,
    closed_with: RwLock<Option<(u16, String)>>,
    is_open: AtomicBool,
    fail_sends: AtomicBool,
    fail_attachments: AtomicBool,
}

impl LocalConnection {
    /// Make every subsequent send fail (or succeed again).
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent attachment write fail (or succeed again).
    pub fn fail_attachments(&self, fail: bool) {
        self.fail_attachments.store(fail, Ordering::SeqCst);
    }

    /// Close code and reason, if the connection was closed by the server.
    #[must_use]
    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed_with
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("injected failure".into()));
        }
        self.tx
            .send(payload)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.is_open.swap(false, Ordering::SeqCst) {
            *self
                .closed_with
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some((code, reason.to_string()));
        }
        Ok(())
    }

    fn attachment(&self) -> Option<Bytes> {
        self.attachment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn set_attachment(&self, attachment: Bytes) -> Result<(), TransportError> {
        if self.fail_attachments.load(Ordering::SeqCst) {
            return Err(TransportError::Attachment("injected failure".into()));
        }
        *self
            .attachment
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(attachment);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Receiving side of an in-process connection.
#[derive(Debug)]
pub struct LocalReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl LocalReceiver {
    /// Wait for the next delivered payload.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Take the next delivered payload if one is queued.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Take every payload queued so far.
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(payload) = self.rx.try_recv() {
            out.push(payload);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let (conn, mut rx) = pair();
        conn.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_injected_send_failure() {
        let (conn, mut rx) = pair();
        conn.fail_sends(true);
        assert!(conn.send(Bytes::from_static(b"x")).await.is_err());
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_fails_sends() {
        let (conn, rx) = pair();
        drop(rx);
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(Bytes::from_static(b"x")).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_records_code() {
        let (conn, _rx) = pair_with_id("conn-1");
        conn.close(1011, "broken").await.unwrap();
        conn.close(1000, "again").await.unwrap();
        assert_eq!(conn.closed_with(), Some((1011, "broken".to_string())));
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_attachment_roundtrip() {
        let (conn, _rx) = pair();
        assert!(conn.attachment().is_none());
        conn.set_attachment(Bytes::from_static(b"rooms")).await.unwrap();
        assert_eq!(conn.attachment(), Some(Bytes::from_static(b"rooms")));

        conn.fail_attachments(true);
        assert!(conn.set_attachment(Bytes::new()).await.is_err());
        assert_eq!(conn.attachment(), Some(Bytes::from_static(b"rooms")));
    }
}
