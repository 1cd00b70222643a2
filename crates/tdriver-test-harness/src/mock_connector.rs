//! In-memory connector for deterministic tests.
//!
//! [`MockConnector`] implements the [`Connector`] trait without any I/O.
//! The test keeps the paired [`MockPeer`] and plays the implementation under
//! test through it: delivering chunks, hanging up, injecting receive errors,
//! and inspecting everything the code under test sent.
//!
//! # Example
//!
//! ```
//! use tdriver_test_harness::MockConnector;
//! use tdriver_core::connector::Connector;
//!
//! # async fn example() -> tdriver_core::Result<()> {
//! let (connector, peer) = MockConnector::new();
//! connector.connect().await?;
//!
//! peer.deliver("HELLO\r\n");
//! let chunk = connector.receive().await?.unwrap();
//! assert_eq!(&chunk[..], b"HELLO\r\n");
//!
//! connector.send(b"BYE\r\n").await?;
//! assert_eq!(peer.sent_text(), "BYE\r\n");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use tdriver_core::connector::Connector;
use tdriver_core::error::{Error, Result};
use tdriver_core::state::ConnectionState;

/// One scripted event on the inbound side.
#[derive(Debug)]
enum Inbound {
    Data(Bytes),
    EndOfStream,
    Fail(String),
}

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    closed: AtomicBool,
    peer_gone: AtomicBool,
    connect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    refuse_connect: Mutex<Option<String>>,
    sent: Mutex<Vec<Bytes>>,
}

/// A [`Connector`] backed by an in-memory queue.
///
/// Created together with its [`MockPeer`] by [`MockConnector::new`].
#[derive(Debug)]
pub struct MockConnector {
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    shared: Arc<Shared>,
}

/// The test's side of a [`MockConnector`].
///
/// Cloneable; all clones drive the same connector.
#[derive(Debug, Clone)]
pub struct MockPeer {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    shared: Arc<Shared>,
}

impl MockConnector {
    /// Create a connector and the peer handle that drives it.
    pub fn new() -> (Self, MockPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let connector = Self {
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            inbound_tx: inbound_tx.clone(),
            shared: shared.clone(),
        };
        (connector, MockPeer { inbound_tx, shared })
    }

    /// Create a connector whose [`connect`](Connector::connect) fails with
    /// [`Error::Connect`] carrying `reason`.
    pub fn refusing(reason: &str) -> (Self, MockPeer) {
        let (connector, peer) = Self::new();
        *lock(&connector.shared.refuse_connect) = Some(reason.to_string());
        (connector, peer)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<()> {
        self.shared.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected(ConnectionState::Closed));
        }
        if let Some(reason) = lock(&self.shared.refuse_connect).clone() {
            return Err(Error::Connect(reason));
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected(ConnectionState::Closed));
        }
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(Error::Disconnected(ConnectionState::Idle));
        }
        if self.shared.peer_gone.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLost);
        }
        lock(&self.shared.sent).push(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(Error::Disconnected(ConnectionState::Idle));
        }
        let mut rx = self.inbound_rx.lock().await;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match rx.recv().await {
            _ if self.shared.closed.load(Ordering::SeqCst) => Ok(None),
            Some(Inbound::Data(chunk)) => Ok(Some(chunk)),
            Some(Inbound::Fail(reason)) => Err(Error::Transport(reason)),
            Some(Inbound::EndOfStream) | None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            // Wake a receive parked on the queue.
            let _ = self.inbound_tx.send(Inbound::EndOfStream);
        }
        Ok(())
    }

    fn peer(&self) -> String {
        "mock".to_string()
    }
}

impl MockPeer {
    /// Queue one inbound chunk, delivered by exactly one `receive()` call.
    pub fn deliver(&self, chunk: impl AsRef<[u8]>) {
        let _ = self
            .inbound_tx
            .send(Inbound::Data(Bytes::copy_from_slice(chunk.as_ref())));
    }

    /// Queue an end of stream: the peer closed its side. Later sends fail
    /// with [`Error::ConnectionLost`].
    pub fn hang_up(&self) {
        self.shared.peer_gone.store(true, Ordering::SeqCst);
        let _ = self.inbound_tx.send(Inbound::EndOfStream);
    }

    /// Queue a receive failure carrying `reason`.
    pub fn fail(&self, reason: &str) {
        let _ = self.inbound_tx.send(Inbound::Fail(reason.to_string()));
    }

    /// Every payload sent through the connector, one entry per `send()`.
    pub fn sent(&self) -> Vec<Bytes> {
        lock(&self.shared.sent).clone()
    }

    /// All sent payloads concatenated and decoded lossily as UTF-8.
    pub fn sent_text(&self) -> String {
        let sent = lock(&self.shared.sent);
        let bytes: Vec<u8> = sent.iter().flat_map(|b| b.iter().copied()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Whether `close()` has been called on the connector.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of `connect()` calls made so far.
    pub fn connect_calls(&self) -> usize {
        self.shared.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `close()` calls made so far.
    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn deliver_and_receive_in_order() {
        let (connector, peer) = MockConnector::new();
        connector.connect().await.unwrap();

        peer.deliver(b"one");
        peer.deliver("two");
        assert_eq!(&connector.receive().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&connector.receive().await.unwrap().unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn tracks_sent_data() {
        let (connector, peer) = MockConnector::new();
        connector.connect().await.unwrap();

        connector.send(b"GET / HTTP/1.1\r\n").await.unwrap();
        connector.send(b"\r\n").await.unwrap();

        assert_eq!(peer.sent().len(), 2);
        assert_eq!(peer.sent_text(), "GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn refusing_connector() {
        let (connector, peer) = MockConnector::refusing("connection refused");
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connect(ref m) if m == "connection refused"));
        assert_eq!(peer.connect_calls(), 1);
    }

    #[tokio::test]
    async fn operations_before_connect_fail() {
        let (connector, _peer) = MockConnector::new();
        assert!(matches!(
            connector.send(b"x").await,
            Err(Error::Disconnected(ConnectionState::Idle))
        ));
        assert!(connector.receive().await.is_err());
    }

    #[tokio::test]
    async fn close_wakes_pending_receive() {
        let (connector, peer) = MockConnector::new();
        connector.connect().await.unwrap();
        let connector = Arc::new(connector);

        let pending = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        connector.close().await.unwrap();
        connector.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Ok(None)));
        assert!(peer.is_closed());
        assert_eq!(peer.close_calls(), 2);
    }

    #[tokio::test]
    async fn hang_up_ends_stream_and_breaks_send() {
        let (connector, peer) = MockConnector::new();
        connector.connect().await.unwrap();

        peer.deliver("last words");
        peer.hang_up();
        assert!(connector.receive().await.unwrap().is_some());
        assert!(connector.receive().await.unwrap().is_none());
        assert!(matches!(
            connector.send(b"anyone?").await,
            Err(Error::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn injected_failure() {
        let (connector, peer) = MockConnector::new();
        connector.connect().await.unwrap();

        peer.fail("framing error");
        let err = connector.receive().await.unwrap_err();
        assert!(matches!(err, Error::Transport(ref m) if m == "framing error"));
    }
}
