//! Connector trait for reaching an implementation under test.
//!
//! The [`Connector`] trait abstracts over the byte-stream link to the peer.
//! Implementations exist for TCP sockets and serial ports in
//! `tdriver-transport`, and an in-memory mock in `tdriver-test-harness`.
//!
//! A connector is shared between two parties: the receiver loop, which is the
//! only caller of [`receive`](Connector::receive), and the target, which
//! sends and closes. All methods therefore take `&self`; implementations keep
//! their read and write sides behind separate locks so that a receive in
//! flight never blocks a send.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Asynchronous byte-stream connection to an implementation under test.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the connection.
    ///
    /// Called once by the target's `start()`. Connectors are single-use:
    /// connecting after [`close`](Connector::close) is an error.
    async fn connect(&self) -> Result<()>;

    /// Write all of `data` to the peer.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Wait for the next chunk of inbound data.
    ///
    /// Returns `Ok(None)` at end of stream, including when
    /// [`close`](Connector::close) was called while this receive was waiting.
    /// There is no timeout: the call waits until data, end of stream, or an
    /// error arrives.
    async fn receive(&self) -> Result<Option<Bytes>>;

    /// Close the connection.
    ///
    /// Idempotent. Must wake any receive that is currently waiting, and
    /// must not wait behind a send that is blocked on the peer.
    async fn close(&self) -> Result<()>;

    /// Human-readable peer description for diagnostics, e.g. `"127.0.0.1:8080"`.
    fn peer(&self) -> String;
}
