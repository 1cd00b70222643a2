//! Split read/write halves of a byte stream behind separate locks.
//!
//! [`StreamLink`] holds the state every stream-based connector needs: the
//! read half (used only by the receiver loop), the write half (used by sends
//! and close), and a cancellation token that lets `close()` wake a receive
//! that is parked on the read half.

use bytes::Bytes;
use tdriver_core::error::{Error, Result};
use tdriver_core::state::ConnectionState;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default number of bytes requested from the stream per receive.
pub const DEFAULT_RECEIVE_UNIT: usize = 4096;

pub(crate) struct StreamLink<R, W> {
    reader: Mutex<Option<R>>,
    writer: Mutex<Option<W>>,
    closed: CancellationToken,
    receive_unit: usize,
}

impl<R, W> StreamLink<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(receive_unit: usize) -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: CancellationToken::new(),
            receive_unit: receive_unit.max(1),
        }
    }

    pub(crate) fn set_receive_unit(&mut self, receive_unit: usize) {
        self.receive_unit = receive_unit.max(1);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Fails when the link was closed or already carries a stream.
    pub(crate) async fn check_unused(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Disconnected(ConnectionState::Closed));
        }
        if self.writer.lock().await.is_some() {
            return Err(Error::InvalidState {
                operation: "connect",
                state: ConnectionState::Connected,
            });
        }
        Ok(())
    }

    pub(crate) async fn attach(&self, reader: R, writer: W) -> Result<()> {
        self.check_unused().await?;
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        Ok(())
    }

    fn unavailable(&self) -> Error {
        if self.is_closed() {
            Error::Disconnected(ConnectionState::Closed)
        } else {
            Error::Disconnected(ConnectionState::Idle)
        }
    }

    pub(crate) async fn send(&self, peer: &str, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.unavailable())?;

        tracing::trace!(peer = %peer, bytes = data.len(), data = ?data, "Sending data");

        // A peer that stops reading can park the write forever; close()
        // cancels the token first so it never waits behind such a write.
        let written = tokio::select! {
            biased;

            _ = self.closed.cancelled() => None,
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => Some(result),
        };

        match written {
            None => {
                tracing::debug!(peer = %peer, "Send aborted by close");
                Err(Error::Disconnected(ConnectionState::Closed))
            }
            Some(Err(e)) => {
                tracing::error!(peer = %peer, error = %e, "Failed to send data");
                Err(map_io_error(e))
            }
            Some(Ok(())) => Ok(()),
        }
    }

    pub(crate) async fn receive(&self, peer: &str) -> Result<Option<Bytes>> {
        if self.is_closed() {
            return Ok(None);
        }

        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return if self.is_closed() {
                Ok(None)
            } else {
                Err(self.unavailable())
            };
        };

        let mut buf = vec![0u8; self.receive_unit];
        let outcome = tokio::select! {
            biased;

            _ = self.closed.cancelled() => None,
            result = reader.read(&mut buf) => Some(result),
        };

        match outcome {
            None => {
                tracing::trace!(peer = %peer, "Receive woken by close");
                guard.take();
                Ok(None)
            }
            Some(Ok(0)) => {
                tracing::debug!(peer = %peer, "Peer closed stream (0 bytes read)");
                guard.take();
                Ok(None)
            }
            Some(Ok(n)) => {
                buf.truncate(n);
                tracing::trace!(peer = %peer, bytes = n, data = ?buf, "Received data");
                Ok(Some(Bytes::from(buf)))
            }
            Some(Err(e)) => {
                if self.is_closed() {
                    return Ok(None);
                }
                tracing::error!(peer = %peer, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
        }
    }

    /// Cancel pending receives and shut the write half down. Idempotent.
    pub(crate) async fn close(&self, peer: &str) {
        self.closed.cancel();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::warn!(
                    peer = %peer,
                    error = %e,
                    "Failed to shut down stream (continuing anyway)"
                );
            }
            tracing::info!(peer = %peer, "Connection closed");
        }

        // A receive in flight drops the read half itself once it wakes.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }
}

/// Map a data-path I/O error to the appropriate [`Error`] variant.
pub(crate) fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type DuplexLink = StreamLink<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    async fn linked() -> (Arc<DuplexLink>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let link = Arc::new(StreamLink::new(DEFAULT_RECEIVE_UNIT));
        link.attach(r, w).await.unwrap();
        (link, theirs)
    }

    #[tokio::test]
    async fn send_and_receive() {
        let (link, mut peer) = linked().await;

        link.send("duplex", b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        let chunk = link.receive("duplex").await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"pong");
    }

    #[tokio::test]
    async fn receive_unit_limits_chunk_size() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let mut link: DuplexLink = StreamLink::new(DEFAULT_RECEIVE_UNIT);
        link.set_receive_unit(3);
        link.attach(r, w).await.unwrap();

        theirs.write_all(b"abcdef").await.unwrap();
        let first = link.receive("duplex").await.unwrap().unwrap();
        assert_eq!(&first[..], b"abc");
        let second = link.receive("duplex").await.unwrap().unwrap();
        assert_eq!(&second[..], b"def");
    }

    #[tokio::test]
    async fn close_wakes_pending_receive() {
        let (link, _peer) = linked().await;

        let receiver = {
            let link = link.clone();
            tokio::spawn(async move { link.receive("duplex").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        link.close("duplex").await;
        let result = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receive did not wake")
            .unwrap();
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn peer_hang_up_is_end_of_stream() {
        let (link, peer) = linked().await;
        drop(peer);
        assert!(matches!(link.receive("duplex").await, Ok(None)));
    }

    #[tokio::test]
    async fn send_after_close_is_disconnected() {
        let (link, _peer) = linked().await;
        link.close("duplex").await;
        link.close("duplex").await;
        assert!(matches!(
            link.send("duplex", b"late").await,
            Err(Error::Disconnected(ConnectionState::Closed))
        ));
        assert!(matches!(link.check_unused().await, Err(Error::Disconnected(_))));
    }

    #[tokio::test]
    async fn close_aborts_blocked_send() {
        // A tiny duplex buffer and a peer that never reads.
        let (ours, _theirs) = tokio::io::duplex(16);
        let (r, w) = tokio::io::split(ours);
        let link: Arc<DuplexLink> = Arc::new(StreamLink::new(DEFAULT_RECEIVE_UNIT));
        link.attach(r, w).await.unwrap();

        let sender = {
            let link = link.clone();
            tokio::spawn(async move { link.send("duplex", &[b'x'; 4096]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());

        tokio::time::timeout(Duration::from_secs(1), link.close("duplex"))
            .await
            .expect("close waited behind the blocked send");
        let result = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .expect("send did not wake")
            .unwrap();
        assert!(matches!(
            result,
            Err(Error::Disconnected(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    async fn send_before_attach_is_disconnected() {
        let link: DuplexLink = StreamLink::new(DEFAULT_RECEIVE_UNIT);
        assert!(matches!(
            link.send("duplex", b"early").await,
            Err(Error::Disconnected(ConnectionState::Idle))
        ));
    }

    #[test]
    fn io_error_mapping() {
        use std::io::{Error as IoError, ErrorKind};
        assert!(matches!(
            map_io_error(IoError::from(ErrorKind::ConnectionReset)),
            Error::ConnectionLost
        ));
        assert!(matches!(
            map_io_error(IoError::from(ErrorKind::BrokenPipe)),
            Error::ConnectionLost
        ));
        assert!(matches!(
            map_io_error(IoError::from(ErrorKind::PermissionDenied)),
            Error::Io(_)
        ));
    }
}
