//! TCP connector.
//!
//! This module provides [`TcpConnector`], which implements the [`Connector`]
//! trait for implementations under test that accept TCP connections: HTTP
//! servers, line-oriented daemons, protocol simulators.
//!
//! # Example
//!
//! ```no_run
//! use tdriver_transport::TcpConnector;
//! use tdriver_core::connector::Connector;
//!
//! # async fn example() -> tdriver_core::Result<()> {
//! let connector = TcpConnector::new("localhost", 8080);
//! connector.connect().await?;
//! connector.send(b"GET / HTTP/1.1\r\n\r\n").await?;
//! let chunk = connector.receive().await?;
//! connector.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tdriver_core::connector::Connector;
use tdriver_core::error::{Error, Result};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::link::{DEFAULT_RECEIVE_UNIT, StreamLink};

/// Default connection timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP client connector.
///
/// Construction is cheap and does no I/O; the socket is opened by
/// [`connect`](Connector::connect). Each connector carries exactly one
/// connection over its lifetime.
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    nodelay: bool,
    link: StreamLink<OwnedReadHalf, OwnedWriteHalf>,
}

impl TcpConnector {
    /// Create a connector for `host:port`.
    ///
    /// `host` may be a name (`"localhost"`) or an address literal.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
            link: StreamLink::new(DEFAULT_RECEIVE_UNIT),
        }
    }

    /// Set the connection timeout (default: 5 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum size of one received chunk (default: 4096 bytes).
    pub fn receive_unit(mut self, bytes: usize) -> Self {
        self.link.set_receive_unit(bytes);
        self
    }

    /// Enable or disable `TCP_NODELAY` (default: enabled).
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Wrap an already-connected `TcpStream`.
    ///
    /// Useful when the connection was established elsewhere (e.g. accepted
    /// from a listener in tests). [`connect`](Connector::connect) then
    /// succeeds without opening another socket.
    pub async fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        tracing::debug!(addr = %peer, "Wrapping existing TCP stream");
        let connector = Self::new(peer.ip().to_string(), peer.port());
        let (reader, writer) = stream.into_split();
        connector.link.attach(reader, writer).await?;
        Ok(connector)
    }

    /// Host name or address this connector targets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this connector targets.
    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<()> {
        let addr = self.peer();
        match self.link.check_unused().await {
            Ok(()) => {}
            // Pre-attached via from_stream.
            Err(Error::InvalidState { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        tracing::debug!(
            addr = %addr,
            timeout_ms = self.connect_timeout.as_millis(),
            "Connecting to TCP endpoint"
        );

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| {
            tracing::error!(addr = %addr, "TCP connection timed out");
            Error::Timeout
        })?
        .map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "TCP connection failed");
            map_connect_error(e, &addr)
        })?;

        if self.nodelay
            && let Err(e) = stream.set_nodelay(true)
        {
            tracing::warn!(
                addr = %addr,
                error = %e,
                "Failed to set TCP_NODELAY (continuing anyway)"
            );
        }

        let (reader, writer) = stream.into_split();
        self.link.attach(reader, writer).await?;

        tracing::info!(addr = %addr, "TCP connection established");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.link.send(&self.peer(), data).await
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        self.link.receive(&self.peer()).await
    }

    async fn close(&self) -> Result<()> {
        self.link.close(&self.peer()).await;
        Ok(())
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        if !self.link.is_closed() {
            tracing::debug!(addr = %self.peer(), "TcpConnector dropped, closing connection");
        }
    }
}

/// Map a connection-time I/O error to the appropriate [`Error`] variant.
fn map_connect_error(e: std::io::Error, addr: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Error::Connect(format!("connection refused: {}", addr))
        }
        _ => Error::Connect(format!("{}: {}", addr, e)),
    }
}
