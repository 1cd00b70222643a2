//! Scripted TCP peer for end-to-end tests.
//!
//! [`MockTcpServer`] listens on a random localhost port and, once started,
//! accepts a single connection and plays a script against it: wait for the
//! client to send something, reply, pause, stay silent, or hang up. It stands
//! in for a real implementation under test when exercising the TCP connector
//! and the receive/wait engine together.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tdriver_test_harness::MockTcpServer;
//!
//! # async fn example() -> tdriver_core::Result<()> {
//! let mut server = MockTcpServer::new().await?;
//! server
//!     .expect(b"GET / HTTP/1.1\r\n\r\n")
//!     .reply(b"HTTP/1.1 200 OK\r\n\r\n")
//!     .pause(Duration::from_millis(50))
//!     .reply(b"<html></html>");
//! server.start();
//! // ... connect a TcpConnector to server.port() and test ...
//! server.wait().await.unwrap();
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tdriver_core::error::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One step of the server script.
#[derive(Debug, Clone)]
enum Step {
    /// Read until the client has sent these exact bytes.
    Expect(Vec<u8>),
    /// Write these bytes.
    Reply(Vec<u8>),
    /// Sleep.
    Pause(Duration),
    /// Close the connection immediately.
    HangUp,
}

/// A scripted single-connection TCP server.
///
/// When the script runs out, the server keeps the connection open until the
/// client closes it, so a client that is still waiting sees silence rather
/// than an end of stream. Use [`hang_up`](MockTcpServer::hang_up) to end it
/// explicitly.
pub struct MockTcpServer {
    port: u16,
    listener: Option<TcpListener>,
    script: Vec<Step>,
    server_handle: Option<JoinHandle<std::result::Result<Vec<u8>, String>>>,
}

impl MockTcpServer {
    /// Bind a new server on a random localhost port.
    ///
    /// No connection is accepted until [`start`](MockTcpServer::start).
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TCP server: {}", e)))?;
        let port = listener.local_addr().map_err(Error::Io)?.port();
        Ok(Self {
            port,
            listener: Some(listener),
            script: Vec::new(),
            server_handle: None,
        })
    }

    /// Wait until the client has sent exactly `request` (possibly across
    /// several TCP segments).
    pub fn expect(&mut self, request: &[u8]) -> &mut Self {
        self.script.push(Step::Expect(request.to_vec()));
        self
    }

    /// Write `response` to the client.
    pub fn reply(&mut self, response: &[u8]) -> &mut Self {
        self.script.push(Step::Reply(response.to_vec()));
        self
    }

    /// Sleep for `duration` before the next step.
    pub fn pause(&mut self, duration: Duration) -> &mut Self {
        self.script.push(Step::Pause(duration));
        self
    }

    /// Close the connection. Later steps are ignored.
    pub fn hang_up(&mut self) -> &mut Self {
        self.script.push(Step::HangUp);
        self
    }

    /// Host to connect to (always `127.0.0.1`).
    pub fn host(&self) -> &'static str {
        "127.0.0.1"
    }

    /// Port the server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address in `host:port` form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host(), self.port)
    }

    /// Spawn the server task: accept one connection and run the script.
    ///
    /// The listener is already bound, so clients may connect as soon as
    /// [`new`](MockTcpServer::new) returns. Calling `start` twice has no
    /// further effect.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let script = std::mem::take(&mut self.script);

        self.server_handle = Some(tokio::spawn(async move {
            let (mut stream, peer) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {}", e))?;
            tracing::debug!(peer = %peer, steps = script.len(), "mock server accepted connection");
            run_script(&mut stream, &script).await
        }));
    }

    /// Wait for the server task to finish and return everything the client
    /// sent, or a description of the first script step that failed.
    pub async fn wait(self) -> std::result::Result<Vec<u8>, String> {
        match self.server_handle {
            Some(handle) => handle
                .await
                .map_err(|e| format!("server task panicked: {}", e))?,
            None => Ok(Vec::new()),
        }
    }

    /// Abort the server task without waiting.
    pub fn abort(&self) {
        if let Some(handle) = &self.server_handle {
            handle.abort();
        }
    }
}

async fn run_script(
    stream: &mut TcpStream,
    script: &[Step],
) -> std::result::Result<Vec<u8>, String> {
    let mut received = Vec::new();
    let mut cursor = 0;
    let mut buf = [0u8; 1024];

    for (i, step) in script.iter().enumerate() {
        match step {
            Step::Expect(request) => {
                while received.len() - cursor < request.len() {
                    let n = stream
                        .read(&mut buf)
                        .await
                        .map_err(|e| format!("step {}: read error: {}", i, e))?;
                    if n == 0 {
                        return Err(format!(
                            "step {}: client disconnected after {} of {} expected bytes",
                            i,
                            received.len() - cursor,
                            request.len()
                        ));
                    }
                    received.extend_from_slice(&buf[..n]);
                }
                let got = &received[cursor..cursor + request.len()];
                if got != request.as_slice() {
                    return Err(format!(
                        "step {}: request mismatch: expected {:?}, got {:?}",
                        i,
                        String::from_utf8_lossy(request),
                        String::from_utf8_lossy(got)
                    ));
                }
                cursor += request.len();
            }
            Step::Reply(response) => {
                stream
                    .write_all(response)
                    .await
                    .map_err(|e| format!("step {}: write error: {}", i, e))?;
                stream
                    .flush()
                    .await
                    .map_err(|e| format!("step {}: flush error: {}", i, e))?;
            }
            Step::Pause(duration) => tokio::time::sleep(*duration).await,
            Step::HangUp => return Ok(received),
        }
    }

    // Script exhausted: stay connected and collect whatever else arrives.
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return Ok(received),
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}
