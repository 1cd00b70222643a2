//! Background receiver task.
//!
//! One tokio task per target owns the receive side of the connector. It
//! awaits `receive()` in a loop, appends every chunk to the [`RxBuffer`], and
//! when the stream ends records the terminal connection state and closes the
//! buffer so that blocked waits return promptly.
//!
//! The send side of the connector is not touched here; the target writes
//! through its own handle to the same connector concurrently.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tdriver_core::connector::Connector;
use tdriver_core::error::Error;
use tdriver_core::logger::NoteLevel;
use tdriver_core::state::{ConnectionState, SharedState};

use crate::buffer::RxBuffer;

/// Run state of a [`ReceiverLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    /// Receiving.
    Running,
    /// A stop was requested; the task has not finished yet.
    StopRequested,
    /// The task has finished.
    Stopped,
}

/// How a receiver task ended.
#[derive(Debug)]
pub enum LoopExit {
    /// Ended on request.
    Stopped,
    /// The connector reported end of stream without a stop request.
    EndOfStream,
    /// The connector failed.
    Failed(Error),
}

impl LoopExit {
    /// Connection state this ending leaves the target in.
    pub fn terminal_state(&self) -> ConnectionState {
        match self {
            LoopExit::Stopped | LoopExit::EndOfStream => ConnectionState::Closed,
            LoopExit::Failed(e) if e.is_connection_lost() => ConnectionState::Closed,
            LoopExit::Failed(_) => ConnectionState::Failed,
        }
    }
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Stopped => f.write_str("stopped"),
            LoopExit::EndOfStream => f.write_str("end of stream"),
            LoopExit::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Handle to a running receiver task.
///
/// Dropping the handle cancels the task without waiting for it.
pub struct ReceiverLoop {
    cancel: CancellationToken,
    state: Arc<Mutex<LoopState>>,
    task: Option<JoinHandle<LoopExit>>,
}

impl fmt::Debug for ReceiverLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverLoop")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ReceiverLoop {
    /// Spawn the receiver task for an already connected `connector`.
    ///
    /// Chunks go to `buffer`; the terminal state is written to
    /// `connection` when the task ends.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        buffer: Arc<RxBuffer>,
        connection: SharedState,
    ) -> Self {
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(LoopState::Running));

        let task = tokio::spawn(receive_loop(
            connector,
            buffer,
            connection,
            cancel.clone(),
            state.clone(),
        ));

        Self {
            cancel,
            state,
            task: Some(task),
        }
    }

    /// Current run state.
    pub fn state(&self) -> LoopState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the task to finish. It exits at its next await point; closing the
    /// connector as well wakes an in-flight receive.
    pub fn request_stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == LoopState::Running {
                *state = LoopState::StopRequested;
            }
        }
        self.cancel.cancel();
    }

    /// Whether [`request_stop`](ReceiverLoop::request_stop) has been called.
    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the task has finished (or was already joined).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the task to finish.
    ///
    /// Returns how it ended, or `None` when it was already joined. On expiry
    /// the task is aborted and reported as failed.
    pub async fn join(&mut self, timeout: Duration) -> Option<LoopExit> {
        let mut task = self.task.take()?;

        let exit = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => LoopExit::Failed(Error::Transport(format!("receiver task: {e}"))),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "receiver did not stop in time, aborting");
                task.abort();
                LoopExit::Failed(Error::Transport("receiver did not stop in time".into()))
            }
        };

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = LoopState::Stopped;
        Some(exit)
    }
}

impl Drop for ReceiverLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The receive loop. Runs as a spawned tokio task.
async fn receive_loop(
    connector: Arc<dyn Connector>,
    buffer: Arc<RxBuffer>,
    connection: SharedState,
    cancel: CancellationToken,
    state: Arc<Mutex<LoopState>>,
) -> LoopExit {
    let peer = connector.peer();
    debug!(peer = %peer, "receiver started");

    let exit = loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break LoopExit::Stopped,
            received = connector.receive() => received,
        };

        match received {
            Ok(Some(chunk)) => {
                debug!(peer = %peer, bytes = chunk.len(), "received chunk");
                buffer.append(chunk);
            }
            // A stop closes the connector, which may surface here as an end
            // of stream or as an error before the token is observed.
            _ if cancel.is_cancelled() => break LoopExit::Stopped,
            Ok(None) => break LoopExit::EndOfStream,
            Err(e) => break LoopExit::Failed(e),
        }
    };

    match &exit {
        LoopExit::Stopped => debug!(peer = %peer, "receiver stopped on request"),
        LoopExit::EndOfStream => {
            debug!(peer = %peer, "peer closed the connection");
            buffer.note(NoteLevel::Error, "failed to receive: end of stream");
        }
        LoopExit::Failed(e) => {
            warn!(peer = %peer, error = %e, "receive failed");
            buffer.note(NoteLevel::Error, &format!("failed to receive: {e}"));
        }
    }

    connection.transition(exit.terminal_state());
    buffer.close();
    *state.lock().unwrap_or_else(PoisonError::into_inner) = LoopState::Stopped;
    buffer.note(NoteLevel::Info, "receiver stopped");
    exit
}
