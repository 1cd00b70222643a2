//! Error types for tdriver.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Connector failures, lifecycle misuse and
//! invalid arguments are all captured here. Running out of time while waiting
//! for a pattern is deliberately absent: wait operations report that as a
//! negative result, not as an error.

use crate::state::ConnectionState;

/// The error type for all tdriver operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connector could not establish the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Timed out while establishing the connection.
    #[error("timeout while connecting")]
    Timeout,

    /// The peer closed or reset the connection.
    #[error("connection lost")]
    ConnectionLost,

    /// A transmission was attempted after the connection ended.
    #[error("transmission failed: connection is {0}")]
    Disconnected(ConnectionState),

    /// Any other transport-level failure (serial port, socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// The operation is not allowed in the current connection state,
    /// e.g. `send` before `start`, or `start` twice.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the target was in at the time.
        state: ConnectionState,
    },

    /// An invalid argument was passed to an operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the connection itself is gone or unusable.
    ///
    /// The receiver loop uses this to tell a peer hang-up (terminal state
    /// [`Closed`](ConnectionState::Closed)) from other failures.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost | Error::Disconnected(_))
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
