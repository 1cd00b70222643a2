//! Connection lifecycle state.
//!
//! A target moves `Idle -> Connecting -> Connected` and ends in either
//! `Closed` or `Failed`. Both end states are terminal: once reached, no
//! further transition is accepted and reconnecting requires a new target.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Lifecycle state of one connection to an implementation under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed, `start()` not yet called.
    Idle,
    /// `start()` is opening the connector.
    Connecting,
    /// Connected, receiver loop running.
    Connected,
    /// Stopped by the caller or closed by the peer.
    Closed,
    /// Ended by an unrecoverable connector error.
    Failed,
}

impl ConnectionState {
    /// Whether this state can never be left again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Connection state shared between a target and its receiver loop.
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<ConnectionState>>,
}

impl SharedState {
    /// Create a new shared state starting at [`ConnectionState::Idle`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectionState::Idle)),
        }
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` unless the current state is terminal.
    ///
    /// Returns the state in effect after the call.
    pub fn transition(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_terminal() {
            *state = next;
        }
        *state
    }

    /// Move from `expected` to `next` atomically.
    ///
    /// Returns `Err` with the actual state when it was not `expected`.
    pub fn compare_and_set(
        &self,
        expected: ConnectionState,
        next: ConnectionState,
    ) -> std::result::Result<(), ConnectionState> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == expected {
            *state = next;
            Ok(())
        } else {
            Err(*state)
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
