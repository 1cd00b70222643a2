//! tdriver-core: Core traits, types, and error definitions for tdriver.
//!
//! This crate defines the transport-agnostic abstractions the rest of the
//! workspace builds on. Scenario code normally depends on the `tdriver`
//! facade crate instead, which re-exports everything here.
//!
//! # Key types
//!
//! - [`Connector`] -- byte-stream link to the implementation under test
//! - [`TrafficLogger`] -- sink for sent/received payloads and lifecycle notes
//! - [`ConnectionState`] / [`SharedState`] -- target lifecycle
//! - [`Error`] / [`Result`] -- error handling

pub mod connector;
pub mod error;
pub mod logger;
pub mod state;

// Re-export key types at crate root for ergonomic `use tdriver_core::*`.
pub use connector::Connector;
pub use error::{Error, Result};
pub use logger::{
    ConsoleLogger, Direction, FileLogger, NoteLevel, NullLogger, TracingLogger, TrafficLogger,
    WriterLogger,
};
pub use state::{ConnectionState, SharedState};
