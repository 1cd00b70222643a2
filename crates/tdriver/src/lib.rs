//! # tdriver -- Protocol Test Driver
//!
//! `tdriver` drives an implementation under test over a byte stream (TCP or
//! a serial line), sends it commands, and lets a test scenario assert on the
//! responses and events it sends back. Peers deliver data whenever they like
//! and in arbitrary chunks, so a scenario never reads "the next line": a
//! background task keeps appending to a receive buffer, and the scenario
//! either looks at what is there ([`find`](Target::find)) or waits for a
//! pattern to show up ([`wait`](Target::wait)). Data that arrived before the
//! wait and data arriving during it are treated the same way, and nothing is
//! lost between two statements.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tdriver::{ConsoleLogger, TargetBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let target = TargetBuilder::new("web")
//!         .logger(Arc::new(ConsoleLogger))
//!         .tcp("127.0.0.1", 8080)?;
//!
//!     target
//!         .scoped(|t| async move {
//!             t.send_str("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await?;
//!             anyhow::ensure!(t.wait("</html>", Duration::from_secs(2)).await, "no body");
//!             anyhow::ensure!(t.find("200 OK"), "bad status");
//!             Ok(())
//!         })
//!         .await
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                  | Purpose                                          |
//! |------------------------|--------------------------------------------------|
//! | `tdriver-core`         | [`Connector`] and [`TrafficLogger`] traits, errors, state |
//! | `tdriver-transport`    | TCP and serial connectors                        |
//! | `tdriver-rx`           | Receive buffer, wait engine, receiver task       |
//! | `tdriver-test-harness` | In-memory connector and scripted TCP server      |
//! | **`tdriver`**          | This facade crate -- [`Target`] and re-exports   |
//!
//! ## Waiting
//!
//! Every `wait*` call takes a timeout and reports running out of time as a
//! negative result (`false` or `None`), never as an error. When the
//! connection ends, pending waits return their negative result right away.
//!
//! ## Feature Flags
//!
//! | Feature  | Enables                                  | Default |
//! |----------|------------------------------------------|---------|
//! | `serial` | [`SerialConnector`] via `tokio-serial`   | yes     |

pub mod builder;
pub mod target;

pub use tdriver_core::*;
pub use tdriver_rx::{MatchResult, RxBuffer};
pub use tdriver_transport::{DEFAULT_RECEIVE_UNIT, TcpConnector};
#[cfg(feature = "serial")]
pub use tdriver_transport::{DataBits, FlowControl, Parity, SerialConfig, SerialConnector, StopBits};

pub use builder::{DEFAULT_JOIN_TIMEOUT, TargetBuilder, TargetConfig};
pub use target::Target;
