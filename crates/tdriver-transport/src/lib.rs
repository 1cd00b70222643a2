//! Connector implementations for tdriver.
//!
//! This crate provides concrete implementations of the
//! [`Connector`](tdriver_core::Connector) trait from `tdriver-core`:
//!
//! - [`TcpConnector`]: TCP client connections
//! - [`SerialConnector`]: USB virtual COM ports and RS-232 lines
//!   (`serial` feature, enabled by default)
//!
//! Both split the underlying stream so that the receiver loop can sit in
//! `receive()` while the target sends, and both wake a pending `receive()`
//! when `close()` is called.
//!
//! # Example
//!
//! ```no_run
//! use tdriver_transport::TcpConnector;
//! use tdriver_core::connector::Connector;
//!
//! # async fn example() -> tdriver_core::Result<()> {
//! let connector = TcpConnector::new("192.168.1.100", 23);
//! connector.connect().await?;
//! connector.send(b"status\r\n").await?;
//! if let Some(chunk) = connector.receive().await? {
//!     println!("{}", String::from_utf8_lossy(&chunk));
//! }
//! # Ok(())
//! # }
//! ```

mod link;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;

pub use link::DEFAULT_RECEIVE_UNIT;
#[cfg(feature = "serial")]
pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialConnector, StopBits};
pub use tcp::TcpConnector;
