//! tdriver-test-harness: mock connectors and scripted peers for tdriver.
//!
//! This crate provides [`MockConnector`] for deterministic, in-memory testing
//! of the receive engine and target lifecycle, and [`MockTcpServer`] for
//! end-to-end tests over real TCP sockets.

pub mod mock_connector;
pub mod mock_tcp;

pub use mock_connector::{MockConnector, MockPeer};
pub use mock_tcp::MockTcpServer;
