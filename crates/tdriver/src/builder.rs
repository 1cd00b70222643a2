//! TargetBuilder -- fluent builder for constructing [`Target`] instances.
//!
//! Separates configuration from construction so that callers can pick the
//! target name, traffic logger and buffer behaviour before choosing the
//! connector.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tdriver::{ConsoleLogger, TargetBuilder};
//!
//! # async fn example() -> tdriver::Result<()> {
//! let target = TargetBuilder::new("web")
//!     .logger(Arc::new(ConsoleLogger))
//!     .join_timeout(Duration::from_secs(1))
//!     .tcp("192.168.1.10", 80)?;
//! target.start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tdriver_core::connector::Connector;
use tdriver_core::error::{Error, Result};
use tdriver_core::logger::{NullLogger, TrafficLogger};
use tdriver_transport::TcpConnector;

use crate::target::Target;

/// Default bound on how long `stop()` waits for the receiver task.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    /// Name used to tag this target's traffic in the log.
    pub name: String,
    /// How long `stop()` waits for the receiver task before aborting it.
    pub join_timeout: Duration,
    /// Record each received chunk as one chunk per line.
    pub split_lines: bool,
    /// Flush the receive buffer at the start of every wait.
    pub flush_before_wait: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            split_lines: false,
            flush_before_wait: false,
        }
    }
}

/// Fluent builder for [`Target`].
///
/// Every setting has a default, so the simplest usage is:
///
/// ```ignore
/// let target = TargetBuilder::new("iut").tcp("127.0.0.1", 8080)?;
/// ```
pub struct TargetBuilder {
    config: TargetConfig,
    logger: Arc<dyn TrafficLogger>,
}

impl TargetBuilder {
    /// Create a builder for a target called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        TargetBuilder {
            config: TargetConfig {
                name: name.into(),
                ..TargetConfig::default()
            },
            logger: Arc::new(NullLogger),
        }
    }

    /// Set the traffic logger (default: [`NullLogger`]).
    pub fn logger(mut self, logger: Arc<dyn TrafficLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Set how long `stop()` waits for the receiver task (default: 2s).
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout = timeout;
        self
    }

    /// Record each received chunk as one chunk per line (default: off).
    pub fn split_lines(mut self, enabled: bool) -> Self {
        self.config.split_lines = enabled;
        self
    }

    /// Flush the receive buffer at the start of every wait, so only data
    /// arriving during the wait can satisfy it (default: off).
    pub fn flush_before_wait(mut self, enabled: bool) -> Self {
        self.config.flush_before_wait = enabled;
        self
    }

    /// The configuration collected so far.
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Build a [`Target`] with a caller-provided connector.
    ///
    /// This is the entry point for testing (pass a `MockConnector` from
    /// `tdriver-test-harness`) and for custom connectors.
    pub fn build_with_connector(self, connector: Arc<dyn Connector>) -> Result<Target> {
        if self.config.join_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "join_timeout must be greater than zero".into(),
            ));
        }
        Ok(Target::new(self.config, connector, self.logger))
    }

    /// Build a [`Target`] that connects over TCP to `host:port`.
    pub fn tcp(self, host: &str, port: u16) -> Result<Target> {
        if host.is_empty() {
            return Err(Error::InvalidParameter("host is required".into()));
        }
        self.build_with_connector(Arc::new(TcpConnector::new(host, port)))
    }

    /// Build a [`Target`] that talks to a serial port.
    #[cfg(feature = "serial")]
    pub fn serial(
        self,
        port: &str,
        config: tdriver_transport::SerialConfig,
    ) -> Result<Target> {
        if port.is_empty() {
            return Err(Error::InvalidParameter("serial port is required".into()));
        }
        self.build_with_connector(Arc::new(tdriver_transport::SerialConnector::new(
            port, config,
        )))
    }
}
