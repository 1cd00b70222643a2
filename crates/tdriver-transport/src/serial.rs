//! Serial port connector.
//!
//! This module provides [`SerialConnector`], which implements the
//! [`Connector`] trait for implementations under test reached over a USB
//! virtual COM port or an RS-232 line: embedded targets, modems, console
//! ports.
//!
//! # Example
//!
//! ```no_run
//! use tdriver_transport::{SerialConfig, SerialConnector};
//! use tdriver_core::connector::Connector;
//!
//! # async fn example() -> tdriver_core::Result<()> {
//! let connector = SerialConnector::new("/dev/ttyUSB0", SerialConfig::with_baud_rate(115_200));
//! connector.connect().await?;
//! connector.send(b"AT\r").await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use tdriver_core::connector::Connector;
use tdriver_core::error::{Error, Result};
use tokio::io::{ReadHalf, WriteHalf};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::link::{DEFAULT_RECEIVE_UNIT, StreamLink};

/// Serial port configuration.
///
/// Defaults: 9600 baud, 8 data bits, 1 stop bit, no parity, no flow control.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate (e.g., 9600, 19200, 38400, 115200)
    pub baud_rate: u32,
    /// Number of data bits (typically 8)
    pub data_bits: DataBits,
    /// Number of stop bits (typically 1)
    pub stop_bits: StopBits,
    /// Parity checking (typically None)
    pub parity: Parity,
    /// Flow control
    pub flow_control: FlowControl,
    /// Drive DTR and RTS low right after opening.
    ///
    /// Some targets treat an asserted DTR as a reset or attention signal.
    pub deassert_control_lines: bool,
}

impl SerialConfig {
    /// Default settings at the given baud rate.
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            deassert_control_lines: false,
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Serial port connector.
pub struct SerialConnector {
    port_name: String,
    config: SerialConfig,
    link: StreamLink<ReadHalf<SerialStream>, WriteHalf<SerialStream>>,
}

impl SerialConnector {
    /// Create a connector for the serial port at `port`
    /// (e.g. `/dev/ttyUSB0` on Linux, `COM3` on Windows).
    pub fn new(port: impl Into<String>, config: SerialConfig) -> Self {
        Self {
            port_name: port.into(),
            config,
            link: StreamLink::new(DEFAULT_RECEIVE_UNIT),
        }
    }

    /// Set the maximum size of one received chunk (default: 4096 bytes).
    pub fn receive_unit(mut self, bytes: usize) -> Self {
        self.link.set_receive_unit(bytes);
        self
    }

    /// Name of the serial port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Port settings used by [`connect`](Connector::connect).
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self) -> Result<()> {
        self.link.check_unused().await?;

        let port = &self.port_name;
        let config = &self.config;
        tracing::debug!(
            port = %port,
            baud_rate = config.baud_rate,
            data_bits = ?config.data_bits,
            stop_bits = ?config.stop_bits,
            parity = ?config.parity,
            flow_control = ?config.flow_control,
            "Opening serial port"
        );

        let mut stream = tokio_serial::new(port, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %port, error = %e, "Failed to open serial port");
                Error::Connect(format!("failed to open serial port {}: {}", port, e))
            })?;

        if config.deassert_control_lines {
            if let Err(e) = stream.write_data_terminal_ready(false) {
                tracing::warn!(port = %port, error = %e, "Failed to de-assert DTR");
            }
            if let Err(e) = stream.write_request_to_send(false) {
                tracing::warn!(port = %port, error = %e, "Failed to de-assert RTS");
            }
        }

        let (reader, writer) = tokio::io::split(stream);
        self.link.attach(reader, writer).await?;

        tracing::info!(port = %port, baud_rate = config.baud_rate, "Serial port opened");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.link.send(&self.port_name, data).await
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        self.link.receive(&self.port_name).await
    }

    async fn close(&self) -> Result<()> {
        self.link.close(&self.port_name).await;
        Ok(())
    }

    fn peer(&self) -> String {
        self.port_name.clone()
    }
}
