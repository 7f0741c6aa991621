//! Byte-level link to the device.
//!
//! The [`Transport`] trait is the raw serial connection the session drives:
//! it can be closed and reopened at a baud rate (to re-attach after the
//! device reboots), written to, and polled for raw chunks. The programmer
//! and the monitor loop share one transport through a [`SharedTransport`].
//!
//! ```text
//! +-----------------+   write    +-----------------+
//! |  DeviceSession  | ---------> |                 |
//! +-----------------+            |    Transport    |
//! +-----------------+  raw_read  |  (serialport)   |
//! |  SerialMonitor  | <--------- |                 |
//! +-----------------+            +-----------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use crate::error::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default baud rate for the device console.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(1000),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Raw byte link to the device.
pub trait Transport: Send {
    /// Port name/path.
    fn name(&self) -> &str;

    /// Current baud rate.
    fn baud_rate(&self) -> u32;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Open (or reopen) the link at `baud_rate`.
    fn connect(&mut self, baud_rate: u32) -> Result<()>;

    /// Close the link. Closing a closed link succeeds.
    fn disconnect(&mut self) -> Result<()>;

    /// Write all bytes and flush.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever arrives within `timeout`.
    ///
    /// Returns `Some(empty)` when nothing arrived and `None` once the link
    /// is closed (end of stream).
    fn raw_read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// A transport shared between the session, the programmer and the monitor loop.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Wrap a transport for sharing.
pub fn share(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

#[cfg(feature = "native")]
pub use native::SerialTransport;
