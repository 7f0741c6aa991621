//! # pubflash
//!
//! Device communication and flash orchestration for ESP32-based PubRemote
//! devices.
//!
//! The crate turns a raw serial byte stream into an operator log and drives
//! a chip programmer through the connect/flash/disconnect lifecycle:
//!
//! ```text
//! Transport -> LineDemultiplexer -> ListenerChain -> (Correlator | LogSink)
//!                                         ^
//!                         DeviceSession --+-- Programmer
//! ```
//!
//! - [`LogSink`]: append-only, timestamped operator log with subscriptions
//! - [`LineDemultiplexer`]: reassembles lines, strips escapes, classifies severity
//! - [`ListenerChain`]: newest-first interceptors, first claim wins
//! - [`Correlator`]: command/response matching over the line stream
//! - [`SerialMonitor`]: background read loop
//! - [`DeviceSession`]: the connect/flash/disconnect state machine
//!
//! The bootloader protocol is not implemented here. Front ends provide a
//! [`Connector`] that hands out a [`Transport`] and a [`Programmer`].
//!
//! ## Features
//!
//! - `native` (default): serial transport and port discovery via `serialport`
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use pubflash::{Connector, DeviceSession, FirmwareImages, ImageKind, SessionConfig};
//! use std::sync::Arc;
//!
//! fn run(connector: Arc<dyn Connector>) -> pubflash::Result<()> {
//!     let session = DeviceSession::new(connector, SessionConfig::default());
//!     session.sink().subscribe(|entry| {
//!         if let Some(entry) = entry {
//!             println!("[{}] {}", entry.time_label(), entry.message());
//!         }
//!     });
//!
//!     let info = session.connect()?;
//!     println!("Connected to {:?}", info.chip_id);
//!
//!     let images = FirmwareImages::new().load(ImageKind::Application, "app.bin")?;
//!     let result = session.flash(&images, false, |p| println!("{}: {:.0}%", p.status, p.progress));
//!     session.disconnect();
//!     result
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod correlator;
pub mod demux;
pub mod device;
pub mod error;
pub mod export;
pub mod image;
pub mod monitor;
pub mod programmer;
pub mod session;
pub mod sink;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::SerialTransport;
pub use {
    chain::{Interceptor, InterceptorId, ListenerChain},
    correlator::{Correlator, Fields, PROMPT, Query},
    demux::{LineDemultiplexer, LineEvent, classify_line, drain_utf8_lossy, strip_ansi},
    device::{
        DetectedPort, DeviceKind, auto_detect_port, detect_esp_ports, detect_ports,
        format_port_list, select_port,
    },
    error::{Error, Result},
    export::{export_file_name, export_log},
    image::{FirmwareImages, FlashImage, ImageKind},
    monitor::SerialMonitor,
    programmer::{Connector, Programmer, ProgrammerOutput},
    session::{
        DeviceInfo, DeviceSession, DeviceSettings, FlashProgress, FlashStatus, SessionConfig,
        SessionState,
    },
    sink::{LogEntry, LogSink, Severity, SubscriptionId},
    transport::{SerialConfig, SharedTransport, Transport},
};
