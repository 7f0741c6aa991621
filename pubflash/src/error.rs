//! Error types for pubflash.

use std::io;
use thiserror::Error;

/// Result type for pubflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pubflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No physical link could be acquired (missing device, permissions, user cancelled).
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A connect sequence is already running on this session.
    #[error("Connection already in progress")]
    ConnectionInProgress,

    /// The programmer could not synchronise with the bootloader.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Waiting for a device response timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A command or flash was attempted without an open session.
    #[error("Device not connected")]
    NotConnected,

    /// Erase, write or reset failed inside the programmer.
    #[error("Programmer error: {0}")]
    Programmer(String),

    /// The firmware image set is empty or contains an unusable payload.
    #[error("Invalid firmware image set: {0}")]
    InvalidImageSet(String),

    /// The device answered with something we could not interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported operation on this platform or build.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NotConnected.to_string(), "Device not connected");
        assert_eq!(
            Error::ConnectionInProgress.to_string(),
            "Connection already in progress"
        );
        assert_eq!(
            Error::Timeout("no version response".into()).to_string(),
            "Timeout: no version response"
        );
        assert_eq!(
            Error::Unsupported("port discovery".into()).to_string(),
            "Unsupported: port discovery"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
