//! Collaborator interfaces for the chip programmer.
//!
//! The bootloader protocol itself (sync, erase, write, reset, identity
//! reads) lives outside this crate. A [`Connector`] hands out the raw
//! transport and builds a [`Programmer`] bound to it; the programmer reports
//! its own console text through an injected [`ProgrammerOutput`] callback
//! instead of a global logger.

use crate::error::Result;
use crate::image::FlashImage;
use crate::transport::{SharedTransport, Transport};
use std::sync::Arc;

/// Callback receiving text the programmer wants shown to the operator.
pub type ProgrammerOutput = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-image write progress: `(image_index, bytes_written, bytes_total)`.
pub type WriteProgress<'a> = &'a mut dyn FnMut(usize, usize, usize);

/// Bootloader-level operations on a connected chip.
pub trait Programmer: Send {
    /// Reset into the bootloader and synchronise with it.
    fn handshake_and_sync(&mut self) -> Result<()>;

    /// Chip name and revision, e.g. `ESP32-S3 (revision v0.2)`.
    fn chip_description(&mut self) -> Result<String>;

    /// Factory MAC address.
    fn read_mac(&mut self) -> Result<String>;

    /// Feature summary, if the programmer can report it.
    fn chip_features(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Crystal frequency, if the programmer can report it.
    fn crystal_frequency(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Erase the whole flash.
    fn erase_flash(&mut self) -> Result<()>;

    /// Write every image at its address, reporting progress per image.
    fn write_flash(&mut self, images: &[FlashImage], progress: WriteProgress<'_>) -> Result<()>;

    /// Hard-reset the chip into its application.
    fn hard_reset(&mut self) -> Result<()>;
}

/// Acquires transports and builds programmers bound to them.
pub trait Connector: Send + Sync {
    /// Select and return a (possibly closed) transport to the device.
    fn request_port(&self) -> Result<Box<dyn Transport>>;

    /// Build a programmer bound to `transport`, reporting text to `output`.
    fn programmer(
        &self,
        transport: SharedTransport,
        output: ProgrammerOutput,
    ) -> Result<Box<dyn Programmer>>;
}
