//! Programmer backed by the `espflash` library.
//!
//! The ROM bootloader needs the port to itself, so the shared console
//! transport is closed before each bootloader connection and the espflash
//! connection is dropped again once the chip has been reset.

use espflash::connection::{Connection, ResetAfterOperation, ResetBeforeOperation};
use espflash::flasher::Flasher;
use espflash::image_format::Segment;
use espflash::target::ProgressCallbacks;
use log::debug;
use pubflash::programmer::WriteProgress;
use pubflash::transport::DEFAULT_BAUD_RATE;
use pubflash::{
    Connector, Error, FlashImage, Programmer, ProgrammerOutput, SerialConfig, SerialTransport,
    SharedTransport, Transport,
};
use serialport::{SerialPortType, UsbPortInfo};
use std::borrow::Cow;
use std::sync::PoisonError;
use std::time::Duration;

/// Baud rate the ROM bootloader answers on.
const BOOTLOADER_BAUD: u32 = 115_200;

/// Serial timeout for bootloader commands.
const BOOTLOADER_TIMEOUT: Duration = Duration::from_millis(3000);

/// Identity read from the chip after syncing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipDetails {
    /// Chip name and revision.
    pub description: Option<String>,
    /// Feature summary.
    pub features: Option<String>,
    /// Crystal frequency.
    pub crystal: Option<String>,
    /// Factory MAC address.
    pub mac: Option<String>,
}

impl ChipDetails {
    /// Build the identity from the values espflash reports.
    pub fn new<S: AsRef<str>>(
        chip: &str,
        revision: Option<(u32, u32)>,
        features: &[S],
        crystal: &str,
        mac: Option<String>,
    ) -> Self {
        let description = match revision {
            Some((major, minor)) => format!("{chip} (revision v{major}.{minor})"),
            None => chip.to_string(),
        };
        let features: Vec<&str> = features.iter().map(AsRef::as_ref).collect();
        Self {
            description: Some(description),
            features: (!features.is_empty()).then(|| features.join(", ")),
            crystal: (!crystal.is_empty()).then(|| crystal.to_string()),
            mac: mac.filter(|mac| !mac.is_empty()),
        }
    }
}

fn programmer_error(err: espflash::Error) -> Error {
    Error::Programmer(err.to_string())
}

/// USB details espflash uses to pick a reset strategy.
fn usb_port_info(port: &str) -> UsbPortInfo {
    let ports = serialport::available_ports().unwrap_or_default();
    ports
        .into_iter()
        .find(|p| p.port_name == port)
        .and_then(|p| match p.port_type {
            SerialPortType::UsbPort(info) => Some(info),
            _ => None,
        })
        .unwrap_or(UsbPortInfo {
            vid: 0,
            pid: 0,
            serial_number: None,
            manufacturer: None,
            product: None,
        })
}

/// Index of the image starting at `addr`, else the image containing it.
fn image_index(addresses: &[u32], addr: u32) -> Option<usize> {
    addresses
        .iter()
        .position(|&start| start == addr)
        .or_else(|| addresses.iter().rposition(|&start| start <= addr))
}

/// Turns espflash's per-segment callbacks into per-image progress.
struct ImageProgress<'a> {
    addresses: Vec<u32>,
    report: WriteProgress<'a>,
    current: Option<(usize, usize)>,
}

impl<'a> ImageProgress<'a> {
    fn new(images: &[FlashImage], report: WriteProgress<'a>) -> Self {
        Self {
            addresses: images.iter().map(FlashImage::address).collect(),
            report,
            current: None,
        }
    }
}

impl ProgressCallbacks for ImageProgress<'_> {
    fn init(&mut self, addr: u32, total: usize) {
        self.current = image_index(&self.addresses, addr).map(|index| (index, total));
        if let Some((index, total)) = self.current {
            (self.report)(index, 0, total);
        }
    }

    fn update(&mut self, current: usize) {
        if let Some((index, total)) = self.current {
            (self.report)(index, current.min(total), total);
        }
    }

    fn verifying(&mut self) {}

    fn finish(&mut self, _skipped: bool) {
        if let Some((index, total)) = self.current.take() {
            (self.report)(index, total, total);
        }
    }
}

/// Drives the ROM bootloader of one serial port through espflash.
pub struct EspflashProgrammer {
    port: String,
    flash_baud: Option<u32>,
    transport: SharedTransport,
    output: ProgrammerOutput,
    flasher: Option<Flasher>,
    details: ChipDetails,
}

impl EspflashProgrammer {
    /// Bind a programmer to `transport`'s port.
    pub fn new(transport: SharedTransport, output: ProgrammerOutput, flash_baud: Option<u32>) -> Self {
        let port = transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .name()
            .to_string();
        Self {
            port,
            flash_baud,
            transport,
            output,
            flasher: None,
            details: ChipDetails::default(),
        }
    }

    /// Close the shared transport so the bootloader connection can open the port.
    fn release_port(&self) {
        let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        if transport.is_open() {
            debug!("Releasing {} for the bootloader", self.port);
            if let Err(e) = transport.disconnect() {
                debug!("Ignoring close error on {}: {e}", self.port);
            }
        }
    }

    fn open_connection(&self) -> pubflash::Result<Connection> {
        let serial = serialport::new(&self.port, BOOTLOADER_BAUD)
            .timeout(BOOTLOADER_TIMEOUT)
            .open_native()?;
        Ok(Connection::new(
            serial,
            usb_port_info(&self.port),
            ResetAfterOperation::HardReset,
            ResetBeforeOperation::DefaultReset,
            BOOTLOADER_BAUD,
        ))
    }

    fn flasher(&mut self) -> pubflash::Result<&mut Flasher> {
        self.flasher
            .as_mut()
            .ok_or_else(|| Error::Programmer("not synchronised with the bootloader".to_string()))
    }
}

impl Programmer for EspflashProgrammer {
    fn handshake_and_sync(&mut self) -> pubflash::Result<()> {
        self.flasher = None;
        self.release_port();
        (self.output)(&format!("Connecting to the bootloader on {}...", self.port));

        let connection = self
            .open_connection()
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        let mut flasher = Flasher::connect(connection, true, true, true, None, self.flash_baud)
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        let chip_info = flasher
            .device_info()
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;

        self.details = ChipDetails::new(
            &chip_info.chip.to_string(),
            chip_info.revision,
            &chip_info.features,
            &chip_info.crystal_frequency.to_string(),
            chip_info.mac_address.map(|mac| mac.to_string()),
        );
        debug!("Bootloader connected: {:?}", self.details.description);
        self.flasher = Some(flasher);
        Ok(())
    }

    fn chip_description(&mut self) -> pubflash::Result<String> {
        self.details
            .description
            .clone()
            .ok_or_else(|| Error::Protocol("chip description unavailable".to_string()))
    }

    fn read_mac(&mut self) -> pubflash::Result<String> {
        self.details
            .mac
            .clone()
            .ok_or_else(|| Error::Protocol("the chip did not report a MAC address".to_string()))
    }

    fn chip_features(&mut self) -> pubflash::Result<Option<String>> {
        Ok(self.details.features.clone())
    }

    fn crystal_frequency(&mut self) -> pubflash::Result<Option<String>> {
        Ok(self.details.crystal.clone())
    }

    fn erase_flash(&mut self) -> pubflash::Result<()> {
        self.flasher()?.erase_flash().map_err(programmer_error)
    }

    fn write_flash(
        &mut self,
        images: &[FlashImage],
        progress: WriteProgress<'_>,
    ) -> pubflash::Result<()> {
        let segments: Vec<Segment<'_>> = images
            .iter()
            .map(|image| Segment {
                addr: image.address(),
                data: Cow::Borrowed(image.data()),
            })
            .collect();
        let mut callbacks = ImageProgress::new(images, progress);
        self.flasher()?
            .write_bins_to_flash(&segments, &mut callbacks)
            .map_err(programmer_error)
    }

    fn hard_reset(&mut self) -> pubflash::Result<()> {
        // Dropping the flasher frees the port for the console.
        let mut flasher = self.flasher.take().ok_or_else(|| {
            Error::Programmer("not synchronised with the bootloader".to_string())
        })?;
        flasher.connection().reset().map_err(programmer_error)
    }
}

/// Connector for a named serial port programmed through espflash.
#[derive(Debug, Clone)]
pub struct CliConnector {
    port: String,
    baud_rate: u32,
    flash_baud: Option<u32>,
}

impl CliConnector {
    /// Connector for `port`; the console is reopened at `baud_rate` and
    /// images are written at `flash_baud` when given.
    pub fn new(port: impl Into<String>, baud_rate: u32, flash_baud: Option<u32>) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            flash_baud,
        }
    }
}

impl Connector for CliConnector {
    fn request_port(&self) -> pubflash::Result<Box<dyn Transport>> {
        let baud_rate = if self.baud_rate == 0 {
            DEFAULT_BAUD_RATE
        } else {
            self.baud_rate
        };
        // Left closed: the bootloader connection opens the port first.
        Ok(Box::new(SerialTransport::new(SerialConfig::new(&self.port, baud_rate))))
    }

    fn programmer(
        &self,
        transport: SharedTransport,
        output: ProgrammerOutput,
    ) -> pubflash::Result<Box<dyn pubflash::Programmer>> {
        Ok(Box::new(EspflashProgrammer::new(transport, output, self.flash_baud)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pubflash::{FirmwareImages, ImageKind};
    use std::sync::{Arc, Mutex};

    fn closed_transport() -> SharedTransport {
        pubflash::transport::share(Box::new(SerialTransport::new(SerialConfig::new(
            "/dev/pubflash-missing-port",
            115200,
        ))))
    }

    fn images() -> Vec<FlashImage> {
        FirmwareImages::new()
            .with(ImageKind::Bootloader, vec![0; 4])
            .with(ImageKind::Application, vec![0; 8])
            .flash_images()
            .unwrap()
    }

    #[test]
    fn test_chip_details_with_revision() {
        let details = ChipDetails::new(
            "esp32s3",
            Some((0, 2)),
            &["WiFi", "BLE", "Embedded PSRAM 8MB"],
            "40 MHz",
            Some("dc:54:75:aa:bb:cc".to_string()),
        );
        assert_eq!(details.description.as_deref(), Some("esp32s3 (revision v0.2)"));
        assert_eq!(details.features.as_deref(), Some("WiFi, BLE, Embedded PSRAM 8MB"));
        assert_eq!(details.crystal.as_deref(), Some("40 MHz"));
        assert_eq!(details.mac.as_deref(), Some("dc:54:75:aa:bb:cc"));
    }

    #[test]
    fn test_chip_details_without_optional_values() {
        let details = ChipDetails::new::<&str>("esp32c3", None, &[], "", None);
        assert_eq!(details.description.as_deref(), Some("esp32c3"));
        assert!(details.features.is_none());
        assert!(details.crystal.is_none());
        assert!(details.mac.is_none());
    }

    #[test]
    fn test_image_index_by_address() {
        let addresses = [0x0, 0x8000, 0x10000];
        assert_eq!(image_index(&addresses, 0x0), Some(0));
        assert_eq!(image_index(&addresses, 0x8000), Some(1));
        assert_eq!(image_index(&addresses, 0x4000), Some(0));
        assert_eq!(image_index(&addresses, 0x2_0000), Some(2));
        assert_eq!(image_index(&[0x8000], 0x0), None);
    }

    #[test]
    fn test_segment_callbacks_map_to_images() {
        let images = images();
        let mut reports = Vec::new();
        let mut report =
            |index: usize, written: usize, total: usize| reports.push((index, written, total));
        {
            let mut callbacks = ImageProgress::new(&images, &mut report);
            callbacks.init(0x0, 2);
            callbacks.update(1);
            callbacks.update(5);
            callbacks.verifying();
            callbacks.finish(false);
            callbacks.init(0x10000, 3);
            callbacks.finish(true);
            // Ignored outside a segment.
            callbacks.update(1);
        }
        assert_eq!(
            reports,
            vec![(0, 0, 2), (0, 1, 2), (0, 2, 2), (0, 2, 2), (1, 0, 3), (1, 3, 3)]
        );
    }

    #[test]
    fn test_operations_need_a_handshake() {
        let mut programmer = EspflashProgrammer::new(closed_transport(), Arc::new(|_: &str| {}), None);
        assert!(matches!(programmer.erase_flash(), Err(Error::Programmer(_))));
        assert!(matches!(programmer.hard_reset(), Err(Error::Programmer(_))));
        assert!(matches!(programmer.chip_description(), Err(Error::Protocol(_))));
        assert_eq!(programmer.chip_features().unwrap(), None);
    }

    #[test]
    fn test_missing_port_fails_handshake() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let output: ProgrammerOutput = Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        });
        let mut programmer = EspflashProgrammer::new(closed_transport(), output, None);

        let err = programmer.handshake_and_sync().unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(_)));
        assert!(
            seen.lock()
                .unwrap()
                .iter()
                .any(|line| line.contains("/dev/pubflash-missing-port"))
        );
    }

    #[test]
    fn test_connector_hands_out_closed_transport() {
        let connector = CliConnector::new("/dev/ttyACM0", 0, Some(460_800));
        let transport = connector.request_port().unwrap();
        assert_eq!(transport.name(), "/dev/ttyACM0");
        assert_eq!(transport.baud_rate(), DEFAULT_BAUD_RATE);
        assert!(!transport.is_open());
    }
}
