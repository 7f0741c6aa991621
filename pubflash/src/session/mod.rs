//! Device session state machine.
//!
//! A [`DeviceSession`] orchestrates the whole device lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Flashing -> Connected
//!       ^              |                        |
//!       +--- failure --+------ disconnect ------+
//! ```
//!
//! Connecting syncs with the bootloader through the [`Programmer`], reads the
//! chip identity, resets into the application, re-attaches the transport,
//! starts the [`SerialMonitor`] and asks the firmware for its version. Every
//! failure is written to the [`LogSink`] at error severity before it is
//! returned, so the visible log is a superset of what callers see.
//!
//! All methods take `&self`; the session can be shared between a UI thread
//! and worker threads.

mod config;
mod info;
mod progress;

pub use config::SessionConfig;
pub use info::{DeviceInfo, DeviceSettings, UNKNOWN};
pub use progress::{FlashProgress, FlashStatus, image_percent, overall_percent};

use crate::chain::ListenerChain;
use crate::correlator::{Correlator, Fields, Query};
use crate::demux::LineDemultiplexer;
use crate::error::{Error, Result};
use crate::export::export_log;
use crate::image::FirmwareImages;
use crate::monitor::SerialMonitor;
use crate::programmer::{Connector, Programmer, ProgrammerOutput};
use crate::sink::{LogSink, Severity, lock};
use crate::transport::{SharedTransport, share};
use log::{debug, info};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Coarse lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No link.
    Disconnected,
    /// A connect sequence is running.
    Connecting,
    /// Linked and idle.
    Connected,
    /// A flash attempt is running.
    Flashing,
}

#[derive(Clone)]
struct Link {
    transport: SharedTransport,
    programmer: Arc<Mutex<Box<dyn Programmer>>>,
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A connection to one device.
pub struct DeviceSession {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    sink: LogSink,
    demux: LineDemultiplexer,
    correlator: Correlator,
    connecting: AtomicBool,
    flashing: AtomicBool,
    link: Mutex<Option<Link>>,
    monitor: Mutex<Option<SerialMonitor>>,
    info: Mutex<DeviceInfo>,
    progress: Mutex<FlashProgress>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("info", &self.device_info())
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Create a session with its own log sink.
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self::with_sink(connector, config, LogSink::new())
    }

    /// Create a session writing into an existing sink.
    pub fn with_sink(connector: Arc<dyn Connector>, config: SessionConfig, sink: LogSink) -> Self {
        let chain = ListenerChain::new(sink.clone());
        Self {
            connector,
            config,
            demux: LineDemultiplexer::new(chain.clone()),
            correlator: Correlator::new(chain),
            sink,
            connecting: AtomicBool::new(false),
            flashing: AtomicBool::new(false),
            link: Mutex::new(None),
            monitor: Mutex::new(None),
            info: Mutex::new(DeviceInfo::default()),
            progress: Mutex::new(FlashProgress::default()),
        }
    }

    /// The operator log.
    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// The listener chain in front of the sink.
    pub fn chain(&self) -> &ListenerChain {
        self.demux.chain()
    }

    /// Timing configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.connecting.load(Ordering::Acquire) {
            SessionState::Connecting
        } else if self.flashing.load(Ordering::Acquire) {
            SessionState::Flashing
        } else if self.is_connected() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    /// Whether a link to the device exists.
    pub fn is_connected(&self) -> bool {
        lock(&self.link).is_some()
    }

    /// Snapshot of the device identity.
    pub fn device_info(&self) -> DeviceInfo {
        lock(&self.info).clone()
    }

    /// Snapshot of the current flash attempt.
    pub fn flash_progress(&self) -> FlashProgress {
        lock(&self.progress).clone()
    }

    /// Return the flash progress to idle before a new attempt.
    pub fn reset_flash_progress(&self) {
        *lock(&self.progress) = FlashProgress::default();
    }

    /// Run the connect sequence.
    ///
    /// Fails fast with [`Error::ConnectionInProgress`] while another connect
    /// runs. On failure the session is torn down and the identity cleared.
    /// A failed version query is logged but does not fail the connect.
    pub fn connect(&self) -> Result<DeviceInfo> {
        if self.connecting.swap(true, Ordering::AcqRel) {
            let err = Error::ConnectionInProgress;
            self.sink.error(format!("Connection failed: {err}"));
            return Err(err);
        }
        let _guard = FlagGuard(&self.connecting);

        match self.connect_sequence() {
            Ok(info) => Ok(info),
            Err(err) => {
                self.sink.error(format!("Connection failed: {err}"));
                self.disconnect();
                Err(err)
            },
        }
    }

    fn connect_sequence(&self) -> Result<DeviceInfo> {
        self.disconnect_quietly();

        self.sink.info("Requesting serial port...");
        let transport = share(self.connector.request_port()?);

        self.sink.info("Initializing connection...");
        let demux = self.demux.clone();
        let output: ProgrammerOutput = Arc::new(move |text: &str| {
            demux.push_text(text);
        });
        let programmer = self.connector.programmer(Arc::clone(&transport), output)?;
        let link = Link {
            transport: Arc::clone(&transport),
            programmer: Arc::new(Mutex::new(programmer)),
        };
        *lock(&self.link) = Some(link.clone());

        let (chip, mac) = {
            let mut programmer = lock(&link.programmer);
            programmer.handshake_and_sync()?;

            self.sink.info("Detecting chip...");
            let chip = programmer.chip_description()?.to_uppercase();
            self.sink.success(format!("Found {chip}"));

            self.sink.info("Reading MAC address...");
            let mac = programmer.read_mac()?.to_uppercase();
            self.sink.success(format!("MAC address: {mac}"));

            if let Some(features) = programmer.chip_features()? {
                self.sink.success(format!("Chip Features: {features}"));
            }
            if let Some(crystal) = programmer.crystal_frequency()? {
                self.sink.success(format!("Crystal Frequency: {crystal}"));
            }

            self.sink.info("Rebooting into normal mode...");
            programmer.hard_reset()?;
            (chip, mac)
        };

        lock(&transport).disconnect()?;
        thread::sleep(self.config.reboot_settle);
        lock(&transport).connect(self.config.baud_rate)?;

        self.demux.reset();
        self.start_monitor(&transport)?;
        thread::sleep(self.config.boot_settle);

        *lock(&self.info) = DeviceInfo::connected(chip, mac);
        // Already logged by query_version; the connect carries on without it.
        let _ = self.query_version();

        let info = {
            let mut info = lock(&self.info);
            info.fill_unknown();
            info.clone()
        };
        self.sink.success(format!(
            "Device ready: {} running {} v{}",
            info.chip_id.as_deref().unwrap_or(UNKNOWN),
            info.firmware_variant.as_deref().unwrap_or(UNKNOWN),
            info.firmware_version.as_deref().unwrap_or(UNKNOWN),
        ));
        info!("Connected to {}", lock(&transport).name());
        Ok(info)
    }

    /// Stop the monitor, close the link and clear the identity.
    ///
    /// Close errors are ignored; calling this while disconnected is a no-op.
    pub fn disconnect(&self) {
        if self.disconnect_quietly() {
            self.sink.info("Disconnected from device");
        }
    }

    fn disconnect_quietly(&self) -> bool {
        self.stop_monitor();
        let link = lock(&self.link).take();
        *lock(&self.info) = DeviceInfo::default();

        let Some(link) = link else {
            return false;
        };
        if let Err(err) = lock(&link.transport).disconnect() {
            debug!("Ignoring close error: {err}");
        }
        true
    }

    /// Send a newline-terminated command to the device.
    pub fn send_command(&self, command: &str) -> Result<()> {
        let Some(link) = self.link() else {
            let err = Error::NotConnected;
            self.sink.error(format!("Failed to send command: {err}"));
            return Err(err);
        };

        let mut bytes = Vec::with_capacity(command.len() + 1);
        bytes.extend_from_slice(command.as_bytes());
        bytes.push(b'\n');

        if let Err(err) = lock(&link.transport).write(&bytes) {
            self.sink.error(format!("Failed to send command: {err}"));
            return Err(err);
        }
        self.sink.info(format!("Sent command: {command}"));
        Ok(())
    }

    /// Ask the firmware for version, variant and hardware revision.
    ///
    /// Updates [`DeviceInfo`] on success.
    pub fn query_version(&self) -> Result<DeviceInfo> {
        self.sink.info("Fetching firmware information...");
        let fields = self
            .correlate(Query::version())
            .inspect_err(|err| self.sink.error(format!("Failed to fetch firmware information: {err}")))?;

        let mut info = lock(&self.info);
        info.apply_version(&fields);
        Ok(info.clone())
    }

    /// Read the device settings.
    pub fn retrieve_settings(&self) -> Result<DeviceSettings> {
        self.sink.info("Fetching device settings...");
        let fields = self
            .correlate(Query::settings())
            .inspect_err(|err| self.sink.error(format!("Failed to load settings: {err}")))?;

        self.sink.success("Settings successfully loaded");
        Ok(DeviceSettings::from_fields(&fields))
    }

    /// Store new device settings.
    pub fn save_settings(&self, settings: &DeviceSettings) -> Result<()> {
        self.send_command(&settings.to_command())
    }

    /// Erase the device's stored settings.
    pub fn factory_reset(&self) -> Result<()> {
        self.send_command("erase")
    }

    /// Flash an image set, reporting progress to `observer`.
    ///
    /// After the final reset the console is reopened and monitored again, so
    /// the session stays usable. If the console cannot be reattached the
    /// session is torn down and later commands fail with
    /// [`Error::NotConnected`].
    pub fn flash<F>(&self, images: &FirmwareImages, erase: bool, mut observer: F) -> Result<()>
    where
        F: FnMut(&FlashProgress),
    {
        self.flashing.store(true, Ordering::Release);
        let _guard = FlagGuard(&self.flashing);

        let result = self.flash_sequence(images, erase, &mut observer);
        if let Err(err) = &result {
            self.sink.error(format!("Flash failed: {err}"));
            self.set_progress(FlashProgress::failed(err.to_string()), &mut observer);
        }
        result
    }

    fn flash_sequence(
        &self,
        images: &FirmwareImages,
        erase: bool,
        observer: &mut dyn FnMut(&FlashProgress),
    ) -> Result<()> {
        let images = images.flash_images()?;
        let link = self.link().ok_or(Error::NotConnected)?;

        self.set_progress(FlashProgress::at(FlashStatus::Connecting, 0.0), observer);
        self.stop_monitor();
        thread::sleep(self.config.flash_settle);
        lock(&link.transport).disconnect()?;

        self.sink.info("Rebooting into bootloader...");
        let mut programmer = lock(&link.programmer);
        programmer.handshake_and_sync()?;

        if erase {
            self.set_progress(FlashProgress::at(FlashStatus::Erasing, 0.0), observer);
            self.sink.info("Erasing flash...");
            programmer.erase_flash()?;
        }

        self.sink.info("Writing firmware...");
        self.set_progress(FlashProgress::at(FlashStatus::Flashing, 0.0), observer);
        let count = images.len();
        programmer.write_flash(&images, &mut |index, written, total| {
            let name = images.get(index).map_or("image", |image| image.name());
            let percent = overall_percent(index, written, total, count);
            let floor = lock(&self.progress).progress;
            self.set_progress(
                FlashProgress::at(FlashStatus::Flashing, percent.max(floor)),
                observer,
            );
            self.sink.info(format!("Writing {name}: {}%", image_percent(written, total)));
        })?;
        self.sink.success("Flash complete");

        self.sink.info("Resetting device...");
        programmer.hard_reset()?;
        drop(programmer);
        self.set_progress(FlashProgress::at(FlashStatus::Complete, 100.0), observer);
        self.sink.success("Device reset and ready");

        if let Err(err) = self.reattach_console(&link) {
            self.sink.error(format!("Failed to reopen console: {err}"));
            self.disconnect();
        }
        Ok(())
    }

    /// Reopen the console after a reset and resume monitoring it.
    fn reattach_console(&self, link: &Link) -> Result<()> {
        thread::sleep(self.config.reboot_settle);
        lock(&link.transport).connect(self.config.baud_rate)?;
        self.demux.reset();
        self.start_monitor(&link.transport)
    }

    /// Render the current log as text, keeping only `severities`.
    pub fn export(&self, severities: &[Severity]) -> String {
        export_log(&self.sink.entries(), &self.device_info(), severities)
    }

    fn correlate(&self, query: Query) -> Result<Fields> {
        let query = query.with_timeout(self.config.query_timeout);
        self.correlator
            .query(&query, |command| self.send_command(command))
    }

    fn link(&self) -> Option<Link> {
        lock(&self.link).clone()
    }

    fn set_progress(&self, progress: FlashProgress, observer: &mut dyn FnMut(&FlashProgress)) {
        *lock(&self.progress) = progress.clone();
        observer(&progress);
    }

    fn start_monitor(&self, transport: &SharedTransport) -> Result<()> {
        let mut slot = lock(&self.monitor);
        if let Some(mut previous) = slot.take() {
            previous.stop();
        }
        *slot = Some(SerialMonitor::start(
            Arc::clone(transport),
            self.demux.clone(),
            self.config.read_timeout,
        )?);
        Ok(())
    }

    fn stop_monitor(&self) {
        let monitor = lock(&self.monitor).take();
        if let Some(mut monitor) = monitor {
            monitor.stop();
        }
    }
}
