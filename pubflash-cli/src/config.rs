//! Configuration file support for pubflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (PUBFLASH_*)
//! 3. An explicit `--config PATH`
//! 4. Local config file (./pubflash.toml)
//! 5. Global config file (~/.config/pubflash/config.toml)
//!
//! USB devices the user chose to remember are kept in a separate
//! `ports.toml` next to the global config so they survive config edits.

use directories::ProjectDirs;
use log::{debug, info, warn};
use pubflash::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local config file name.
const LOCAL_CONFIG: &str = "pubflash.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Console baud rate.
    pub baud: Option<u32>,
}

/// Session timing overrides, all in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Wait after the post-identify reset before reopening the port.
    pub reboot_settle_ms: Option<u64>,
    /// Wait after starting the monitor before querying the firmware.
    pub boot_settle_ms: Option<u64>,
    /// Wait after stopping the monitor before re-entering the bootloader.
    pub flash_settle_ms: Option<u64>,
    /// Correlated query timeout.
    pub query_timeout_ms: Option<u64>,
    /// Monitor read poll timeout.
    pub read_timeout_ms: Option<u64>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Erase the whole flash before writing (default: true).
    pub erase: Option<bool>,
    /// Baud rate for talking to the bootloader while flashing.
    pub baud: Option<u32>,
}

/// Remembered USB devices (`ports.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KnownDevices {
    #[serde(default)]
    usb_device: Vec<UsbDevice>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Session timing.
    #[serde(default)]
    pub session: SessionSettings,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

impl Config {
    /// Load configuration from the global and local config files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config.load_known_devices();
        config
    }

    /// Load the global and local files, then layer `path` (--config) on top.
    pub fn load_with_override(path: &Path) -> Self {
        let mut config = Self::load();
        if let Some(explicit) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config.merge(explicit);
        } else {
            warn!("Could not load config from {}, ignoring it", path.display());
        }
        config
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn load_known_devices(&mut self) {
        let Some(path) = Self::ports_path() else {
            return;
        };
        let Ok(content) = fs::read_to_string(&path) else {
            return;
        };
        match toml::from_str::<KnownDevices>(&content) {
            Ok(known) => {
                debug!("Loaded {} remembered device(s) from {}", known.usb_device.len(), path.display());
                self.add_devices(known.usb_device);
            },
            Err(e) => warn!("Failed to parse {}: {}", path.display(), e),
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pubflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    fn ports_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("ports.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        let session = other.session;
        let ours = &mut self.session;
        ours.reboot_settle_ms = session.reboot_settle_ms.or(ours.reboot_settle_ms);
        ours.boot_settle_ms = session.boot_settle_ms.or(ours.boot_settle_ms);
        ours.flash_settle_ms = session.flash_settle_ms.or(ours.flash_settle_ms);
        ours.query_timeout_ms = session.query_timeout_ms.or(ours.query_timeout_ms);
        ours.read_timeout_ms = session.read_timeout_ms.or(ours.read_timeout_ms);

        if other.flash.erase.is_some() {
            self.flash.erase = other.flash.erase;
        }
        if other.flash.baud.is_some() {
            self.flash.baud = other.flash.baud;
        }

        self.add_devices(other.usb_device);
    }

    fn add_devices(&mut self, devices: Vec<UsbDevice>) {
        for device in devices {
            if !self.usb_device.contains(&device) {
                self.usb_device.push(device);
            }
        }
    }

    /// Whether `vid:pid` was configured or remembered.
    pub fn knows_device(&self, vid: u16, pid: u16) -> bool {
        self.usb_device.iter().any(|device| device.matches(vid, pid))
    }

    /// Erase before flashing unless configured otherwise.
    pub fn erase_by_default(&self) -> bool {
        self.flash.erase.unwrap_or(true)
    }

    /// Session configuration at `baud_rate` with the configured timings.
    pub fn session_config(&self, baud_rate: u32) -> SessionConfig {
        let ms = Duration::from_millis;
        let timing = &self.session;
        let mut config = SessionConfig::default().with_baud_rate(baud_rate);
        if let Some(v) = timing.reboot_settle_ms {
            config = config.with_reboot_settle(ms(v));
        }
        if let Some(v) = timing.boot_settle_ms {
            config = config.with_boot_settle(ms(v));
        }
        if let Some(v) = timing.flash_settle_ms {
            config = config.with_flash_settle(ms(v));
        }
        if let Some(v) = timing.query_timeout_ms {
            config = config.with_query_timeout(ms(v));
        }
        if let Some(v) = timing.read_timeout_ms {
            config = config.with_read_timeout(ms(v));
        }
        config
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        if self.knows_device(vid, pid) {
            return Ok(());
        }
        let Some(path) = Self::ports_path() else {
            anyhow::bail!("No configuration directory available");
        };

        let mut known = fs::read_to_string(&path)
            .ok()
            .and_then(|content| toml::from_str::<KnownDevices>(&content).ok())
            .unwrap_or_default();
        known.usb_device.push(UsbDevice { vid, pid });

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(&known)?)?;
        info!("Saved USB device to {}", path.display());

        self.usb_device.push(UsbDevice { vid, pid });
        Ok(())
    }
}
