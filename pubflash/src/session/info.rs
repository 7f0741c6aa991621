//! Device identity and settings records.

use crate::correlator::Fields;

/// Placeholder for identity fields the device did not report.
pub const UNKNOWN: &str = "Unknown";

/// Last known identity of the connected device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// Whether a session is established.
    pub connected: bool,
    /// Chip description reported by the programmer.
    pub chip_id: Option<String>,
    /// Factory MAC address.
    pub mac_address: Option<String>,
    /// Firmware version reported by the `version` command.
    pub firmware_version: Option<String>,
    /// Firmware variant reported by the `version` command.
    pub firmware_variant: Option<String>,
    /// Hardware revision reported by the `version` command.
    pub hardware_revision: Option<String>,
}

impl DeviceInfo {
    /// Identity of a freshly connected device, before the version query.
    pub fn connected(chip_id: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            connected: true,
            chip_id: Some(chip_id.into()),
            mac_address: Some(mac_address.into()),
            ..Self::default()
        }
    }

    /// Merge the fields of a `version` response.
    pub fn apply_version(&mut self, fields: &Fields) {
        if let Some(version) = fields.get("version") {
            self.firmware_version = Some(version.clone());
        }
        if let Some(variant) = fields.get("variant") {
            self.firmware_variant = Some(variant.clone());
        }
        if let Some(hardware) = fields.get("hardware") {
            self.hardware_revision = Some(hardware.clone());
        }
    }

    /// Fill missing version and variant with [`UNKNOWN`].
    pub fn fill_unknown(&mut self) {
        self.firmware_version
            .get_or_insert_with(|| UNKNOWN.to_string());
        self.firmware_variant
            .get_or_insert_with(|| UNKNOWN.to_string());
    }
}

/// Persistent device settings exposed by the `settings` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSettings {
    /// Wi-Fi network name.
    pub wifi_ssid: String,
    /// Wi-Fi password.
    pub wifi_password: String,
}

impl DeviceSettings {
    /// Build from a `settings` response. Missing fields become empty.
    pub fn from_fields(fields: &Fields) -> Self {
        Self {
            wifi_ssid: fields.get("wifi_ssid").cloned().unwrap_or_default(),
            wifi_password: fields.get("wifi_password").cloned().unwrap_or_default(),
        }
    }

    /// The `save_settings` command line that stores these values.
    pub fn to_command(&self) -> String {
        let mut command = String::from("save_settings");
        for (key, value) in [
            ("wifi_ssid", &self.wifi_ssid),
            ("wifi_password", &self.wifi_password),
        ] {
            command.push(' ');
            command.push_str(key);
            command.push_str(" \"");
            command.push_str(&quote(value));
            command.push('"');
        }
        command
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_apply_version_and_fill_unknown() {
        let mut info = DeviceInfo::connected("ESP32-S3", "AA:BB");
        info.apply_version(&fields(&[("version", "1.2.3")]));
        info.fill_unknown();

        assert_eq!(info.firmware_version.as_deref(), Some("1.2.3"));
        assert_eq!(info.firmware_variant.as_deref(), Some(UNKNOWN));
        assert_eq!(info.hardware_revision, None);
    }

    #[test]
    fn test_default_is_disconnected() {
        let info = DeviceInfo::default();
        assert!(!info.connected);
        assert!(info.chip_id.is_none());
    }

    #[test]
    fn test_settings_command() {
        let settings = DeviceSettings {
            wifi_ssid: "home net".into(),
            wifi_password: "pa\"ss\\".into(),
        };
        assert_eq!(
            settings.to_command(),
            r#"save_settings wifi_ssid "home net" wifi_password "pa\"ss\\""#
        );
    }

    #[test]
    fn test_settings_from_partial_fields() {
        let settings = DeviceSettings::from_fields(&fields(&[("wifi_ssid", "lab")]));
        assert_eq!(settings.wifi_ssid, "lab");
        assert!(settings.wifi_password.is_empty());
    }
}
