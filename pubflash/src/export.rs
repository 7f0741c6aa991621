//! Plain-text log export.

use crate::session::DeviceInfo;
use crate::sink::{LogEntry, Severity};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;

const MISSING: &str = "N/A";

/// Render the device header and the entries whose severity is in `severities`.
pub fn export_log(entries: &[LogEntry], info: &DeviceInfo, severities: &[Severity]) -> String {
    let mut out = String::new();

    if info.connected {
        let field = |value: &Option<String>| value.clone().unwrap_or_else(|| MISSING.to_string());
        let _ = writeln!(out, "Device Information:");
        let _ = writeln!(out, "- Chip ID: {}", field(&info.chip_id));
        let _ = writeln!(out, "- MAC Address: {}", field(&info.mac_address));
        let _ = writeln!(out, "- Firmware Version: {}", field(&info.firmware_version));
        let _ = writeln!(out, "- Firmware Variant: {}", field(&info.firmware_variant));
        let _ = writeln!(out, "- Hardware Revision: {}", field(&info.hardware_revision));
    } else {
        let _ = writeln!(out, "Device not connected");
    }
    out.push_str("\nTerminal Logs:\n");

    let lines: Vec<String> = entries
        .iter()
        .filter(|entry| severities.contains(&entry.severity()))
        .map(|entry| {
            format!(
                "[{}] {}: {}",
                entry.time_label(),
                entry.severity().as_str().to_uppercase(),
                entry.message()
            )
        })
        .collect();
    out.push_str(&lines.join("\n"));
    out
}

/// Default export file name, e.g. `pubmote-2024-05-01T09-30-00.log`.
pub fn export_file_name(now: DateTime<Utc>) -> String {
    format!("pubmote-{}.log", now.format("%Y-%m-%dT%H-%M-%S"))
}
