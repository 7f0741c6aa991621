//! Device information command.

use anyhow::Result;
use console::style;
use pubflash::DeviceInfo;

use crate::config::Config;
use crate::{Cli, LogTarget, attach_printer, open_session, with_connection};

/// Label/value rows shown for a device, `N/A` for missing values.
pub(crate) fn info_rows(info: &DeviceInfo) -> Vec<(&'static str, String)> {
    let value = |field: &Option<String>| field.clone().unwrap_or_else(|| "N/A".to_string());
    vec![
        ("Chip", value(&info.chip_id)),
        ("MAC address", value(&info.mac_address)),
        ("Firmware version", value(&info.firmware_version)),
        ("Firmware variant", value(&info.firmware_variant)),
        ("Hardware revision", value(&info.hardware_revision)),
    ]
}

/// Connect, print the device identity and disconnect.
pub(crate) fn cmd_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session = open_session(cli, config)?;
    if !cli.quiet {
        attach_printer(session.sink(), LogTarget::Stderr);
    }

    let info = with_connection(cli, &session, |session| Ok(session.device_info()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}", style("Device Information").bold().underlined());
    for (label, value) in info_rows(&info) {
        let label = format!("{label}:");
        println!("  {} {}", style(format!("{label:<18}")).dim(), style(value).cyan());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_rows_fill_missing_values() {
        let mut info = DeviceInfo::connected("ESP32-S3", "DC:54:75:AA:BB:CC");
        info.firmware_version = Some("1.2.3".to_string());

        let rows = info_rows(&info);
        assert_eq!(rows[0], ("Chip", "ESP32-S3".to_string()));
        assert_eq!(rows[1], ("MAC address", "DC:54:75:AA:BB:CC".to_string()));
        assert_eq!(rows[2], ("Firmware version", "1.2.3".to_string()));
        assert_eq!(rows[3], ("Firmware variant", "N/A".to_string()));
        assert_eq!(rows[4], ("Hardware revision", "N/A".to_string()));
    }
}
