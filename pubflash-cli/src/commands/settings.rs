//! Device settings commands.

use anyhow::Result;
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use pubflash::DeviceSettings;
use std::io::IsTerminal;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, LogTarget, SettingsAction, attach_printer, open_session, with_connection};

/// Time left for the device to act on a fire-and-forget command before disconnecting.
const COMMAND_SETTLE: Duration = Duration::from_millis(500);

fn confirm_factory_reset(cli: &Cli) -> Result<()> {
    if cli.non_interactive || !std::io::stdin().is_terminal() {
        return Ok(());
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Erase all settings on the device?")
        .default(false)
        .interact_opt()
        .map_err(|e| CliError::Usage(format!("Prompt failed: {e}")))?
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("Factory reset cancelled".to_string()).into())
    }
}

/// Run a `settings` subcommand.
pub(crate) fn cmd_settings(cli: &Cli, config: &mut Config, action: &SettingsAction) -> Result<()> {
    if matches!(action, SettingsAction::FactoryReset) {
        confirm_factory_reset(cli)?;
    }

    let session = open_session(cli, config)?;
    if !cli.quiet {
        attach_printer(session.sink(), LogTarget::Stderr);
    }

    match action {
        SettingsAction::Get { json } => {
            let settings = with_connection(cli, &session, |session| {
                session.retrieve_settings().map_err(anyhow::Error::from)
            })?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                println!("{}", style("Device Settings").bold().underlined());
                println!("  {} {}", style("Wi-Fi SSID:    ").dim(), style(&settings.wifi_ssid).cyan());
                println!("  {} {}", style("Wi-Fi password:").dim(), style(&settings.wifi_password).cyan());
            }
        },
        SettingsAction::Set { ssid, password } => {
            let settings = DeviceSettings {
                wifi_ssid: ssid.clone(),
                wifi_password: password.clone(),
            };
            with_connection(cli, &session, |session| {
                session.save_settings(&settings)?;
                thread::sleep(COMMAND_SETTLE);
                Ok(())
            })?;
            if !cli.quiet {
                eprintln!("{} Settings saved", style("✓").green());
            }
        },
        SettingsAction::FactoryReset => {
            with_connection(cli, &session, |session| {
                session.factory_reset()?;
                thread::sleep(COMMAND_SETTLE);
                Ok(())
            })?;
            if !cli.quiet {
                eprintln!("{} Factory reset sent", style("✓").green());
            }
        },
    }
    Ok(())
}
