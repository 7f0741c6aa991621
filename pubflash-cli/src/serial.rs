//! Interactive serial port selection.
//!
//! Picks the device port the way espflash does:
//! - Auto-detection of known USB bridges and remembered devices
//! - Interactive selection via dialoguer when several candidates exist
//! - Remembering the selected device in configuration
//! - Non-interactive mode for CI/CD

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    pubflash::{DetectedPort, detect_ports, select_port},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
}

/// Result of port selection including whether it was a known device.
#[derive(Debug)]
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Select a serial port from options, config, detection or a prompt.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    if let Some(port_name) = &config.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    choose_port(detect_ports(), options, config)
}

fn choose_port(ports: Vec<DetectedPort>, options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if ports.is_empty() {
        return Err(usage_err("No serial ports found. Is the device plugged in?"));
    }

    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    let candidates = if known.is_empty() { ports } else { known };

    if options.non_interactive {
        return match candidates.len() {
            1 => selected(candidates, config),
            _ => Err(usage_err(
                "Found multiple serial ports; pass --port to choose one in non-interactive mode",
            )),
        };
    }

    if candidates.len() == 1 {
        let selection = selected(candidates, config)?;
        if selection.is_known {
            info!(
                "Auto-selected port: {} [{}]",
                selection.port.name,
                selection.port.device.name()
            );
            return Ok(selection);
        }
        ensure_interactive_terminal()?;
        return confirm_single_port(selection.port);
    }

    ensure_interactive_terminal()?;
    select_port_interactive(candidates, config)
}

fn selected(candidates: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    let port = select_port(candidates)?;
    Ok(SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    })
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port instead",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

/// Resolve an explicitly named port against the detected list.
fn find_port_by_name(name: &str, ports: Vec<DetectedPort>) -> SelectedPort {
    let found = ports
        .into_iter()
        .find(|p| p.name == name || p.name.eq_ignore_ascii_case(name));

    match found {
        Some(port) => SelectedPort {
            is_known: port.device.is_known(),
            port,
        },
        // Not enumerated (e.g. a pty), but the user asked for it.
        None => SelectedPort {
            port: DetectedPort::plain(name),
            is_known: false,
        },
    }
}

/// Check if a port matches a known device (built-in list or config).
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }
    matches!((port.vid, port.pid), (Some(vid), Some(pid)) if config.knows_device(vid, pid))
}

fn port_label(port: &DetectedPort, known: bool) -> String {
    let name = if known {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

/// Interactive port selection.
fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!("{}", style("Ports with recognised USB bridges are shown in bold").dim());

    ports.sort_by_key(|p| !is_known_device(p, config));

    // Truncate labels so narrow terminals do not wrap the menu.
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| port_label(port, is_known_device(port, config)))
        .map(|label| console::truncate_str(&label, max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the device port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

/// Confirm use of a single unrecognised port.
fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(CliError::Cancelled("Port selection cancelled".to_string()).into())
    }
}

/// Ask user if they want to remember this port's USB device.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.knows_device(vid, pid) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this device for future auto-detection?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}
