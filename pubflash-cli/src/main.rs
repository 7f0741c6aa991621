//! pubflash CLI - serial console and firmware flasher for PubRemote devices.
//!
//! ## Features
//!
//! - Connect to a PubRemote over USB serial and show its identity
//! - Stream the device console and send commands
//! - Flash bootloader, partition table and application images via espflash
//! - Read and write the device's Wi-Fi settings
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use pubflash::{
    DeviceSession, LogEntry, LogSink, Severity, SubscriptionId, auto_detect_port, detect_ports,
    export_file_name,
};
use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod flasher;
mod serial;

use config::Config;
use flasher::CliConnector;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Turn Ctrl-C into a flag the monitor loop polls, so it can disconnect cleanly.
pub(crate) fn install_interrupt_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
            debug!("Could not install Ctrl-C handler: {e}");
        }
    });
}

/// Whether Ctrl-C was pressed since the handler was installed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that map to dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled a prompt or pressed Ctrl-C (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// pubflash - serial console and firmware flasher for PubRemote devices.
///
/// Environment variables:
///   PUBFLASH_PORT              - Default serial port
///   PUBFLASH_BAUD              - Console baud rate (default: 115200)
///   PUBFLASH_FLASH_BAUD        - Baud rate for writing flash
///   PUBFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "pubflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "For more information, visit: https://github.com/contactsimonwilson/pubremote")]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "PUBFLASH_PORT")]
    port: Option<String>,

    /// Console baud rate.
    #[arg(short, long, global = true, env = "PUBFLASH_BAUD")]
    baud: Option<u32>,

    /// Baud rate for talking to the bootloader while flashing.
    #[arg(long, global = true, env = "PUBFLASH_FLASH_BAUD", value_name = "BAUD")]
    flash_baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "PUBFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Export the session log to this file (or directory) on exit.
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Connect and show device information.
    Info {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Stream the device console; each stdin line is sent as a command.
    Monitor,

    /// Send one console command and show the response.
    Send {
        /// Command words, joined with spaces.
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,

        /// How long to show device output after sending (ms).
        #[arg(long, default_value_t = 2000, value_name = "MS")]
        wait: u64,
    },

    /// Flash firmware images.
    Flash {
        /// Bootloader image (written at 0x0).
        #[arg(long, value_name = "FILE")]
        bootloader: Option<PathBuf>,

        /// Partition table image (written at 0x8000).
        #[arg(long, value_name = "FILE")]
        partition_table: Option<PathBuf>,

        /// Application image (written at 0x10000).
        #[arg(long, value_name = "FILE")]
        application: Option<PathBuf>,

        /// Do not erase the flash before writing.
        #[arg(long)]
        no_erase: bool,

        /// Open the serial monitor after flashing.
        #[arg(long)]
        monitor: bool,
    },

    /// Read or change device settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show the stored Wi-Fi settings.
    Get {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Store new Wi-Fi settings.
    Set {
        /// Wi-Fi network name.
        #[arg(long)]
        ssid: String,

        /// Wi-Fi password.
        #[arg(long)]
        password: String,
    },

    /// Erase all settings on the device.
    FactoryReset,
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection (clig.dev best practice) ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "pubflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code(&err)
        },
    }
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => ExitCode::from(2),
        Some(CliError::Cancelled(_)) => ExitCode::from(130),
        None => ExitCode::FAILURE,
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_with_override(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Info { json } => commands::info::cmd_info(cli, &mut config, *json),
        Commands::Monitor => commands::monitor::cmd_monitor(cli, &mut config),
        Commands::Send { command, wait } => {
            commands::monitor::cmd_send(cli, &mut config, &command.join(" "), *wait)
        },
        Commands::Flash {
            bootloader,
            partition_table,
            application,
            no_erase,
            monitor,
        } => {
            let images = commands::flash::ImagePaths {
                bootloader: bootloader.as_deref(),
                partition_table: partition_table.as_deref(),
                application: application.as_deref(),
            };
            commands::flash::cmd_flash(cli, &mut config, &images, *no_erase)?;
            if *monitor {
                eprintln!();
                commands::monitor::cmd_monitor(cli, &mut config)?;
            }
            Ok(())
        },
        Commands::Settings { action } => commands::settings::cmd_settings(cli, &mut config, action),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Get serial port from CLI args, config or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Build a session for the selected port, not yet connected.
pub(crate) fn open_session(cli: &Cli, config: &mut Config) -> Result<DeviceSession> {
    let port = get_port(cli, config)?;
    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(pubflash::transport::DEFAULT_BAUD_RATE);

    let flash_baud = cli.flash_baud.or(config.flash.baud);

    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port).green(),
            baud
        );
    }

    let connector = CliConnector::new(&port, baud, flash_baud);
    Ok(DeviceSession::new(Arc::new(connector), config.session_config(baud)))
}

/// Connect `session`, run `action`, export the log, then always disconnect.
///
/// The log is exported while the identity is still known.
pub(crate) fn with_connection<T>(
    cli: &Cli,
    session: &DeviceSession,
    action: impl FnOnce(&DeviceSession) -> Result<T>,
) -> Result<T> {
    let result = session
        .connect()
        .context("Failed to connect to the device")
        .and_then(|_| action(session));
    let exported = export_session_log(cli, session);
    session.disconnect();
    exported?;
    result
}

/// Where rendered log entries go.
#[derive(Clone)]
pub(crate) enum LogTarget {
    /// Device console output (monitor, send).
    Stdout,
    /// Status output that must keep stdout clean.
    Stderr,
    /// Above an active progress bar.
    Progress(indicatif::ProgressBar),
}

/// Render one log entry for the terminal.
pub(crate) fn format_entry(entry: &LogEntry) -> String {
    let time = style(format!("[{}]", entry.time_label())).dim();
    let message = match entry.severity() {
        Severity::Info => style(entry.message().to_string()),
        Severity::Error => style(entry.message().to_string()).red(),
        Severity::Success => style(entry.message().to_string()).green(),
    };
    format!("{time} {message}")
}

/// Print every new sink entry to `target`.
pub(crate) fn attach_printer(sink: &LogSink, target: LogTarget) -> SubscriptionId {
    sink.subscribe(move |entry| {
        let Some(entry) = entry else {
            return;
        };
        let line = format_entry(entry);
        match &target {
            LogTarget::Stdout => {
                let mut stdout = io::stdout().lock();
                let _ = writeln!(stdout, "{line}");
                let _ = stdout.flush();
            },
            LogTarget::Stderr => eprintln!("{line}"),
            LogTarget::Progress(pb) => {
                if entry.message().starts_with("Writing ") && entry.message().ends_with('%') {
                    pb.set_message(entry.message().to_string());
                } else {
                    pb.println(line);
                }
            },
        }
    })
}

/// Resolve `--log-file`: a directory gets a timestamped file name.
fn log_file_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(export_file_name(Utc::now()))
    } else {
        path.to_path_buf()
    }
}

/// Write the session log to `--log-file`, if requested.
pub(crate) fn export_session_log(cli: &Cli, session: &DeviceSession) -> Result<()> {
    let Some(path) = &cli.log_file else {
        return Ok(());
    };
    let path = log_file_path(path);
    fs::write(&path, session.export(&Severity::ALL))
        .with_context(|| format!("Failed to write log file {}", path.display()))?;
    if !cli.quiet {
        eprintln!("{} Log saved to {}", style("📝").cyan(), path.display());
    }
    Ok(())
}

fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        println!("{}", serde_json::to_string_pretty(&detected)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };

        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device_type,
            vid_pid,
            product
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "pubflash",
            "--port",
            "/dev/ttyACM0",
            "flash",
            "--bootloader",
            "bootloader.bin",
            "--partition-table",
            "partitions.bin",
            "--application",
            "app.bin",
            "--no-erase",
            "--monitor",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        match cli.command {
            Commands::Flash {
                bootloader,
                partition_table,
                application,
                no_erase,
                monitor,
            } => {
                assert_eq!(bootloader, Some(PathBuf::from("bootloader.bin")));
                assert_eq!(partition_table, Some(PathBuf::from("partitions.bin")));
                assert_eq!(application, Some(PathBuf::from("app.bin")));
                assert!(no_erase);
                assert!(monitor);
            },
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_cli_parse_send_joins_words() {
        let cli = Cli::try_parse_from(["pubflash", "send", "save_settings", "wifi_ssid", "x"]).unwrap();
        match cli.command {
            Commands::Send { command, wait } => {
                assert_eq!(command.join(" "), "save_settings wifi_ssid x");
                assert_eq!(wait, 2000);
            },
            _ => panic!("expected send"),
        }
        assert!(Cli::try_parse_from(["pubflash", "send"]).is_err());
    }

    #[test]
    fn test_cli_parse_settings() {
        let cli = Cli::try_parse_from([
            "pubflash", "settings", "set", "--ssid", "home", "--password", "secret",
        ])
        .unwrap();
        match cli.command {
            Commands::Settings {
                action: SettingsAction::Set { ssid, password },
            } => {
                assert_eq!(ssid, "home");
                assert_eq!(password, "secret");
            },
            _ => panic!("expected settings set"),
        }

        let cli = Cli::try_parse_from(["pubflash", "settings", "factory-reset"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Settings {
                action: SettingsAction::FactoryReset
            }
        ));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "pubflash",
            "info",
            "--json",
            "-vv",
            "--baud",
            "460800",
            "--flash-baud",
            "921600",
            "--log-file",
            "logs",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.baud, Some(460800));
        assert_eq!(cli.flash_baud, Some(921600));
        assert_eq!(cli.log_file, Some(PathBuf::from("logs")));
        assert!(matches!(cli.command, Commands::Info { json: true }));
    }

    #[test]
    fn test_exit_code_classification() {
        let usage: anyhow::Error = CliError::Usage("bad".into()).into();
        let cancelled: anyhow::Error = CliError::Cancelled("stop".into()).into();
        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code(&usage), ExitCode::from(2));
        assert_eq!(exit_code(&cancelled), ExitCode::from(130));
        assert_eq!(exit_code(&other), ExitCode::FAILURE);
    }

    #[test]
    fn test_log_file_path_for_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_file_path(dir.path());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("pubmote-"));
        assert!(name.ends_with(".log"));

        let file = dir.path().join("session.log");
        assert_eq!(log_file_path(&file), file);
    }

    #[test]
    fn test_format_entry_contains_message() {
        let entry = LogEntry::new("Device ready", Severity::Success);
        let line = console::strip_ansi_codes(&format_entry(&entry)).into_owned();
        assert!(line.ends_with("] Device ready"));
        assert!(line.starts_with('['));
    }
}
