//! Console monitor and one-shot command sending.
//!
//! The device console arrives through the session's log sink, so both
//! commands just print sink entries to stdout while connected. Status and
//! hint lines go to stderr to keep stdout script friendly.

use anyhow::Result;
use console::style;
use log::debug;
use std::io::{self, BufRead as _};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::{
    Cli, LogTarget, attach_printer, install_interrupt_handler, open_session, was_interrupted,
    with_connection,
};

/// How often the monitor loop checks for Ctrl-C.
const TICK: Duration = Duration::from_millis(100);

/// The command to send for one line of user input, if any.
fn command_from_input(input: &str) -> Option<&str> {
    let command = input.trim();
    (!command.is_empty()).then_some(command)
}

/// Read stdin lines on a helper thread.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("pubflash-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        debug!("stdin reader unavailable: {e}");
    }
    rx
}

/// Stream the device console until Ctrl-C; stdin lines are sent as commands.
pub(crate) fn cmd_monitor(cli: &Cli, config: &mut Config) -> Result<()> {
    install_interrupt_handler();
    let session = open_session(cli, config)?;
    attach_printer(session.sink(), LogTarget::Stdout);

    if !cli.quiet {
        eprintln!("{} Connecting to the device console", style("📡").cyan());
        eprintln!("{}", style("Type a command and press Enter to send it. Press Ctrl-C to exit.").dim());
    }

    with_connection(cli, &session, |session| {
        let mut input = Some(spawn_stdin_reader());
        while !was_interrupted() {
            let Some(rx) = &input else {
                thread::sleep(TICK);
                continue;
            };
            match rx.recv_timeout(TICK) {
                Ok(line) => {
                    if let Some(command) = command_from_input(&line) {
                        // Failures are already in the log.
                        let _ = session.send_command(command);
                    }
                },
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("stdin closed, monitoring until Ctrl-C");
                    input = None;
                },
            }
        }
        if !cli.quiet {
            eprintln!();
            eprintln!("{} Monitor closed", style("✓").green());
        }
        Ok(())
    })
}

/// Connect, send one command, show the response for `wait_ms`, disconnect.
pub(crate) fn cmd_send(cli: &Cli, config: &mut Config, command: &str, wait_ms: u64) -> Result<()> {
    let command = command_from_input(command)
        .ok_or_else(|| crate::CliError::Usage("The command is empty".to_string()))?
        .to_string();

    let session = open_session(cli, config)?;
    attach_printer(session.sink(), LogTarget::Stdout);

    with_connection(cli, &session, |session| {
        session.send_command(&command)?;
        thread::sleep(Duration::from_millis(wait_ms));
        Ok(())
    })
}
