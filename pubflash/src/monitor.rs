//! Background serial monitor loop.
//!
//! The loop polls the shared transport with a short read timeout and feeds
//! every non-empty chunk into the [`LineDemultiplexer`]. It ends when
//! [`SerialMonitor::stop`] clears the run flag (checked between reads), when
//! the transport reports end of stream, or when a read fails.

use crate::demux::LineDemultiplexer;
use crate::error::Result;
use crate::sink::lock;
use crate::transport::SharedTransport;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// Gap between polls so writers can take the transport lock.
const POLL_GAP: Duration = Duration::from_millis(1);

/// Handle to a running monitor loop.
#[derive(Debug)]
pub struct SerialMonitor {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SerialMonitor {
    /// Spawn the read loop.
    pub fn start(
        transport: SharedTransport,
        demux: LineDemultiplexer,
        read_timeout: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("pubflash-monitor".to_string())
            .spawn(move || run(&transport, &demux, &flag, read_timeout))?;

        debug!("Serial monitor started");
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Whether the loop is still reading.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the loop to stop and wait for it to finish its current read.
    ///
    /// Safe to call from the monitor thread itself (it then only clears the flag).
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Serial monitor thread panicked");
            }
            debug!("Serial monitor stopped");
        }
    }
}

impl Drop for SerialMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    transport: &SharedTransport,
    demux: &LineDemultiplexer,
    running: &AtomicBool,
    read_timeout: Duration,
) {
    while running.load(Ordering::Acquire) {
        let chunk = lock(transport).raw_read(read_timeout);
        match chunk {
            Ok(Some(bytes)) => {
                if !bytes.is_empty() {
                    demux.push_bytes(&bytes);
                }
            },
            Ok(None) => {
                debug!("Transport closed, monitor loop ending");
                break;
            },
            Err(err) => {
                warn!("Serial read failed: {err}");
                demux.chain().sink().error(format!("Serial monitor stopped: {err}"));
                break;
            },
        }
        thread::sleep(POLL_GAP);
    }
    running.store(false, Ordering::Release);
}
