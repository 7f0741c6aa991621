//! In-memory collaborators for unit tests.

use crate::error::{Error, Result};
use crate::image::FlashImage;
use crate::programmer::{Connector, Programmer, ProgrammerOutput, WriteProgress};
use crate::sink::lock;
use crate::transport::{SharedTransport, Transport};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct TransportState {
    open: bool,
    remote_closed: bool,
    fail_reads: bool,
    fail_writes: bool,
    fail_disconnect: bool,
    fail_connect: bool,
    incoming: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    replies: HashMap<String, Vec<u8>>,
    connects: Vec<u32>,
    disconnects: usize,
    reads: usize,
}

/// Scriptable transport. Clones share state, so tests keep a handle.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn open() -> Self {
        let fake = Self::default();
        lock(&fake.state).open = true;
        fake
    }

    pub fn feed(&self, chunk: &[u8]) {
        lock(&self.state).incoming.push_back(chunk.to_vec());
    }

    /// Queue `response` whenever `command` is written.
    pub fn reply(&self, command: &str, response: &str) {
        lock(&self.state)
            .replies
            .insert(command.to_string(), response.as_bytes().to_vec());
    }

    pub fn close_remote(&self) {
        lock(&self.state).remote_closed = true;
    }

    pub fn fail_reads(&self) {
        lock(&self.state).fail_reads = true;
    }

    pub fn fail_writes(&self) {
        lock(&self.state).fail_writes = true;
    }

    pub fn fail_disconnect(&self) {
        lock(&self.state).fail_disconnect = true;
    }

    pub fn fail_connect(&self) {
        lock(&self.state).fail_connect = true;
    }

    pub fn written(&self) -> Vec<String> {
        lock(&self.state)
            .written
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    pub fn connects(&self) -> Vec<u32> {
        lock(&self.state).connects.clone()
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn read_count(&self) -> usize {
        lock(&self.state).reads
    }

    pub fn is_open_now(&self) -> bool {
        lock(&self.state).open
    }
}

impl Transport for FakeTransport {
    fn name(&self) -> &str {
        "fake0"
    }

    fn baud_rate(&self) -> u32 {
        lock(&self.state).connects.last().copied().unwrap_or(115200)
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn connect(&mut self, baud_rate: u32) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_connect {
            return Err(io::Error::new(io::ErrorKind::NotFound, "port vanished").into());
        }
        state.open = true;
        state.remote_closed = false;
        state.connects.push(baud_rate);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.open = false;
        state.disconnects += 1;
        if state.fail_disconnect {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "already gone").into());
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed").into());
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed").into());
        }
        state.written.push(data.to_vec());
        let command = String::from_utf8_lossy(data).trim().to_string();
        if let Some(reply) = state.replies.get(&command).cloned() {
            state.incoming.push_back(reply);
        }
        Ok(())
    }

    fn raw_read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        {
            let mut state = lock(&self.state);
            state.reads += 1;
            if state.fail_reads {
                return Err(io::Error::other("read failed").into());
            }
            if !state.open || state.remote_closed {
                return Ok(None);
            }
            if let Some(chunk) = state.incoming.pop_front() {
                return Ok(Some(chunk));
            }
        }
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(Some(Vec::new()))
    }
}

/// Which programmer step should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Handshake,
    Erase,
    Write,
    Reset,
}

#[derive(Default)]
struct ProgrammerState {
    calls: Vec<String>,
    fail_at: Option<FailAt>,
}

/// Scriptable programmer recording the operations it was asked to do.
#[derive(Clone, Default)]
pub struct FakeProgrammer {
    state: Arc<Mutex<ProgrammerState>>,
    output: Option<ProgrammerOutput>,
}

impl FakeProgrammer {
    pub fn fail_at(&self, step: FailAt) {
        lock(&self.state).fail_at = Some(step);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn step(&self, name: &str, step: Option<FailAt>) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(name.to_string());
        if step.is_some() && state.fail_at == step {
            return Err(match step {
                Some(FailAt::Handshake) => Error::HandshakeFailed("no sync reply".into()),
                _ => Error::Programmer(format!("{name} failed")),
            });
        }
        Ok(())
    }
}

impl Programmer for FakeProgrammer {
    fn handshake_and_sync(&mut self) -> Result<()> {
        self.step("sync", Some(FailAt::Handshake))?;
        if let Some(output) = &self.output {
            output("Connecting....");
        }
        Ok(())
    }

    fn chip_description(&mut self) -> Result<String> {
        self.step("chip", None)?;
        Ok("esp32-s3 (revision v0.2)".to_string())
    }

    fn read_mac(&mut self) -> Result<String> {
        self.step("mac", None)?;
        Ok("dc:54:75:aa:bb:cc".to_string())
    }

    fn chip_features(&mut self) -> Result<Option<String>> {
        Ok(Some("Wi-Fi, BLE".to_string()))
    }

    fn erase_flash(&mut self) -> Result<()> {
        self.step("erase", Some(FailAt::Erase))
    }

    fn write_flash(&mut self, images: &[FlashImage], progress: WriteProgress<'_>) -> Result<()> {
        for (index, image) in images.iter().enumerate() {
            let total = image.len();
            progress(index, 0, total);
            progress(index, total / 2, total);
            if index == images.len() - 1 {
                self.step("write", Some(FailAt::Write))?;
            }
            progress(index, total, total);
        }
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<()> {
        self.step("reset", Some(FailAt::Reset))
    }
}

/// Connector handing out a [`FakeTransport`] and a [`FakeProgrammer`].
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub transport: FakeTransport,
    pub programmer: FakeProgrammer,
    pub unavailable: bool,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            transport: FakeTransport::closed(),
            ..Self::default()
        }
    }
}

impl Connector for FakeConnector {
    fn request_port(&self) -> Result<Box<dyn Transport>> {
        if self.unavailable {
            return Err(Error::TransportUnavailable("no port selected".into()));
        }
        Ok(Box::new(self.transport.clone()))
    }

    fn programmer(
        &self,
        _transport: SharedTransport,
        output: ProgrammerOutput,
    ) -> Result<Box<dyn Programmer>> {
        Ok(Box::new(FakeProgrammer {
            state: Arc::clone(&self.programmer.state),
            output: Some(output),
        }))
    }
}
