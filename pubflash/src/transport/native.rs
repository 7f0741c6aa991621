//! Native serial transport using the `serialport` crate.

use {
    crate::{
        error::Result,
        transport::{DataBits, FlowControl, Parity, SerialConfig, StopBits, Transport},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{ErrorKind, Read, Write},
        time::Duration,
    },
};

const READ_CHUNK: usize = 1024;

/// Serial port transport for Linux, macOS and Windows.
///
/// Created closed; [`Transport::connect`] opens it.
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    config: SerialConfig,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("config", &self.config)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialTransport {
    /// Create a closed transport for the given configuration.
    pub fn new(config: SerialConfig) -> Self {
        Self { port: None, config }
    }

    /// Create and immediately open a transport.
    pub fn open(config: SerialConfig) -> Result<Self> {
        let mut transport = Self::new(config);
        let baud = transport.config.baud_rate;
        transport.connect(baud)?;
        Ok(transport)
    }

    /// The configuration used to (re)open the port.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn connect(&mut self, baud_rate: u32) -> Result<()> {
        self.port.take();
        self.config.baud_rate = baud_rate;

        debug!("Opening {} at {baud_rate} baud", self.config.port_name);
        let mut port = serialport::new(&self.config.port_name, baud_rate)
            .timeout(self.config.timeout)
            .data_bits(self.config.data_bits.into())
            .parity(self.config.parity.into())
            .stop_bits(self.config.stop_bits.into())
            .flow_control(self.config.flow_control.into())
            .open()?;
        port.clear(ClearBuffer::Input)?;

        self.port = Some(port);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Closed {}", self.config.port_name);
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or_else(|| {
            std::io::Error::new(ErrorKind::NotConnected, "serial port is closed")
        })?;
        trace!("TX {} bytes", data.len());
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn raw_read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let Some(port) = self.port.as_mut() else {
            return Ok(None);
        };
        port.set_timeout(timeout)?;

        let mut buf = [0u8; READ_CHUNK];
        match port.read(&mut buf) {
            Ok(n) => {
                trace!("RX {n} bytes");
                Ok(Some(buf[..n].to_vec()))
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Ok(Some(Vec::new()))
            },
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!("{} went away: {e}", self.config.port_name);
                self.port = None;
                Ok(None)
            },
            Err(e) => Err(e.into()),
        }
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transport_is_closed() {
        let mut transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB9", 115200));
        assert!(!transport.is_open());
        assert_eq!(transport.name(), "/dev/ttyUSB9");
        assert!(transport.disconnect().is_ok());
        assert!(transport.raw_read(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn test_write_on_closed_transport_fails() {
        let mut transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB9", 115200));
        assert!(transport.write(b"version\n").is_err());
    }

    #[test]
    fn test_connect_to_missing_port_fails() {
        let mut transport =
            SerialTransport::new(SerialConfig::new("/dev/pubflash-does-not-exist", 115200));
        assert!(transport.connect(115200).is_err());
        assert!(!transport.is_open());
    }
}
