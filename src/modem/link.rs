//! Byte-level command channel underneath a modem.
//!
//! A link is half duplex from the driver's point of view: clear stale input, write a
//! command, then poll `read` until a final result code shows up or the attempt budget
//! runs out. `read` returning `Ok(0)` means nothing arrived within the link's timeout.

use std::io;

#[cfg(feature = "serial")]
use log::debug;
#[cfg(feature = "serial")]
use std::time::Duration;

/// Raw transport used by [`GsmModem`](super::GsmModem).
pub trait SerialLink: Send {
    /// Discard anything the device sent before the next command.
    fn clear_input(&mut self) -> io::Result<()>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Read whatever arrived within the link timeout. Timeouts are `Ok(0)`, not errors.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<L: SerialLink + ?Sized> SerialLink for Box<L> {
    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear_input()
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }
}

/// A serial port opened through the `serialport` crate (8N1).
#[cfg(feature = "serial")]
pub struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl SerialPortLink {
    pub fn open(port_name: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<Self> {
        debug!(
            "Opening serial port {} at {} baud (read timeout {:?})",
            port_name, baud_rate, read_timeout
        );
        let mut builder = serialport::new(port_name, baud_rate).timeout(read_timeout);
        // Some USB serial adapters need explicit settings
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let port = builder.open().map_err(io::Error::from)?;
        Ok(Self { port })
    }
}

#[cfg(feature = "serial")]
impl SerialLink for SerialPortLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.port, bytes)?;
        io::Write::flush(&mut self.port)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match io::Read::read(&mut self.port, buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            // EINTR shows up during shutdown signals
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}
