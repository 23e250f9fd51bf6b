//! Byte-stream transport to the device.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info};

/// Duplex byte stream with a read timeout.
///
/// `read` never fails on timeout; it returns whatever arrived, possibly
/// nothing.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;
    fn read(&mut self, max_bytes: usize) -> io::Result<Vec<u8>>;
    fn clear_input_buffer(&mut self) -> io::Result<()>;
    fn timeout(&self) -> Duration;
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    /// Releases the underlying handle. Calling it twice is harmless.
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn read(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
        (**self).read(max_bytes)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        (**self).clear_input_buffer()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).set_timeout(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// A UART opened through `serialport`.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
}

impl SerialTransport {
    pub fn open(name: &str, baud_rate: u32, timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(io::Error::from)?;
        info!(port = name, baud_rate, "connected");
        Ok(Self {
            port: Some(port),
            name: name.to_string(),
            timeout,
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(bytes.len())
    }

    fn read(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let port = self.port()?;
        let mut buf = vec![0u8; max_bytes];
        let mut filled = 0;
        while filled < max_bytes && Instant::now() < deadline {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port()?.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port()?.set_timeout(timeout).map_err(io::Error::from)?;
        self.timeout = timeout;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.name, "serial port closed");
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
