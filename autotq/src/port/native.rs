//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::trace,
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    ///
    /// The port is opened 8N1 with no flow control, and DTR/RTS are
    /// deasserted immediately: the ESP32-S3 auto-reset circuit interprets a
    /// DTR/RTS toggle as a reset-to-bootloader request, which would kill an
    /// in-progress session.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        let mut native = Self {
            port: Some(port),
            name: config.port_name.clone(),
            timeout: config.timeout,
        };
        native.set_dtr(false)?;
        native.set_rts(false)?;

        Ok(native)
    }

    /// Create a second handle onto the same OS port for a background reader
    /// thread. Writes keep going through the original handle.
    pub fn try_clone_reader(&self) -> Result<Self> {
        let cloned = self
            .port
            .as_ref()
            .ok_or_else(|| closed_error())?
            .try_clone()?;
        Ok(Self {
            port: Some(cloned),
            name: self.name.clone(),
            timeout: self.timeout,
        })
    }
}

fn closed_error() -> crate::Error {
    crate::Error::Serial(serialport::Error::new(
        serialport::ErrorKind::NoDevice,
        "Port is closed",
    ))
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        if let Some(ref mut p) = self.port {
            p.write_data_terminal_ready(level)?;
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("Setting RTS to {level}");
        if let Some(ref mut p) = self.port {
            p.write_request_to_send(level)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        self.port.take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_port_read_fails() {
        let mut port = NativePort {
            port: None,
            name: "test".to_string(),
            timeout: Duration::from_secs(1),
        };
        let mut buf = [0u8; 4];
        assert!(port.read(&mut buf).is_err());
        assert!(port.write(b"x").is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let mut port = NativePort {
            port: None,
            name: "test".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(port.close().is_ok());
        assert!(port.close().is_ok());
    }
}
