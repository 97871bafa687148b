//! Serial transport seam
//!
//! The link only needs a byte stream it can read with a short timeout and a
//! second handle to the same port for writing. `SystemPorts` opens real ports
//! through `serialport`; tests use the in-memory pair in `memory`.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::error::LinkError;

/// Port name and speed for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    pub port: String,
    pub baud_rate: u32,
}

impl PortSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

/// An open serial stream
///
/// Reads return `ErrorKind::TimedOut` when no byte arrives within the poll
/// interval, and `Ok(0)` once the other end is gone.
pub trait SerialStream: Read + Write + Send {
    /// Second handle to the same port, used for writes
    fn try_clone_stream(&self) -> io::Result<Box<dyn SerialStream>>;
}

/// Opens serial streams
pub trait PortOpener: Send + Sync {
    fn open(&self, settings: &PortSettings, poll: Duration)
        -> Result<Box<dyn SerialStream>, LinkError>;
}

impl SerialStream for Box<dyn SerialPort> {
    fn try_clone_stream(&self) -> io::Result<Box<dyn SerialStream>> {
        let clone = self
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Box::new(clone))
    }
}

/// Real serial ports: 8 data bits, no parity, one stop bit, no flow control
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(
        &self,
        settings: &PortSettings,
        poll: Duration,
    ) -> Result<Box<dyn SerialStream>, LinkError> {
        debug!(port = %settings.port, baud = settings.baud_rate, "Opening serial port");

        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(poll)
            .open()
            .map_err(|e| classify_open_error(&settings.port, &e))?;

        Ok(Box::new(port))
    }
}

/// Sort an open failure into busy / missing / other
///
/// Backends disagree on error kinds (Windows reports a busy port as
/// "access denied", Linux as EBUSY), so the description is checked too.
pub fn classify_open_error(port: &str, err: &serialport::Error) -> LinkError {
    let description = err.description.to_lowercase();
    let busy = description.contains("denied")
        || description.contains("busy")
        || description.contains("in use");

    match err.kind() {
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => LinkError::PortBusy {
            port: port.to_string(),
        },
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => LinkError::PortNotFound {
            port: port.to_string(),
        },
        _ if busy => LinkError::PortBusy {
            port: port.to_string(),
        },
        serialport::ErrorKind::NoDevice => LinkError::PortNotFound {
            port: port.to_string(),
        },
        _ => LinkError::Open {
            port: port.to_string(),
            reason: err.description.clone(),
        },
    }
}

/// Names of the serial ports currently present
pub fn list_ports() -> Result<Vec<String>, LinkError> {
    let ports = serialport::available_ports().map_err(|e| LinkError::Open {
        port: "*".to_string(),
        reason: e.description,
    })?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: serialport::ErrorKind, description: &str) -> serialport::Error {
        serialport::Error::new(kind, description)
    }

    #[test]
    fn test_busy_port_by_kind_and_description() {
        let e = err(serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied), "nope");
        assert!(classify_open_error("COM4", &e).is_port_busy());

        let e = err(serialport::ErrorKind::NoDevice, "Access is denied.");
        assert!(classify_open_error("COM4", &e).is_port_busy());

        let e = err(serialport::ErrorKind::Unknown, "Device or resource busy");
        assert!(classify_open_error("/dev/ttyACM0", &e).is_port_busy());
    }

    #[test]
    fn test_missing_port() {
        let e = err(
            serialport::ErrorKind::NoDevice,
            "The system cannot find the file specified.",
        );
        assert!(classify_open_error("COM9", &e).is_port_not_found());

        let e = err(serialport::ErrorKind::Io(io::ErrorKind::NotFound), "No such file");
        assert!(classify_open_error("/dev/ttyUSB3", &e).is_port_not_found());
    }

    #[test]
    fn test_other_failures_are_transient() {
        let e = err(serialport::ErrorKind::InvalidInput, "bad baud rate");
        let classified = classify_open_error("COM4", &e);
        assert!(classified.is_transient());
        assert!(classified.to_string().contains("bad baud rate"));
    }
}
