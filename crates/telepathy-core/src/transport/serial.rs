//! Serial port transport.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serialport::SerialPort;
use tracing::info;

use super::{Transport, TransportError};

pub struct SerialTransport {
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
    port_name: String,
    closed: AtomicBool,
}

impl SerialTransport {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let writer = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TransportError::OpenFailed {
                target: port.to_string(),
                message: e.to_string(),
            })?;
        let reader = writer.try_clone().map_err(|e| TransportError::OpenFailed {
            target: port.to_string(),
            message: e.to_string(),
        })?;

        info!(port = %port, baud = baud_rate, "serial transport opened");
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            port_name: port.to_string(),
            closed: AtomicBool::new(false),
        })
    }
}

impl Transport for SerialTransport {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        use std::io::Write;
        let mut port = self.writer.lock().unwrap();
        port.write_all(data)
            .and_then(|()| port.flush())
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        use std::io::Read;
        let mut port = self.reader.lock().unwrap();
        let timeout = timeout.max(Duration::from_millis(1));
        port.set_timeout(timeout)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        match port.read(buf) {
            // Serial ports have no end-of-stream; an empty read is a timeout.
            Ok(0) => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn describe(&self) -> String {
        format!("serial://{}", self.port_name)
    }
}
