//! TCP stream transport.
//!
//! The stream is cloned so the requester writes and the receiver thread
//! reads without contending on one socket handle.

use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use super::{Transport, TransportError};

/// Default port of the serial-to-TCP proxy in front of the target.
pub const DEFAULT_PORT: u16 = 17725;

pub struct TcpTransport {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    peer: String,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let target = format!("{}:{}", host, port);
        let stream = TcpStream::connect((host, port)).map_err(|e| TransportError::OpenFailed {
            target: target.clone(),
            message: format!(
                "{}. Check that the XCP proxy is running on {} and is not \
                 already serving another client",
                e, host
            ),
        })?;
        let _ = stream.set_nodelay(true);
        let reader = stream
            .try_clone()
            .map_err(|e| TransportError::OpenFailed {
                target: target.clone(),
                message: e.to_string(),
            })?;

        info!(peer = %target, "TCP transport connected");
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(stream),
            peer: target,
            closed: AtomicBool::new(false),
        })
    }
}

impl Transport for TcpTransport {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        use std::io::Write;
        let mut stream = self.writer.lock().unwrap();
        stream
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        use std::io::Read;
        let mut stream = self.reader.lock().unwrap();
        // A zero timeout would disable the socket timeout entirely.
        let timeout = timeout.max(Duration::from_millis(1));
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        match stream.read(buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(peer = %self.peer, "closing TCP transport");
            let _ = self.writer.lock().unwrap().shutdown(Shutdown::Both);
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
