//! Byte transport abstraction and XCP packet framing.
//!
//! A [`Transport`] moves raw bytes; [`PacketSender`] and [`PacketReceiver`]
//! sit on top and speak the length + counter framing that XCP uses
//! identically on serial links and TCP streams. The receiver recovers packet
//! boundaries after a framing error by discarding bytes until a plausible
//! header appears; three consecutive failures escalate to a disconnect.

mod mock;
mod serial;
mod tcp;

pub use mock::MockTransport;
pub use serial::SerialTransport;
pub use tcp::{DEFAULT_PORT, TcpTransport};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Framing header: u16 length + u16 counter, both little-endian regardless
/// of the target's negotiated byte order.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on a plausible frame payload; anything larger is treated as
/// a framing error.
pub const MAX_FRAME_PAYLOAD: usize = 512;

/// Consecutive framing failures tolerated before the link is declared lost.
const MAX_FRAMING_FAILURES: u32 = 3;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open {target}: {message}")]
    OpenFailed { target: String, message: String },

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("connection closed")]
    Disconnected,

    #[error("timeout after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("framing lost after {0} consecutive bad headers")]
    Desynchronized(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Timeouts are recoverable (the caller may poll again); everything else
    /// poisons the connection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Abstract byte transport.
///
/// Implementations are shared between the requester and the receiver thread,
/// so all methods take `&self`. Sends are ordered; after a failure every
/// subsequent operation fails until the transport is reopened.
pub trait Transport: Send + Sync {
    /// Write all of `data`.
    fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Read at least one byte into `buf`, waiting at most `timeout`.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Tear the link down, unblocking pending reads where possible.
    fn close(&self);

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Framing writer, shared by all callers issuing commands.
pub struct PacketSender {
    transport: Arc<dyn Transport>,
    counter: Mutex<u16>,
}

impl PacketSender {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            counter: Mutex::new(0),
        }
    }

    /// Frame `payload` with the next transmit counter and write it as a
    /// single transport write.
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let counter = {
            let mut guard = self.counter.lock().unwrap();
            let current = *guard;
            *guard = guard.wrapping_add(1);
            current
        };

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&counter.to_le_bytes());
        frame.extend_from_slice(payload);
        self.transport.write(&frame)
    }
}

/// Framing reader, owned by the connection's receiver thread.
pub struct PacketReceiver {
    transport: Arc<dyn Transport>,
    buf: VecDeque<u8>,
    expected_counter: Option<u16>,
    failures: u32,
}

enum FrameParse {
    NeedMore,
    Bad,
    Frame(Vec<u8>),
}

impl PacketReceiver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            buf: VecDeque::new(),
            expected_counter: None,
            failures: 0,
        }
    }

    /// Forget the expected receive counter. FREE_DAQ restarts the target's
    /// counter sequence, so the next frame's counter is adopted as-is.
    pub fn reset_counter(&mut self) {
        self.expected_counter = None;
    }

    /// Receive the next frame payload, waiting at most `timeout`.
    pub fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_parse() {
                FrameParse::Frame(payload) => return Ok(payload),
                FrameParse::Bad => {
                    self.failures += 1;
                    if self.failures >= MAX_FRAMING_FAILURES {
                        tracing::warn!(failures = self.failures, "framing lost, giving up");
                        return Err(TransportError::Desynchronized(self.failures));
                    }
                    // Drop one byte and retry alignment.
                    self.buf.pop_front();
                }
                FrameParse::NeedMore => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(TransportError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    let mut chunk = [0u8; 512];
                    let n = self.transport.read(&mut chunk, remaining)?;
                    self.buf.extend(&chunk[..n]);
                }
            }
        }
    }

    fn try_parse(&mut self) -> FrameParse {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return FrameParse::NeedMore;
        }
        let header: Vec<u8> = self.buf.iter().take(FRAME_HEADER_SIZE).copied().collect();
        let length = u16::from_le_bytes([header[0], header[1]]) as usize;
        let counter = u16::from_le_bytes([header[2], header[3]]);

        if length == 0 || length > MAX_FRAME_PAYLOAD {
            tracing::debug!(length, "implausible frame length, resynchronising");
            return FrameParse::Bad;
        }
        if let Some(expected) = self.expected_counter {
            if counter != expected {
                tracing::debug!(counter, expected, "frame counter out of sequence");
                return FrameParse::Bad;
            }
        }
        if self.buf.len() < FRAME_HEADER_SIZE + length {
            return FrameParse::NeedMore;
        }

        self.buf.drain(..FRAME_HEADER_SIZE);
        let payload: Vec<u8> = self.buf.drain(..length).collect();
        self.expected_counter = Some(counter.wrapping_add(1));
        self.failures = 0;
        FrameParse::Frame(payload)
    }
}
