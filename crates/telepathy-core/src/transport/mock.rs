//! Mock transport for testing the protocol client without hardware.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{Transport, TransportError};

struct MockState {
    rx: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    connected: bool,
}

/// Scripted transport: tests queue the bytes the "target" will send and
/// inspect everything the client wrote.
pub struct MockTransport {
    state: Mutex<MockState>,
    data_ready: Condvar,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                rx: VecDeque::new(),
                writes: Vec::new(),
                connected: true,
            }),
            data_ready: Condvar::new(),
        }
    }

    /// Queue raw bytes to be returned by subsequent reads.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.rx.extend(bytes);
        self.data_ready.notify_all();
    }

    /// Queue a complete frame (length + counter header plus payload).
    pub fn queue_frame(&self, counter: u16, payload: &[u8]) {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&counter.to_le_bytes());
        frame.extend_from_slice(payload);
        self.queue_bytes(&frame);
    }

    /// All transport writes, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Frame payloads the client sent, with the 4-byte framing header
    /// stripped (each command is written as a single frame).
    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|w| w.len() >= 4)
            .map(|w| w[4..].to_vec())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    /// Simulate the link going away.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
        self.data_ready.notify_all();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.writes.push(data.to_vec());
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            if !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.rx.pop_front().unwrap();
                }
                return Ok(n);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self.data_ready.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
    }

    fn close(&self) {
        self.disconnect();
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_capture_and_disconnect() {
        let mock = MockTransport::new();
        mock.write(&[1, 2, 3]).unwrap();
        assert_eq!(mock.writes(), vec![vec![1, 2, 3]]);

        mock.disconnect();
        assert!(matches!(
            mock.write(&[4]),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn read_times_out_when_queue_empty() {
        let mock = MockTransport::new();
        let mut buf = [0u8; 8];
        assert!(matches!(
            mock.read(&mut buf, Duration::from_millis(10)),
            Err(TransportError::Timeout { .. })
        ));
    }
}
