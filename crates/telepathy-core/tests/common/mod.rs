//! A scripted XCP target for integration tests: serves memory commands from
//! a [`MemoryImage`], answers the DAQ command set and records every command
//! it was sent.
#![allow(dead_code)] // not every test binary uses every stub helper

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use telepathy_core::{MemoryImage, TargetMemory, Transport, TransportError};

pub struct StubOptions {
    pub max_cto: u8,
    pub max_dto: u16,
    /// RESOURCE byte of the CONNECT reply (DAQ 0x04, CAL/PAG 0x01).
    pub resources: u8,
    /// GET_DAQ_PROCESSOR_INFO properties byte.
    pub daq_properties: u8,
    /// GET_DAQ_RESOLUTION_INFO timestamp mode byte.
    pub timestamp_mode: u8,
    /// Address range answered with ERR_OUT_OF_RANGE on DOWNLOAD.
    pub write_protected: Option<(u64, u64)>,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            max_cto: 8,
            max_dto: 8,
            resources: 0x05,
            daq_properties: 0x01,
            timestamp_mode: 0x00,
            write_protected: None,
        }
    }
}

struct StubState {
    out: VecDeque<u8>,
    tx_counter: u16,
    mta: u64,
    commands: Vec<Vec<u8>>,
    connected: bool,
}

pub struct TargetStub {
    pub memory: MemoryImage,
    options: StubOptions,
    state: Mutex<StubState>,
    ready: Condvar,
}

impl TargetStub {
    pub fn new(options: StubOptions) -> Self {
        Self {
            memory: MemoryImage::new(),
            options,
            state: Mutex::new(StubState {
                out: VecDeque::new(),
                tx_counter: 0,
                mta: 0,
                commands: Vec::new(),
                connected: true,
            }),
            ready: Condvar::new(),
        }
    }

    /// Every command payload received so far (PID plus parameters).
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn command_pids(&self) -> Vec<u8> {
        self.commands().iter().map(|c| c[0]).collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    /// Push an unsolicited packet (e.g. a DAQ packet) to the host.
    pub fn inject(&self, packet: &[u8]) {
        let mut state = self.state.lock().unwrap();
        push_frame(&mut state, packet);
        drop(state);
        self.ready.notify_all();
    }

    fn reply_for(&self, state: &mut StubState, command: &[u8]) -> Vec<u8> {
        let pid = command[0];
        match pid {
            // CONNECT: little-endian target.
            0xFF => {
                let dto = self.options.max_dto.to_le_bytes();
                vec![
                    0xFF,
                    self.options.resources,
                    0x00,
                    self.options.max_cto,
                    dto[0],
                    dto[1],
                    0x01,
                    0x01,
                ]
            }
            // DISCONNECT
            0xFE => vec![0xFF],
            // GET_STATUS
            0xFD => vec![0xFF, 0x00, 0x00, 0x00, 0x00, 0x00],
            // SYNCH always answers ERR_CMD_SYNCH.
            0xFC => vec![0xFE, 0x00],
            // GET_COMM_MODE_INFO
            0xFB => vec![0xFF, 0x00, 0x00, 0x00, 0x02, 0x00, 0x0A, 0x10],
            // SET_MTA
            0xF6 => {
                state.mta = u64::from(u32::from_le_bytes([
                    command[4], command[5], command[6], command[7],
                ]));
                vec![0xFF]
            }
            // UPLOAD
            0xF5 => {
                let n = usize::from(command[1]);
                match self.memory.read_memory(state.mta, n) {
                    Ok(data) => {
                        state.mta += n as u64;
                        let mut reply = vec![0xFF];
                        reply.extend(data);
                        reply
                    }
                    Err(_) => vec![0xFE, 0x22],
                }
            }
            // SHORT_UPLOAD
            0xF4 => {
                let n = usize::from(command[1]);
                let address = u64::from(u32::from_le_bytes([
                    command[4], command[5], command[6], command[7],
                ]));
                match self.memory.read_memory(address, n) {
                    Ok(data) => {
                        state.mta = address + n as u64;
                        let mut reply = vec![0xFF];
                        reply.extend(data);
                        reply
                    }
                    Err(_) => vec![0xFE, 0x22],
                }
            }
            // DOWNLOAD
            0xF0 => {
                let n = usize::from(command[1]);
                let data = &command[2..2 + n];
                if let Some((start, end)) = self.options.write_protected {
                    if state.mta >= start && state.mta < end {
                        return vec![0xFE, 0x22];
                    }
                }
                match self.memory.write_memory(state.mta, data) {
                    Ok(()) => {
                        state.mta += n as u64;
                        vec![0xFF]
                    }
                    Err(_) => vec![0xFE, 0x22],
                }
            }
            // GET_DAQ_PROCESSOR_INFO: dynamic DAQ, 8 event channels.
            0xDA => vec![0xFF, self.options.daq_properties, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00],
            // GET_DAQ_RESOLUTION_INFO
            0xD9 => vec![
                0xFF,
                0x01,
                0x08,
                0x01,
                0x08,
                self.options.timestamp_mode,
                0x0A,
                0x00,
            ],
            // GET_DAQ_CLOCK
            0xDC => vec![0xFF, 0x00, 0x00, 0x00, 0x10, 0x27, 0x00, 0x00],
            // FREE_DAQ
            0xD6 => vec![0xFF],
            // ALLOC_DAQ / ALLOC_ODT / ALLOC_ODT_ENTRY / SET_DAQ_PTR /
            // WRITE_DAQ / WRITE_DAQ_MULTIPLE / SET_DAQ_LIST_MODE
            0xD5 | 0xD4 | 0xD3 | 0xE2 | 0xE1 | 0xC7 | 0xE0 => vec![0xFF],
            // START_STOP_DAQ_LIST: SELECT reports the first PID.
            0xDE => {
                let mode = command[1];
                if mode == 0x02 {
                    let list = u16::from_le_bytes([command[2], command[3]]);
                    vec![0xFF, (list * 8) as u8]
                } else {
                    vec![0xFF]
                }
            }
            // START_STOP_SYNCH
            0xDD => vec![0xFF],
            // ERR_CMD_UNKNOWN
            _ => vec![0xFE, 0x20],
        }
    }
}

fn push_frame(state: &mut StubState, payload: &[u8]) {
    let counter = state.tx_counter;
    state.tx_counter = counter.wrapping_add(1);
    state.out.extend((payload.len() as u16).to_le_bytes());
    state.out.extend(counter.to_le_bytes());
    state.out.extend(payload.iter().copied());
}

impl Transport for TargetStub {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        // The client writes exactly one frame per call.
        let command = data[4..].to_vec();
        state.commands.push(command.clone());
        let reply = self.reply_for(&mut state, &command);
        push_frame(&mut state, &reply);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            if !state.out.is_empty() {
                let n = buf.len().min(state.out.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.out.pop_front().unwrap();
                }
                return Ok(n);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self.ready.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().connected = false;
        self.ready.notify_all();
    }

    fn describe(&self) -> String {
        "stub".to_string()
    }
}
