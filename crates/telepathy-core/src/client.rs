//! XCP protocol client.
//!
//! One requester side (caller threads issuing commands, serialised to one
//! outstanding command) and one receiver thread per connection. The receiver
//! classifies incoming packets: positive/negative responses rendezvous with
//! the waiting requester through a mutex + condvar, events and service
//! requests are logged, DAQ packets are routed to the registered sink.
//!
//! A command timeout marks the connection dead without retrying: the target
//! may be mid-write, and a blind retry would not be safe.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::constants::*;
use crate::protocol::{
    CommModeInfo, ConnectInfo, ConnectionState, DaqProcessorInfo, DaqResolutionInfo, StatusInfo,
};
use crate::target::TargetMemory;
use crate::transport::{PacketReceiver, PacketSender, Transport};
use crate::types::ByteOrder;

/// How often the receiver thread wakes to check the stop flag.
const RECEIVE_POLL: Duration = Duration::from_millis(50);

/// Consumer of DAQ packets, registered by the DAQ engine. Called from the
/// receiver thread.
pub trait DaqSink: Send + Sync {
    /// `pid` is the absolute packet identifier, `payload` the bytes after
    /// it, `received_at` the host reception time.
    fn dispatch(&self, pid: u8, payload: &[u8], received_at: Instant);
}

/// One DAQ entry for WRITE_DAQ / WRITE_DAQ_MULTIPLE.
#[derive(Debug, Clone, Copy)]
pub struct DaqEntry {
    pub bit_offset: u8,
    pub size: u8,
    pub address: u32,
    pub address_extension: u8,
}

enum Reply {
    Positive(Vec<u8>),
    Negative(u8),
}

struct ProtocolState {
    connection: ConnectionState,
    byte_order: ByteOrder,
    connect_info: Option<ConnectInfo>,
    replies: std::collections::VecDeque<Reply>,
    dead: bool,
}

struct Shared {
    state: Mutex<ProtocolState>,
    reply_ready: Condvar,
    stop: AtomicBool,
    reset_rx_counter: AtomicBool,
    daq_sink: Mutex<Option<Arc<dyn DaqSink>>>,
    service_requests: AtomicU64,
}

impl Shared {
    fn mark_dead(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.dead {
            state.dead = true;
            state.connection = ConnectionState::Disconnected;
        }
        drop(state);
        self.reply_ready.notify_all();
    }
}

pub struct XcpClient {
    shared: Arc<Shared>,
    sender: PacketSender,
    transport: Arc<dyn Transport>,
    /// Serialises callers: at most one command outstanding per connection.
    command_gate: Mutex<()>,
    timeout: Duration,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl XcpClient {
    /// Open a session: spawn the receiver thread, send CONNECT and digest
    /// the identification reply.
    pub fn connect(transport: Arc<dyn Transport>, timeout: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ProtocolState {
                connection: ConnectionState::Disconnected,
                byte_order: ByteOrder::Little,
                connect_info: None,
                replies: std::collections::VecDeque::new(),
                dead: false,
            }),
            reply_ready: Condvar::new(),
            stop: AtomicBool::new(false),
            reset_rx_counter: AtomicBool::new(false),
            daq_sink: Mutex::new(None),
            service_requests: AtomicU64::new(0),
        });

        let receiver = PacketReceiver::new(transport.clone());
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("xcp-receiver".into())
            .spawn(move || receiver_loop(thread_shared, receiver))
            .expect("failed to spawn receiver thread");

        let client = Self {
            shared,
            sender: PacketSender::new(transport.clone()),
            transport,
            command_gate: Mutex::new(()),
            timeout,
            receiver: Mutex::new(Some(handle)),
        };

        client.initial_connect()?;
        Ok(client)
    }

    fn initial_connect(&self) -> Result<()> {
        let reply = self.command("CONNECT", vec![CMD_CONNECT, CONNECT_MODE_NORMAL])?;
        let info = ConnectInfo::parse(&reply)?;
        if info.max_cto < MIN_SUPPORTED_CTO {
            return Err(Error::DaqCapacity(format!(
                "target reports MAX_CTO {} but at least {} is required",
                info.max_cto, MIN_SUPPORTED_CTO
            )));
        }

        info!(
            transport = %self.transport.describe(),
            byte_order = %info.byte_order,
            max_cto = info.max_cto,
            max_dto = info.max_dto,
            daq = info.supports_daq(),
            calibration = info.supports_calibration(),
            "connected to target"
        );

        let mut state = self.shared.state.lock().unwrap();
        state.connection = ConnectionState::Connected;
        state.byte_order = info.byte_order;
        state.connect_info = Some(info);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().unwrap().connection
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.shared.state.lock().unwrap().byte_order
    }

    pub fn connect_info(&self) -> Option<ConnectInfo> {
        self.shared.state.lock().unwrap().connect_info
    }

    fn max_cto(&self) -> usize {
        self.connect_info()
            .map(|i| usize::from(i.max_cto))
            .unwrap_or(usize::from(MIN_SUPPORTED_CTO))
    }

    pub fn service_request_count(&self) -> u64 {
        self.shared.service_requests.load(Ordering::Relaxed)
    }

    /// Register the sink that receives DAQ packets.
    pub fn set_daq_sink(&self, sink: Arc<dyn DaqSink>) {
        *self.shared.daq_sink.lock().unwrap() = Some(sink);
    }

    pub(crate) fn set_connection_state(&self, connection: ConnectionState) {
        self.shared.state.lock().unwrap().connection = connection;
    }

    fn require_state(&self, command: &'static str, allowed: &[ConnectionState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::InvalidState { command, state })
        }
    }

    fn require_connected(&self, command: &'static str) -> Result<()> {
        self.require_state(
            command,
            &[
                ConnectionState::Connected,
                ConnectionState::DaqConfigured,
                ConnectionState::DaqRunning,
            ],
        )
    }

    /// Send one command and wait for the matching response.
    fn command(&self, command: &'static str, packet: Vec<u8>) -> Result<Vec<u8>> {
        let _gate = self.command_gate.lock().unwrap();

        {
            let state = self.shared.state.lock().unwrap();
            if state.dead {
                return Err(Error::ConnectionClosed);
            }
        }

        trace!(command, len = packet.len(), "sending command");
        if let Err(e) = self.sender.send(&packet) {
            self.shared.mark_dead();
            return Err(e.into());
        }

        let deadline = Instant::now() + self.timeout;
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(reply) = state.replies.pop_front() {
                return match reply {
                    Reply::Positive(data) => Ok(data),
                    Reply::Negative(code) => Err(Error::NegativeResponse { code }),
                };
            }
            if state.dead {
                return Err(Error::ConnectionClosed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // The target may be mid-write; retrying blindly is unsafe,
                // so the connection is declared dead instead.
                drop(state);
                warn!(command, "command timed out, marking connection dead");
                self.shared.mark_dead();
                return Err(Error::CommandTimeout {
                    command,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .shared
                .reply_ready
                .wait_timeout(state, remaining)
                .unwrap();
            state = guard;
        }
    }

    fn put_u16(&self, buf: &mut Vec<u8>, value: u16) {
        self.byte_order().put_u16(buf, value);
    }

    fn put_u32(&self, buf: &mut Vec<u8>, value: u32) {
        self.byte_order().put_u32(buf, value);
    }

    fn address32(&self, address: u64, size: usize) -> Result<u32> {
        let end = address
            .checked_add(size as u64)
            .ok_or(Error::AddressOverflow(address))?;
        if end > u64::from(u32::MAX) + 1 {
            return Err(Error::AddressOverflow(address));
        }
        Ok(address as u32)
    }

    // -- generic commands ----------------------------------------------------

    pub fn get_status(&self) -> Result<StatusInfo> {
        self.require_connected("GET_STATUS")?;
        let reply = self.command("GET_STATUS", vec![CMD_GET_STATUS])?;
        StatusInfo::parse(&reply, self.byte_order())
    }

    /// Resynchronise command processing. The target always answers SYNCH
    /// with a negative response carrying ERR_CMD_SYNCH, which is the
    /// expected outcome here.
    pub fn synch(&self) -> Result<()> {
        self.require_connected("SYNCH")?;
        match self.command("SYNCH", vec![CMD_SYNCH]) {
            Err(Error::NegativeResponse { code: ERR_CMD_SYNCH }) | Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn get_comm_mode_info(&self) -> Result<CommModeInfo> {
        self.require_connected("GET_COMM_MODE_INFO")?;
        let reply = self.command("GET_COMM_MODE_INFO", vec![CMD_GET_COMM_MODE_INFO])?;
        CommModeInfo::parse(&reply)
    }

    /// Tear the session down: stop DAQ if it is running, send DISCONNECT
    /// and close the transport. Pending waits fail with `ConnectionClosed`.
    pub fn disconnect(&self) -> Result<()> {
        if self.state() == ConnectionState::DaqRunning {
            if let Err(e) = self.start_stop_synch(SYNCH_STOP_ALL) {
                warn!(error = %e, "failed to stop DAQ before disconnect");
            }
        }
        if self.state() != ConnectionState::Disconnected {
            match self.command("DISCONNECT", vec![CMD_DISCONNECT]) {
                Ok(_) => {}
                Err(e) => debug!(error = %e, "DISCONNECT command failed"),
            }
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.mark_dead();
        self.transport.close();
        if let Some(handle) = self.receiver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    // -- memory access -------------------------------------------------------

    fn set_mta(&self, address: u32) -> Result<()> {
        let mut packet = vec![CMD_SET_MTA, 0, 0, 0];
        self.put_u32(&mut packet, address);
        self.command("SET_MTA", packet)?;
        Ok(())
    }

    fn short_upload(&self, address: u32, size: u8) -> Result<Vec<u8>> {
        let mut packet = vec![CMD_SHORT_UPLOAD, size, 0, 0];
        self.put_u32(&mut packet, address);
        let reply = self.command("SHORT_UPLOAD", packet)?;
        if reply.len() < usize::from(size) {
            return Err(Error::SizeMismatch {
                expected: usize::from(size),
                actual: reply.len(),
            });
        }
        Ok(reply[..usize::from(size)].to_vec())
    }

    fn upload(&self, size: u8) -> Result<Vec<u8>> {
        let reply = self.command("UPLOAD", vec![CMD_UPLOAD, size])?;
        if reply.len() < usize::from(size) {
            return Err(Error::SizeMismatch {
                expected: usize::from(size),
                actual: reply.len(),
            });
        }
        Ok(reply[..usize::from(size)].to_vec())
    }

    // -- DAQ commands --------------------------------------------------------

    pub fn get_daq_processor_info(&self) -> Result<DaqProcessorInfo> {
        self.require_connected("GET_DAQ_PROCESSOR_INFO")?;
        let reply = self.command("GET_DAQ_PROCESSOR_INFO", vec![CMD_GET_DAQ_PROCESSOR_INFO])?;
        DaqProcessorInfo::parse(&reply, self.byte_order())
    }

    pub fn get_daq_resolution_info(&self) -> Result<DaqResolutionInfo> {
        self.require_connected("GET_DAQ_RESOLUTION_INFO")?;
        let reply = self.command(
            "GET_DAQ_RESOLUTION_INFO",
            vec![CMD_GET_DAQ_RESOLUTION_INFO],
        )?;
        DaqResolutionInfo::parse(&reply, self.byte_order())
    }

    /// Read the target's DAQ clock.
    pub fn get_daq_clock(&self) -> Result<u32> {
        self.require_connected("GET_DAQ_CLOCK")?;
        let reply = self.command("GET_DAQ_CLOCK", vec![CMD_GET_DAQ_CLOCK])?;
        if reply.len() < 7 {
            return Err(Error::SizeMismatch {
                expected: 7,
                actual: reply.len(),
            });
        }
        let mut cursor = std::io::Cursor::new(&reply[3..7]);
        Ok(self.byte_order().read_u32(&mut cursor)?)
    }

    /// Release all DAQ resources on the target. This also restarts the
    /// target's transmit counter sequence, so the receive counter check is
    /// reset alongside.
    pub fn free_daq(&self) -> Result<()> {
        self.require_connected("FREE_DAQ")?;
        self.shared.reset_rx_counter.store(true, Ordering::Release);
        self.command("FREE_DAQ", vec![CMD_FREE_DAQ])?;
        self.set_connection_state(ConnectionState::Connected);
        Ok(())
    }

    pub fn alloc_daq(&self, count: u16) -> Result<()> {
        self.require_connected("ALLOC_DAQ")?;
        let mut packet = vec![CMD_ALLOC_DAQ, 0];
        self.put_u16(&mut packet, count);
        self.command("ALLOC_DAQ", packet)?;
        Ok(())
    }

    pub fn alloc_odt(&self, daq_list: u16, count: u8) -> Result<()> {
        self.require_connected("ALLOC_ODT")?;
        let mut packet = vec![CMD_ALLOC_ODT, 0];
        self.put_u16(&mut packet, daq_list);
        packet.push(count);
        self.command("ALLOC_ODT", packet)?;
        Ok(())
    }

    pub fn alloc_odt_entry(&self, daq_list: u16, odt: u8, count: u8) -> Result<()> {
        self.require_connected("ALLOC_ODT_ENTRY")?;
        let mut packet = vec![CMD_ALLOC_ODT_ENTRY, 0];
        self.put_u16(&mut packet, daq_list);
        packet.push(odt);
        packet.push(count);
        self.command("ALLOC_ODT_ENTRY", packet)?;
        Ok(())
    }

    pub fn set_daq_ptr(&self, daq_list: u16, odt: u8, entry: u8) -> Result<()> {
        self.require_connected("SET_DAQ_PTR")?;
        let mut packet = vec![CMD_SET_DAQ_PTR, 0];
        self.put_u16(&mut packet, daq_list);
        packet.push(odt);
        packet.push(entry);
        self.command("SET_DAQ_PTR", packet)?;
        Ok(())
    }

    /// Write the ODT entry at the current DAQ pointer.
    pub fn write_daq(&self, entry: DaqEntry) -> Result<()> {
        self.require_connected("WRITE_DAQ")?;
        let mut packet = vec![
            CMD_WRITE_DAQ,
            entry.bit_offset,
            entry.size,
            entry.address_extension,
        ];
        self.put_u32(&mut packet, entry.address);
        self.command("WRITE_DAQ", packet)?;
        Ok(())
    }

    /// Write several consecutive ODT entries in one command. The caller
    /// must make sure the packet fits MAX_CTO.
    pub fn write_daq_multiple(&self, entries: &[DaqEntry]) -> Result<()> {
        self.require_connected("WRITE_DAQ_MULTIPLE")?;
        let mut packet = vec![CMD_WRITE_DAQ_MULTIPLE, entries.len() as u8];
        for entry in entries {
            packet.push(entry.bit_offset);
            packet.push(entry.size);
            self.put_u32(&mut packet, entry.address);
            packet.push(entry.address_extension);
            packet.push(0);
        }
        self.command("WRITE_DAQ_MULTIPLE", packet)?;
        Ok(())
    }

    /// Bytes one WRITE_DAQ_MULTIPLE element occupies on the wire.
    pub const WRITE_DAQ_MULTIPLE_ELEMENT_SIZE: usize = 8;

    pub fn set_daq_list_mode(
        &self,
        mode: u8,
        daq_list: u16,
        event_channel: u16,
        prescaler: u8,
        priority: u8,
    ) -> Result<()> {
        self.require_connected("SET_DAQ_LIST_MODE")?;
        let mut packet = vec![CMD_SET_DAQ_LIST_MODE, mode];
        self.put_u16(&mut packet, daq_list);
        self.put_u16(&mut packet, event_channel);
        packet.push(prescaler);
        packet.push(priority);
        self.command("SET_DAQ_LIST_MODE", packet)?;
        Ok(())
    }

    /// Start, stop or select one DAQ list. For SELECT the reply carries the
    /// list's first absolute packet identifier.
    pub fn start_stop_daq_list(&self, mode: u8, daq_list: u16) -> Result<u8> {
        self.require_connected("START_STOP_DAQ_LIST")?;
        let mut packet = vec![CMD_START_STOP_DAQ_LIST, mode];
        self.put_u16(&mut packet, daq_list);
        let reply = self.command("START_STOP_DAQ_LIST", packet)?;
        Ok(reply.first().copied().unwrap_or(0))
    }

    pub fn start_stop_synch(&self, mode: u8) -> Result<()> {
        self.require_connected("START_STOP_SYNCH")?;
        self.command("START_STOP_SYNCH", vec![CMD_START_STOP_SYNCH, mode])?;
        match mode {
            SYNCH_START_SELECTED => self.set_connection_state(ConnectionState::DaqRunning),
            SYNCH_STOP_ALL | SYNCH_STOP_SELECTED => {
                self.set_connection_state(ConnectionState::DaqConfigured)
            }
            _ => {}
        }
        Ok(())
    }
}

impl TargetMemory for XcpClient {
    /// Read target memory, splitting requests that exceed what one response
    /// packet can carry. A single-packet read goes out as one SHORT_UPLOAD;
    /// anything larger sets the MTA once and lets UPLOAD auto-increment it.
    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.require_connected("UPLOAD")?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let address = self.address32(address, size)?;
        let chunk = self.max_cto() - 1;

        if size <= chunk {
            return self.short_upload(address, size as u8);
        }

        self.set_mta(address)?;
        let mut result = Vec::with_capacity(size);
        let mut remaining = size;
        while remaining > 0 {
            let block = remaining.min(chunk);
            result.extend(self.upload(block as u8)?);
            remaining -= block;
        }
        debug_assert_eq!(result.len(), size);
        Ok(result)
    }

    /// Write target memory through SET_MTA plus chunked DOWNLOADs.
    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.require_connected("DOWNLOAD")?;
        if data.is_empty() {
            return Ok(());
        }
        let address = self.address32(address, data.len())?;
        let chunk = self.max_cto() - 2;

        self.set_mta(address)?;
        for block in data.chunks(chunk) {
            let mut packet = Vec::with_capacity(2 + block.len());
            packet.push(CMD_DOWNLOAD);
            packet.push(block.len() as u8);
            packet.extend_from_slice(block);
            self.command("DOWNLOAD", packet)?;
        }
        Ok(())
    }
}

impl Drop for XcpClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receiver_loop(shared: Arc<Shared>, mut receiver: PacketReceiver) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if shared.reset_rx_counter.swap(false, Ordering::AcqRel) {
            receiver.reset_counter();
        }
        let packet = match receiver.recv(RECEIVE_POLL) {
            Ok(packet) => packet,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                if !shared.stop.load(Ordering::Acquire) {
                    warn!(error = %e, "transport failed, terminating connection");
                }
                shared.mark_dead();
                break;
            }
        };
        handle_packet(&shared, &packet);
    }
    trace!("receiver thread exiting");
}

fn handle_packet(shared: &Shared, packet: &[u8]) {
    let Some(&pid) = packet.first() else {
        return;
    };
    match pid {
        PID_RES => deliver(shared, Reply::Positive(packet[1..].to_vec())),
        PID_ERR => {
            let code = packet.get(1).copied().unwrap_or(ERR_GENERIC);
            deliver(shared, Reply::Negative(code));
        }
        PID_EV => {
            debug!(payload = ?&packet[1..], "event packet from target");
        }
        PID_SERV => {
            shared.service_requests.fetch_add(1, Ordering::Relaxed);
            debug!(payload = ?&packet[1..], "service request from target");
        }
        _ => {
            let sink = shared.daq_sink.lock().unwrap().clone();
            match sink {
                Some(sink) => sink.dispatch(pid, &packet[1..], Instant::now()),
                None => trace!(pid, "DAQ packet with no sink registered"),
            }
        }
    }
}

fn deliver(shared: &Shared, reply: Reply) {
    let mut state = shared.state.lock().unwrap();
    state.replies.push_back(reply);
    drop(state);
    shared.reply_ready.notify_all();
}
