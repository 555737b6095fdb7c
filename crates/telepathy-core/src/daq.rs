//! DAQ engine: configures the target's periodic sampling, reassembles the
//! incoming packet stream into time-aligned typed samples and hands them to
//! the consumer through a bounded queue.
//!
//! Reassembly runs on the connection's receiver thread; the consumer reads
//! from the queue on its own thread. The protocol offers no way to slow the
//! target down, so the default overflow policy drops the oldest sample and
//! counts it rather than blocking reception.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::client::{DaqEntry, DaqSink, XcpClient};
use crate::error::{Error, Result};
use crate::protocol::ConnectionState;
use crate::protocol::constants::*;
use crate::symbols::{Storage, Symbol};
use crate::types::{ByteOrder, Type};
use crate::value::{self, Value};

/// What to do when the consumer queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Drop the oldest queued sample and count it.
    #[default]
    DropOldest,
    /// Block the receiver thread until the consumer catches up.
    Block,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DaqOptions {
    /// Consumer queue length in samples.
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// How many partially-assembled samples per list may be in flight
    /// before the oldest is abandoned.
    pub reassembly_window: usize,
    /// DAQ list priority passed to the target.
    pub priority: u8,
}

impl Default for DaqOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow: OverflowPolicy::default(),
            reassembly_window: 4,
            priority: 0,
        }
    }
}

/// Sample timestamp: target clock ticks when the target timestamps its
/// packets, host time since acquisition start otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timestamp {
    Target(u32),
    Host(Duration),
}

/// One time-aligned set of values for a DAQ list, in entry order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub list_index: usize,
    pub timestamp: Timestamp,
    pub values: Vec<Value>,
}

/// Where sample timestamps come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    Target,
    Host,
}

#[derive(Debug, Clone)]
pub struct ListDescription {
    pub event_channel: u16,
    pub entry_paths: Vec<String>,
}

/// Stream metadata reported alongside the samples.
#[derive(Debug, Clone)]
pub struct DaqMetadata {
    pub time_source: TimeSource,
    /// Set when the target cannot timestamp and host reception time is
    /// used instead.
    pub reduced_precision: bool,
    pub timestamp_ticks: u16,
    pub timestamp_mode: u8,
    pub lists: Vec<ListDescription>,
}

/// Consumer handle for the sample stream.
pub struct SampleStream {
    receiver: Receiver<Sample>,
    metadata: DaqMetadata,
    dropped: Arc<AtomicU64>,
    lost: Arc<AtomicU64>,
}

impl SampleStream {
    /// Next sample, blocking up to `timeout`. `None` when nothing arrived.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Sample> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Sample> {
        self.receiver.try_recv().ok()
    }

    pub fn metadata(&self) -> &DaqMetadata {
        &self.metadata
    }

    /// Samples discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Samples abandoned during reassembly (data loss on the wire).
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[derive(Debug, Clone)]
struct EntryPlan {
    path: String,
    address: u32,
    ty: Type,
    size: u8,
}

#[derive(Debug)]
struct ListPlan {
    event_channel: u16,
    /// Entries grouped into ODTs; concatenated they give the entry order.
    odts: Vec<Vec<EntryPlan>>,
}

/// The configured engine. Owns the reassembler registered with the client.
#[derive(Debug)]
pub struct DaqEngine {
    lists: Vec<ListPlan>,
    metadata: DaqMetadata,
    reassembler: Arc<Reassembler>,
    stream: Receiver<Sample>,
}

impl DaqEngine {
    /// Group the signals by event channel, check the target's capacity and
    /// write the whole DAQ configuration. Leaves the connection in the
    /// DAQ-CONFIGURED state.
    pub fn configure(
        client: &XcpClient,
        signals: &[(Symbol, u16)],
        options: DaqOptions,
    ) -> Result<DaqEngine> {
        if signals.is_empty() {
            return Err(Error::DaqCapacity("no signals selected".into()));
        }
        let connect_info = client
            .connect_info()
            .ok_or(Error::ConnectionClosed)?;
        if !connect_info.supports_daq() {
            return Err(Error::DaqCapacity("target does not support DAQ".into()));
        }

        let processor = client.get_daq_processor_info()?;
        let resolution = client.get_daq_resolution_info()?;
        let timestamps = processor.timestamp_supported() && resolution.timestamp_size() > 0;
        let timestamp_size = if timestamps {
            resolution.timestamp_size()
        } else {
            0
        };

        let lists = plan_lists(
            signals,
            usize::from(connect_info.max_dto),
            usize::from(timestamp_size),
            resolution.max_odt_entry_size,
        )?;

        if processor.max_event_channel > 0 {
            for list in &lists {
                if list.event_channel >= processor.max_event_channel {
                    return Err(Error::DaqCapacity(format!(
                        "event channel {} out of range (target has {})",
                        list.event_channel, processor.max_event_channel
                    )));
                }
            }
        }
        if processor.max_daq > 0 && lists.len() > usize::from(processor.max_daq) {
            return Err(Error::DaqCapacity(format!(
                "{} DAQ lists needed but the target supports {}",
                lists.len(),
                processor.max_daq
            )));
        }
        let total_odts: usize = lists.iter().map(|l| l.odts.len()).sum();
        if total_odts > usize::from(PID_DAQ_LIMIT) {
            return Err(Error::DaqCapacity(format!(
                "{} ODTs exceed the packet identifier space",
                total_odts
            )));
        }

        info!(
            lists = lists.len(),
            odts = total_odts,
            timestamps,
            "writing DAQ configuration"
        );

        client.free_daq()?;
        client.alloc_daq(lists.len() as u16)?;
        for (list_index, list) in lists.iter().enumerate() {
            let list_id = list_index as u16;
            client.alloc_odt(list_id, list.odts.len() as u8)?;
            for (odt_index, odt) in list.odts.iter().enumerate() {
                client.alloc_odt_entry(list_id, odt_index as u8, odt.len() as u8)?;
            }
        }
        for (list_index, list) in lists.iter().enumerate() {
            let list_id = list_index as u16;
            let mode = if timestamps { DAQ_LIST_MODE_TIMESTAMP } else { 0 };
            client.set_daq_list_mode(mode, list_id, list.event_channel, 1, options.priority)?;
            for (odt_index, odt) in list.odts.iter().enumerate() {
                write_odt_entries(client, list_id, odt_index as u8, odt, connect_info.max_cto)?;
            }
        }
        client.set_connection_state(ConnectionState::DaqConfigured);

        let metadata = DaqMetadata {
            time_source: if timestamps {
                TimeSource::Target
            } else {
                TimeSource::Host
            },
            reduced_precision: !timestamps,
            timestamp_ticks: resolution.timestamp_ticks,
            timestamp_mode: resolution.timestamp_mode,
            lists: lists
                .iter()
                .map(|list| ListDescription {
                    event_channel: list.event_channel,
                    entry_paths: list
                        .odts
                        .iter()
                        .flatten()
                        .map(|e| e.path.clone())
                        .collect(),
                })
                .collect(),
        };

        let (tx, rx) = bounded(options.queue_capacity);
        let reassembler = Arc::new(Reassembler::new(
            &lists,
            client.byte_order(),
            timestamps,
            timestamp_size,
            options,
            tx,
            rx.clone(),
        ));

        Ok(DaqEngine {
            lists,
            metadata,
            reassembler,
            stream: rx,
        })
    }

    /// Select every list to learn its first packet identifier, arm the
    /// reassembler and start acquisition.
    pub fn start(&self, client: &XcpClient) -> Result<()> {
        let mut pid_map = HashMap::new();
        for (list_index, list) in self.lists.iter().enumerate() {
            let first_pid = client.start_stop_daq_list(DAQ_LIST_SELECT, list_index as u16)?;
            for odt_index in 0..list.odts.len() {
                pid_map.insert(first_pid + odt_index as u8, (list_index, odt_index));
            }
            debug!(list = list_index, first_pid, "DAQ list selected");
        }

        self.reassembler.arm(pid_map);
        client.set_daq_sink(self.reassembler.clone());
        client.start_stop_synch(SYNCH_START_SELECTED)?;
        Ok(())
    }

    /// Stop acquisition. After this returns no new samples are pushed to
    /// the consumer queue; samples already queued stay readable.
    pub fn stop(&self, client: &XcpClient) -> Result<()> {
        let result = client.start_stop_synch(SYNCH_STOP_ALL);
        self.reassembler.disarm();
        result
    }

    /// Consumer handle. May be called more than once; handles share the
    /// same queue.
    pub fn samples(&self) -> SampleStream {
        SampleStream {
            receiver: self.stream.clone(),
            metadata: self.metadata.clone(),
            dropped: self.reassembler.dropped.clone(),
            lost: self.reassembler.lost.clone(),
        }
    }

    pub fn metadata(&self) -> &DaqMetadata {
        &self.metadata
    }
}

/// Group signals by event channel and pack each group into ODTs honouring
/// MAX_DTO. A new ODT starts when the next entry would overflow the packet.
fn plan_lists(
    signals: &[(Symbol, u16)],
    max_dto: usize,
    timestamp_size: usize,
    max_odt_entry_size: u8,
) -> Result<Vec<ListPlan>> {
    let mut by_channel: std::collections::BTreeMap<u16, Vec<EntryPlan>> =
        std::collections::BTreeMap::new();

    for (symbol, event_channel) in signals {
        if let Type::Opaque { reason, .. } = &symbol.ty {
            return Err(Error::UnsupportedType(format!(
                "'{}': {}",
                symbol.path, reason
            )));
        }
        if !symbol.ty.is_scalar() {
            return Err(Error::UnsupportedType(format!(
                "'{}' is not a scalar; only scalar signals can be sampled",
                symbol.path
            )));
        }
        if symbol.bits.is_some() {
            return Err(Error::UnsupportedType(format!(
                "'{}' is a bit-field; bit access is not supported by DAQ",
                symbol.path
            )));
        }
        if !matches!(symbol.storage, Storage::Direct) {
            return Err(Error::UnsupportedType(format!(
                "'{}' is reached through a pointer and cannot be sampled",
                symbol.path
            )));
        }
        let size = symbol.ty.size();
        if max_odt_entry_size > 0 && size > u32::from(max_odt_entry_size) {
            return Err(Error::DaqCapacity(format!(
                "'{}' is {} bytes but the target's ODT entry limit is {}",
                symbol.path, size, max_odt_entry_size
            )));
        }
        let address = u32::try_from(symbol.address)
            .map_err(|_| Error::AddressOverflow(symbol.address))?;

        by_channel.entry(*event_channel).or_default().push(EntryPlan {
            path: symbol.path.clone(),
            address,
            ty: symbol.ty.clone(),
            size: size as u8,
        });
    }

    let mut lists = Vec::with_capacity(by_channel.len());
    for (event_channel, entries) in by_channel {
        let odts = pack_odts(&entries, max_dto, timestamp_size)?;
        lists.push(ListPlan {
            event_channel,
            odts,
        });
    }
    Ok(lists)
}

fn pack_odts(
    entries: &[EntryPlan],
    max_dto: usize,
    timestamp_size: usize,
) -> Result<Vec<Vec<EntryPlan>>> {
    // One byte of every DTO is the packet identifier; the first ODT of a
    // sample additionally carries the timestamp.
    let first_budget = max_dto
        .saturating_sub(1)
        .saturating_sub(timestamp_size);
    let other_budget = max_dto.saturating_sub(1);

    let mut odts: Vec<Vec<EntryPlan>> = Vec::new();
    let mut current: Vec<EntryPlan> = Vec::new();
    let mut used = 0usize;

    for entry in entries {
        let size = usize::from(entry.size);
        loop {
            let budget = if odts.is_empty() { first_budget } else { other_budget };
            if used + size <= budget {
                current.push(entry.clone());
                used += size;
                break;
            }
            if current.is_empty() {
                return Err(Error::DaqCapacity(format!(
                    "'{}' ({} bytes) does not fit a {}-byte DTO",
                    entry.path, size, max_dto
                )));
            }
            odts.push(std::mem::take(&mut current));
            used = 0;
        }
    }
    if !current.is_empty() {
        odts.push(current);
    }
    Ok(odts)
}

/// Write one ODT's entries, using WRITE_DAQ_MULTIPLE when the whole ODT
/// fits a single command packet.
fn write_odt_entries(
    client: &XcpClient,
    list_id: u16,
    odt_index: u8,
    odt: &[EntryPlan],
    max_cto: u8,
) -> Result<()> {
    let as_entries: Vec<DaqEntry> = odt
        .iter()
        .map(|e| DaqEntry {
            bit_offset: WRITE_DAQ_NO_BIT,
            size: e.size,
            address: e.address,
            address_extension: 0,
        })
        .collect();

    let multiple_len = 2 + as_entries.len() * XcpClient::WRITE_DAQ_MULTIPLE_ELEMENT_SIZE;
    if as_entries.len() > 1 && multiple_len <= usize::from(max_cto) {
        client.set_daq_ptr(list_id, odt_index, 0)?;
        client.write_daq_multiple(&as_entries)?;
    } else {
        for (entry_index, entry) in as_entries.iter().enumerate() {
            client.set_daq_ptr(list_id, odt_index, entry_index as u8)?;
            client.write_daq(*entry)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingSample {
    timestamp: Option<u32>,
    host_time: Duration,
    parts: Vec<Option<Vec<u8>>>,
    filled: usize,
}

#[derive(Debug)]
struct ListShape {
    /// Per ODT, the (type, size) of each entry in order.
    odts: Vec<Vec<(Type, u8)>>,
}

#[derive(Debug)]
struct ReassemblyState {
    pid_map: HashMap<u8, (usize, usize)>,
    pending: Vec<std::collections::VecDeque<PendingSample>>,
}

/// Receiver-thread side of the engine: turns DAQ packets into samples.
#[derive(Debug)]
struct Reassembler {
    shapes: Vec<ListShape>,
    byte_order: ByteOrder,
    timestamps: bool,
    timestamp_size: u8,
    window: usize,
    overflow: OverflowPolicy,
    state: Mutex<ReassemblyState>,
    armed: AtomicBool,
    started_at: Instant,
    tx: Sender<Sample>,
    /// Second handle on the queue so drop-oldest can evict from the
    /// producing side.
    evict_rx: Receiver<Sample>,
    dropped: Arc<AtomicU64>,
    lost: Arc<AtomicU64>,
}

impl Reassembler {
    fn new(
        lists: &[ListPlan],
        byte_order: ByteOrder,
        timestamps: bool,
        timestamp_size: u8,
        options: DaqOptions,
        tx: Sender<Sample>,
        evict_rx: Receiver<Sample>,
    ) -> Self {
        let shapes = lists
            .iter()
            .map(|list| ListShape {
                odts: list
                    .odts
                    .iter()
                    .map(|odt| odt.iter().map(|e| (e.ty.clone(), e.size)).collect())
                    .collect(),
            })
            .collect();
        let pending = lists.iter().map(|_| std::collections::VecDeque::new()).collect();

        Self {
            shapes,
            byte_order,
            timestamps,
            timestamp_size,
            window: options.reassembly_window.max(1),
            overflow: options.overflow,
            state: Mutex::new(ReassemblyState {
                pid_map: HashMap::new(),
                pending,
            }),
            armed: AtomicBool::new(false),
            started_at: Instant::now(),
            tx,
            evict_rx,
            dropped: Arc::new(AtomicU64::new(0)),
            lost: Arc::new(AtomicU64::new(0)),
        }
    }

    fn arm(&self, pid_map: HashMap<u8, (usize, usize)>) {
        let mut state = self.state.lock().unwrap();
        state.pid_map = pid_map;
        for queue in &mut state.pending {
            queue.clear();
        }
        drop(state);
        self.armed.store(true, Ordering::Release);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    fn push(&self, sample: Sample) {
        match self.overflow {
            OverflowPolicy::Block => {
                if self.tx.send(sample).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            OverflowPolicy::DropOldest => {
                let mut sample = sample;
                loop {
                    match self.tx.try_send(sample) {
                        Ok(()) => break,
                        Err(TrySendError::Full(returned)) => {
                            if self.evict_rx.try_recv().is_ok() {
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            sample = returned;
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }
        }
    }

    fn finalise(&self, list_index: usize, pending: PendingSample) -> Result<Sample> {
        let shape = &self.shapes[list_index];
        let mut values = Vec::new();
        for (odt_index, layout) in shape.odts.iter().enumerate() {
            let bytes = pending.parts[odt_index]
                .as_ref()
                .expect("complete sample has all parts");
            let mut offset = 0usize;
            for (ty, size) in layout {
                let size = usize::from(*size);
                values.push(value::decode(&bytes[offset..offset + size], ty, self.byte_order)?);
                offset += size;
            }
        }
        let timestamp = match pending.timestamp {
            Some(ticks) if self.timestamps => Timestamp::Target(ticks),
            _ => Timestamp::Host(pending.host_time),
        };
        Ok(Sample {
            list_index,
            timestamp,
            values,
        })
    }
}

impl DaqSink for Reassembler {
    fn dispatch(&self, pid: u8, payload: &[u8], received_at: Instant) {
        if !self.armed.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let Some(&(list_index, odt_index)) = state.pid_map.get(&pid) else {
            trace!(pid, "DAQ packet with unknown identifier");
            return;
        };
        let shape = &self.shapes[list_index];
        let odt_count = shape.odts.len();

        // Split off the timestamp carried by the sample's first ODT.
        let (timestamp, data) = if odt_index == 0 && self.timestamp_size > 0 {
            let ts_len = usize::from(self.timestamp_size);
            if payload.len() < ts_len {
                warn!(pid, "DAQ packet shorter than its timestamp");
                self.lost.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let ticks = match value::decode(
                &payload[..ts_len],
                &Type::unsigned(self.timestamp_size),
                self.byte_order,
            ) {
                Ok(Value::UnsignedInt(t)) => t as u32,
                _ => 0,
            };
            (Some(ticks), &payload[ts_len..])
        } else {
            (None, payload)
        };

        let expected: usize = shape.odts[odt_index]
            .iter()
            .map(|(_, size)| usize::from(*size))
            .sum();
        if data.len() < expected {
            warn!(
                pid,
                got = data.len(),
                expected,
                "truncated DAQ packet dropped"
            );
            self.lost.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let data = data[..expected].to_vec();

        let host_time = received_at.saturating_duration_since(self.started_at);
        let queue = &mut state.pending[list_index];

        // Attach to the oldest pending sample still missing this ODT;
        // open a new one if none is.
        let position = queue.iter().position(|p| p.parts[odt_index].is_none());
        let position = match position {
            Some(position) => position,
            None => {
                if queue.len() >= self.window {
                    // Window closed: the oldest incomplete sample is lost.
                    queue.pop_front();
                    self.lost.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(PendingSample {
                    timestamp: None,
                    host_time,
                    parts: vec![None; odt_count],
                    filled: 0,
                });
                queue.len() - 1
            }
        };

        {
            let pending = &mut queue[position];
            pending.parts[odt_index] = Some(data);
            pending.filled += 1;
            if odt_index == 0 {
                pending.timestamp = timestamp;
            }
        }

        // Deliver in the order the first ODTs arrived: only complete
        // samples at the front of the window leave it.
        let mut completed = Vec::new();
        while queue
            .front()
            .is_some_and(|p| p.filled == odt_count)
        {
            completed.push(queue.pop_front().unwrap());
        }
        drop(state);

        for pending in completed {
            match self.finalise(list_index, pending) {
                Ok(sample) => self.push(sample),
                Err(e) => {
                    warn!(error = %e, "failed to decode sample");
                    self.lost.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u8) -> EntryPlan {
        EntryPlan {
            path: path.into(),
            address: 0x2000_0000,
            ty: match size {
                4 => Type::float(4),
                2 => Type::signed(2),
                _ => Type::unsigned(size),
            },
            size,
        }
    }

    #[test]
    fn packing_starts_new_odt_on_overflow() {
        // MAX_DTO 8, timestamps off: 7 payload bytes per ODT.
        let entries = vec![entry("a", 4), entry("b", 2), entry("c", 4), entry("d", 1)];
        let odts = pack_odts(&entries, 8, 0).unwrap();
        assert_eq!(odts.len(), 2);
        assert_eq!(odts[0].len(), 2); // 4 + 2 fits, next 4 would not
        assert_eq!(odts[1].len(), 2);
    }

    #[test]
    fn packing_reserves_timestamp_space_in_first_odt() {
        // MAX_DTO 8 with a 4-byte timestamp: 3 bytes in the first ODT.
        let entries = vec![entry("a", 2), entry("b", 2)];
        let odts = pack_odts(&entries, 8, 4).unwrap();
        assert_eq!(odts.len(), 2);
        assert_eq!(odts[0].len(), 1);
        assert_eq!(odts[1].len(), 1);
    }

    #[test]
    fn oversized_entry_is_a_capacity_error() {
        let entries = vec![entry("big", 8)];
        assert!(matches!(
            pack_odts(&entries, 8, 0),
            Err(Error::DaqCapacity(_))
        ));
    }

    fn reassembler(
        lists: &[ListPlan],
        capacity: usize,
        overflow: OverflowPolicy,
        timestamps: bool,
    ) -> (Arc<Reassembler>, Receiver<Sample>) {
        let (tx, rx) = bounded(capacity);
        let options = DaqOptions {
            queue_capacity: capacity,
            overflow,
            ..Default::default()
        };
        let reassembler = Arc::new(Reassembler::new(
            lists,
            ByteOrder::Little,
            timestamps,
            if timestamps { 4 } else { 0 },
            options,
            tx,
            rx.clone(),
        ));
        (reassembler, rx)
    }

    fn two_odt_list() -> Vec<ListPlan> {
        vec![ListPlan {
            event_channel: 1,
            odts: vec![vec![entry("f", 4)], vec![entry("i", 2)]],
        }]
    }

    #[test]
    fn samples_assemble_across_odts() {
        let lists = two_odt_list();
        let (reasm, rx) = reassembler(&lists, 16, OverflowPolicy::DropOldest, true);
        let mut map = HashMap::new();
        map.insert(0u8, (0usize, 0usize));
        map.insert(1u8, (0usize, 1usize));
        reasm.arm(map);

        let now = Instant::now();
        // Cycle 1: ODT0 (timestamp 100, float 1.5) then ODT1 (int16 -2).
        let mut odt0 = 100u32.to_le_bytes().to_vec();
        odt0.extend(1.5f32.to_le_bytes());
        reasm.dispatch(0, &odt0, now);
        assert!(rx.is_empty());
        reasm.dispatch(1, &(-2i16).to_le_bytes(), now);

        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.list_index, 0);
        assert_eq!(sample.timestamp, Timestamp::Target(100));
        assert_eq!(
            sample.values,
            vec![Value::Float(1.5), Value::SignedInt(-2)]
        );
    }

    #[test]
    fn out_of_order_odts_within_window() {
        let lists = two_odt_list();
        let (reasm, rx) = reassembler(&lists, 16, OverflowPolicy::DropOldest, true);
        let mut map = HashMap::new();
        map.insert(0u8, (0usize, 0usize));
        map.insert(1u8, (0usize, 1usize));
        reasm.arm(map);

        let now = Instant::now();
        // ODT1 arrives before its ODT0.
        reasm.dispatch(1, &7i16.to_le_bytes(), now);
        assert!(rx.is_empty());
        let mut odt0 = 5u32.to_le_bytes().to_vec();
        odt0.extend(0.5f32.to_le_bytes());
        reasm.dispatch(0, &odt0, now);

        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.timestamp, Timestamp::Target(5));
        assert_eq!(sample.values, vec![Value::Float(0.5), Value::SignedInt(7)]);
    }

    #[test]
    fn window_overflow_counts_loss() {
        let lists = two_odt_list();
        let (reasm, rx) = reassembler(&lists, 16, OverflowPolicy::DropOldest, true);
        let mut map = HashMap::new();
        map.insert(0u8, (0usize, 0usize));
        map.insert(1u8, (0usize, 1usize));
        reasm.arm(map);

        let now = Instant::now();
        // Five ODT0s with no ODT1: the default window of 4 overflows once.
        for n in 0..5u32 {
            let mut odt0 = n.to_le_bytes().to_vec();
            odt0.extend(1.0f32.to_le_bytes());
            reasm.dispatch(0, &odt0, now);
        }
        assert!(rx.is_empty());
        assert_eq!(reasm.lost.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_oldest_keeps_newest_samples() {
        let lists = vec![ListPlan {
            event_channel: 1,
            odts: vec![vec![entry("v", 2)]],
        }];
        let (reasm, rx) = reassembler(&lists, 4, OverflowPolicy::DropOldest, false);
        let mut map = HashMap::new();
        map.insert(0u8, (0usize, 0usize));
        reasm.arm(map);

        let now = Instant::now();
        for n in 1..=10i16 {
            reasm.dispatch(0, &n.to_le_bytes(), now);
        }

        // Queue length 4, fed 10: samples 7..10 remain, 6 dropped.
        assert_eq!(reasm.dropped.load(Ordering::Relaxed), 6);
        let remaining: Vec<Value> = std::iter::from_fn(|| rx.try_recv().ok())
            .flat_map(|s| s.values)
            .collect();
        assert_eq!(
            remaining,
            vec![
                Value::SignedInt(7),
                Value::SignedInt(8),
                Value::SignedInt(9),
                Value::SignedInt(10),
            ]
        );
    }

    #[test]
    fn disarmed_reassembler_pushes_nothing() {
        let lists = vec![ListPlan {
            event_channel: 1,
            odts: vec![vec![entry("v", 2)]],
        }];
        let (reasm, rx) = reassembler(&lists, 4, OverflowPolicy::DropOldest, false);
        let mut map = HashMap::new();
        map.insert(0u8, (0usize, 0usize));
        reasm.arm(map);
        reasm.disarm();

        reasm.dispatch(0, &3i16.to_le_bytes(), Instant::now());
        assert!(rx.is_empty());
    }

    #[test]
    fn host_timestamps_when_target_has_none() {
        let lists = vec![ListPlan {
            event_channel: 1,
            odts: vec![vec![entry("v", 2)]],
        }];
        let (reasm, rx) = reassembler(&lists, 4, OverflowPolicy::DropOldest, false);
        let mut map = HashMap::new();
        map.insert(0u8, (0usize, 0usize));
        reasm.arm(map);

        reasm.dispatch(0, &1i16.to_le_bytes(), Instant::now());
        let sample = rx.try_recv().unwrap();
        assert!(matches!(sample.timestamp, Timestamp::Host(_)));
    }
}
