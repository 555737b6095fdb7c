//! End-to-end model-map resolution: the mapping structure is read out of
//! the (stubbed) target's memory over the protocol, and resolved symbols
//! read and write through the same connection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{StubOptions, TargetStub};
use telepathy_core::TargetMemory;
use telepathy_core::protocol::constants::*;
use telepathy_core::{Access, Session, SessionConfig, Type, Value};

const MMI: u32 = 0x0001_1000;
const STATIC: u32 = 0x0001_1100;
const SIGNALS: u32 = 0x0001_1200;
const PARAMS: u32 = 0x0001_1300;
const DTYPE_MAP: u32 = 0x0001_1400;
const ADDR_MAP: u32 = 0x0001_1600;
const STRINGS: u32 = 0x0001_1700;

struct Builder(Vec<u8>);
impl Builder {
    fn new() -> Self {
        Builder(Vec::new())
    }
    fn u8(mut self, v: u8) -> Self {
        self.0.push(v);
        self
    }
    fn pad(mut self, n: usize) -> Self {
        self.0.extend(std::iter::repeat_n(0u8, n));
        self
    }
    fn u16(mut self, v: u16) -> Self {
        self.0.extend(v.to_le_bytes());
        self
    }
    fn u32(mut self, v: u32) -> Self {
        self.0.extend(v.to_le_bytes());
        self
    }
}

/// Target publishing one float32 signal `ctrl/inner/err` at 0x2000040C and
/// one double parameter `ctrl/gain` at 0x20000500.
fn stub_with_model() -> Arc<TargetStub> {
    let stub = Arc::new(TargetStub::new(StubOptions::default()));

    let mut strings = Vec::new();
    let mut string_ptr = |s: &str, strings: &mut Vec<u8>| {
        let ptr = STRINGS + strings.len() as u32;
        strings.extend(s.as_bytes());
        strings.push(0);
        ptr
    };
    let sig_block = string_ptr("model/ctrl/inner/blk", &mut strings);
    let sig_name = string_ptr("err", &mut strings);
    let par_block = string_ptr("model/ctrl", &mut strings);
    let par_name = string_ptr("gain", &mut strings);
    let model_path = string_ptr("model", &mut strings);
    let target_type = string_ptr("float", &mut strings);
    strings.extend([0u8; 64]);

    let mmi = Builder::new()
        .u8(1)
        .pad(3)
        .u32(STATIC)
        .u32(model_path)
        .u32(model_path)
        .u32(ADDR_MAP)
        .pad(28)
        .0;
    stub.memory.add_region(u64::from(MMI), mmi);

    let statics = Builder::new()
        .u32(SIGNALS)
        .u32(1)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(PARAMS)
        .u32(1)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(DTYPE_MAP)
        .u32(0) // dimension map: everything is scalar
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(target_type)
        .u32(0x1111_1111)
        .u32(0x2222_2222)
        .u32(0x3333_3333)
        .u32(0x4444_4444)
        .u32(0)
        .u32(0)
        .u8(0)
        .0;
    stub.memory.add_region(u64::from(STATIC), statics);

    let signal = Builder::new()
        .u32(0) // address map index 0
        .u32(0)
        .u32(sig_block)
        .u32(sig_name)
        .u16(0)
        .u16(1) // float32
        .u16(0)
        .u16(0)
        .u8(0)
        .pad(3)
        .0;
    stub.memory.add_region(u64::from(SIGNALS), signal);

    let param = Builder::new()
        .u32(1) // address map index 1
        .u32(par_block)
        .u32(par_name)
        .u16(0) // double
        .u16(0)
        .u16(0)
        .pad(2)
        .0;
    stub.memory.add_region(u64::from(PARAMS), param);

    let mut dtypes = Builder::new()
        .u32(0)
        .u32(0)
        .u16(0)
        .u16(0)
        .u16(8)
        .u8(0) // SS_DOUBLE
        .u8(0)
        .u8(0)
        .pad(3)
        .0;
    dtypes.extend(
        Builder::new()
            .u32(0)
            .u32(0)
            .u16(0)
            .u16(0)
            .u16(4)
            .u8(1) // SS_SINGLE
            .u8(0)
            .u8(0)
            .pad(3)
            .0,
    );
    stub.memory.add_region(u64::from(DTYPE_MAP), dtypes);

    let addrs = Builder::new().u32(0x2000_040C).u32(0x2000_0500).0;
    stub.memory.add_region(u64::from(ADDR_MAP), addrs);
    stub.memory.add_region(u64::from(STRINGS), strings);

    // Live variable storage.
    stub.memory
        .add_region(0x2000_0400, vec![0u8; 0x30]);
    stub.memory
        .write_memory(0x2000_040C, &3.5f32.to_le_bytes())
        .unwrap();
    stub.memory.add_region(0x2000_0500, vec![0u8; 8]);

    stub
}

fn session_with_model(stub: Arc<TargetStub>) -> Session {
    let config = SessionConfig {
        command_timeout_ms: 500,
        ..Default::default()
    };
    let mut session = Session::connect_on(stub, config).expect("connect failed");
    session
        .load_model_map_at_address(u64::from(MMI))
        .expect("model map load failed");
    session
}

#[test]
fn signal_resolves_to_one_short_upload() {
    let stub = stub_with_model();
    let session = session_with_model(stub.clone());
    stub.clear_commands();

    let symbol = session.resolve("ctrl/inner/err").unwrap();
    assert_eq!(symbol.address, 0x2000_040C);
    assert_eq!(symbol.ty, Type::float(4));
    assert_eq!(symbol.access, Access::ReadOnly);

    let value = session.read(&symbol).unwrap();
    assert_eq!(value, Value::Float(3.5));

    // One 4-byte SHORT_UPLOAD at the resolved address, nothing else.
    let commands = stub.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(
        commands[0],
        vec![CMD_SHORT_UPLOAD, 4, 0, 0, 0x0C, 0x04, 0x00, 0x20]
    );
}

#[test]
fn model_map_is_cached_after_load() {
    let stub = stub_with_model();
    let session = session_with_model(stub.clone());
    stub.clear_commands();

    // Resolution is pure table lookup: no wire traffic.
    session.resolve("ctrl/inner/err").unwrap();
    session.resolve("ctrl/gain").unwrap();
    assert!(stub.commands().is_empty());
}

#[test]
fn parameter_writes_reach_target_memory() {
    let stub = stub_with_model();
    let session = session_with_model(stub.clone());

    session
        .write_path("ctrl/gain", &Value::Float(0.75))
        .unwrap();
    assert_eq!(
        stub.memory.read_memory(0x2000_0500, 8).unwrap(),
        0.75f64.to_le_bytes()
    );
    assert_eq!(
        session.read_path("ctrl/gain").unwrap(),
        Value::Float(0.75)
    );

    // Signals are observations and refuse writes.
    let err = session
        .write_path("ctrl/inner/err", &Value::Float(0.0))
        .unwrap_err();
    assert!(matches!(err, telepathy_core::Error::ReadOnlySymbol(_)));
}

#[test]
fn model_metadata_is_exposed() {
    let stub = stub_with_model();
    let session = session_with_model(stub);

    let map = session.model_map().unwrap();
    assert_eq!(map.model_path.as_deref(), Some("model"));
    assert_eq!(map.target_type.as_deref(), Some("float"));
    assert_eq!(map.checksums, [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444]);

    let paths = session.symbol_paths();
    assert!(paths.contains(&"ctrl/inner/err".to_string()));
    assert!(paths.contains(&"ctrl/gain".to_string()));
}
