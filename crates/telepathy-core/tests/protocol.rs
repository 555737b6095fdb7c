//! Protocol client scenarios against the scripted target stub: connection
//! and identification, chunked memory access and negative responses.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{StubOptions, TargetStub};
use telepathy_core::protocol::constants::*;
use telepathy_core::{
    ByteOrder, ConnectionState, Error, ErrorKind, TargetMemory, XcpClient,
};

fn connect(stub: Arc<TargetStub>) -> XcpClient {
    XcpClient::connect(stub, Duration::from_millis(500)).expect("connect failed")
}

#[test]
fn connect_and_identify() {
    let stub = Arc::new(TargetStub::new(StubOptions::default()));
    let client = connect(stub.clone());

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.byte_order(), ByteOrder::Little);

    let info = client.connect_info().unwrap();
    assert_eq!(info.max_cto, 8);
    assert_eq!(info.max_dto, 8);
    assert!(info.supports_daq());
    assert!(info.supports_calibration());

    assert_eq!(stub.command_pids(), vec![CMD_CONNECT]);
}

#[test]
fn chunked_read_splits_into_three_uploads() {
    let stub = Arc::new(TargetStub::new(StubOptions::default()));
    stub.memory
        .add_region(0x2000_0000, (0u8..20).collect::<Vec<u8>>());
    let client = connect(stub.clone());
    stub.clear_commands();

    let data = client.read_memory(0x2000_0000, 20).unwrap();
    assert_eq!(data, (0u8..20).collect::<Vec<u8>>());

    // MAX_CTO 8 carries 7 payload bytes per UPLOAD: one SET_MTA plus
    // exactly three UPLOADs, reassembled in order.
    let pids = stub.command_pids();
    assert_eq!(pids, vec![CMD_SET_MTA, CMD_UPLOAD, CMD_UPLOAD, CMD_UPLOAD]);
}

#[test]
fn single_packet_read_uses_short_upload() {
    let stub = Arc::new(TargetStub::new(StubOptions::default()));
    stub.memory.add_region(0x2000_0100, vec![0xAB; 8]);
    let client = connect(stub.clone());
    stub.clear_commands();

    let data = client.read_memory(0x2000_0100, 4).unwrap();
    assert_eq!(data, vec![0xAB; 4]);
    assert_eq!(stub.command_pids(), vec![CMD_SHORT_UPLOAD]);
}

#[test]
fn negative_response_preserves_code_and_connection() {
    let stub = Arc::new(TargetStub::new(StubOptions {
        write_protected: Some((0x0800_0000, 0x0800_1000)),
        ..Default::default()
    }));
    stub.memory.add_region(0x0800_0000, vec![0u8; 0x1000]);
    let client = connect(stub.clone());

    let err = client
        .write_memory(0x0800_0000, &[1, 2, 3, 4])
        .unwrap_err();
    match &err {
        Error::NegativeResponse { code } => assert_eq!(*code, 0x22),
        other => panic!("expected a negative response, got {}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Protocol);

    // The error is local to the call; the connection stays usable.
    assert_eq!(client.state(), ConnectionState::Connected);
    stub.memory.add_region(0x2000_0200, vec![7; 4]);
    assert_eq!(client.read_memory(0x2000_0200, 4).unwrap(), vec![7; 4]);
}

#[test]
fn write_then_read_back_returns_same_bytes() {
    let stub = Arc::new(TargetStub::new(StubOptions::default()));
    stub.memory.add_region(0x2000_0000, vec![0u8; 64]);
    let client = connect(stub.clone());

    let payload: Vec<u8> = (0..20).map(|i| i * 3).collect();
    client.write_memory(0x2000_0010, &payload).unwrap();
    assert_eq!(client.read_memory(0x2000_0010, 20).unwrap(), payload);
}

#[test]
fn disconnect_runs_the_full_teardown() {
    let stub = Arc::new(TargetStub::new(StubOptions::default()));
    let client = connect(stub.clone());
    stub.clear_commands();

    client.disconnect().unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(stub.command_pids(), vec![CMD_DISCONNECT]);

    // Everything after teardown fails fast.
    assert!(client.read_memory(0x2000_0000, 1).is_err());
}

#[test]
fn mandatory_info_commands_round_trip() {
    let stub = Arc::new(TargetStub::new(StubOptions::default()));
    let client = connect(stub.clone());

    let status = client.get_status().unwrap();
    assert!(!status.daq_running());

    client.synch().unwrap();

    let comm = client.get_comm_mode_info().unwrap();
    assert_eq!(comm.max_bs, 2);
    assert_eq!(comm.driver_version, 0x10);

    let clock = client.get_daq_clock().unwrap();
    assert_eq!(clock, 10000);
}
