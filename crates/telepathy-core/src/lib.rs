//! Telepathy: host-side toolkit for observing and manipulating the live
//! state of an embedded target over the XCP calibration/measurement
//! protocol.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: framed byte I/O over TCP or serial, plus a mock for
//!   testing (`transport`)
//! - **Protocol**: XCP command codes, packet classes and response parsing
//!   (`protocol`), and the request/response client with its receiver
//!   thread (`client`)
//! - **Symbols**: path → (address, type) resolution from DWARF debug info
//!   or from the in-target model mapping structure (`symbols`)
//! - **Variables**: typed read/write of resolved symbols (`variables`,
//!   `value`)
//! - **DAQ**: periodic sampling configuration, reassembly and the bounded
//!   sample queue (`daq`)
//! - **Session**: high-level orchestrator tying it all together
//!   (`session`, `config`)
//!
//! # Example
//!
//! ```no_run
//! use telepathy_core::{Session, SessionConfig, Value};
//!
//! let config = SessionConfig {
//!     image_path: Some("firmware.elf".to_string()),
//!     ..Default::default()
//! };
//!
//! let mut session = Session::connect(config).expect("connect failed");
//! session.load_model_map().expect("no model map");
//!
//! let gain = session.resolve("ctrl/gain").expect("unknown symbol");
//! println!("gain = {}", session.read(&gain).expect("read failed"));
//! session.write(&gain, &Value::Float(1.25)).expect("write failed");
//!
//! session.daq_configure([("ctrl/inner/err", 1)]).expect("daq setup");
//! session.daq_start().expect("daq start");
//! let stream = session.daq_samples().expect("stream");
//! for _ in 0..10 {
//!     if let Some(sample) = stream.recv_timeout(std::time::Duration::from_secs(1)) {
//!         println!("{:?}", sample.values);
//!     }
//! }
//! session.daq_stop().expect("daq stop");
//! session.disconnect().expect("disconnect");
//! ```

pub mod client;
pub mod config;
pub mod daq;
pub mod error;
pub mod protocol;
pub mod session;
pub mod symbols;
pub mod target;
pub mod transport;
pub mod types;
pub mod value;
pub mod variables;

// Re-exports for convenience
pub use client::XcpClient;
pub use config::{SessionConfig, TransportConfig};
pub use daq::{DaqMetadata, DaqOptions, OverflowPolicy, Sample, SampleStream, Timestamp};
pub use error::{Error, ErrorKind, Result};
pub use protocol::ConnectionState;
pub use session::Session;
pub use symbols::{Access, Storage, Symbol, SymbolTable};
pub use target::{MemoryImage, TargetMemory};
pub use transport::{MockTransport, SerialTransport, TcpTransport, Transport, TransportError};
pub use types::{ByteOrder, ScalarKind, Type};
pub use value::Value;
