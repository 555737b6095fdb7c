//! XCP protocol definitions: command codes, packet classes and the typed
//! views of command responses.

pub mod constants;
mod info;

pub use constants::error_name;
pub use info::{CommModeInfo, ConnectInfo, DaqProcessorInfo, DaqResolutionInfo, StatusInfo};

use std::fmt;

/// Lifecycle of a protocol session.
///
/// Transitions are driven by explicit commands: CONNECT, the DAQ setup
/// sequence, START_STOP_SYNCH and DISCONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    DaqConfigured,
    DaqRunning,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::DaqConfigured => write!(f, "DAQ-CONFIGURED"),
            ConnectionState::DaqRunning => write!(f, "DAQ-RUNNING"),
        }
    }
}
