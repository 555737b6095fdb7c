//! Error taxonomy shared by the whole stack.
//!
//! Transport failures poison the connection; protocol negative responses are
//! local to the issuing call and keep the target's error code verbatim;
//! symbol and type errors never touch the wire.

use thiserror::Error;

use crate::protocol::{ConnectionState, error_name};
use crate::transport::TransportError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of an [`Error`], matching the failure domains of
/// the stack: wire I/O, protocol exchange, connection lifecycle, symbol
/// lookup, value conversion and resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    State,
    Symbol,
    Type,
    Resource,
}

#[derive(Error, Debug)]
pub enum Error {
    // -- transport ----------------------------------------------------------
    #[error(transparent)]
    Transport(#[from] TransportError),

    // -- protocol -----------------------------------------------------------
    /// Negative response (`0xFE`) from the target. The code is preserved
    /// verbatim; `error_name` only decorates the message.
    #[error("target replied with error 0x{code:02X} ({})", error_name(*code))]
    NegativeResponse { code: u8 },

    #[error("unexpected reply packet id 0x{pid:02X}")]
    UnexpectedPacket { pid: u8 },

    #[error("no reply to {command} within {timeout_ms} ms")]
    CommandTimeout {
        command: &'static str,
        timeout_ms: u64,
    },

    /// A pending wait was cancelled because the connection went away.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("address 0x{0:X} does not fit the target's 32-bit address space")]
    AddressOverflow(u64),

    // -- state --------------------------------------------------------------
    #[error("{command} is not allowed in state {state}")]
    InvalidState {
        command: &'static str,
        state: ConnectionState,
    },

    // -- symbol -------------------------------------------------------------
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("symbol '{0}' is read-only")]
    ReadOnlySymbol(String),

    #[error("model mapping structure version {0} is not supported (expected 1)")]
    ModelMapVersion(u8),

    #[error("failed to parse image: {0}")]
    ImageParse(String),

    #[error("image version section does not match the running target")]
    ImageVersionMismatch,

    // -- type ---------------------------------------------------------------
    #[error("value {value} does not fit {ty}")]
    ValueOutOfRange { value: String, ty: String },

    #[error("expected a {expected} value, got {actual}")]
    TypeMismatch {
        expected: String,
        actual: &'static str,
    },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    // -- resource -----------------------------------------------------------
    #[error("DAQ capacity exceeded: {0}")]
    DaqCapacity(String),

    #[error("sample queue overflow")]
    QueueOverflow,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(TransportError::Io(e))
    }
}

impl From<gimli::Error> for Error {
    fn from(e: gimli::Error) -> Self {
        Error::ImageParse(e.to_string())
    }
}

impl From<object::Error> for Error {
    fn from(e: object::Error) -> Self {
        Error::ImageParse(e.to_string())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::NegativeResponse { .. }
            | Error::UnexpectedPacket { .. }
            | Error::CommandTimeout { .. }
            | Error::ConnectionClosed
            | Error::AddressOverflow(_) => ErrorKind::Protocol,
            Error::InvalidState { .. } => ErrorKind::State,
            Error::UnknownSymbol(_)
            | Error::InvalidPath { .. }
            | Error::ReadOnlySymbol(_)
            | Error::ModelMapVersion(_)
            | Error::ImageParse(_)
            | Error::ImageVersionMismatch => ErrorKind::Symbol,
            Error::ValueOutOfRange { .. }
            | Error::TypeMismatch { .. }
            | Error::SizeMismatch { .. }
            | Error::UnsupportedType(_) => ErrorKind::Type,
            Error::DaqCapacity(_) | Error::QueueOverflow => ErrorKind::Resource,
        }
    }
}
