//! Protocol constants from the XCP specification (ASAM MCD-1 XCP).

// ============================================================================
// Command codes (CMD packet identifiers)
// ============================================================================

pub const CMD_CONNECT: u8 = 0xFF;
pub const CMD_DISCONNECT: u8 = 0xFE;
pub const CMD_GET_STATUS: u8 = 0xFD;
pub const CMD_SYNCH: u8 = 0xFC;
pub const CMD_GET_COMM_MODE_INFO: u8 = 0xFB;

pub const CMD_SET_MTA: u8 = 0xF6;
pub const CMD_UPLOAD: u8 = 0xF5;
pub const CMD_SHORT_UPLOAD: u8 = 0xF4;
pub const CMD_DOWNLOAD: u8 = 0xF0;

pub const CMD_GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
pub const CMD_GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
pub const CMD_GET_DAQ_CLOCK: u8 = 0xDC;
pub const CMD_FREE_DAQ: u8 = 0xD6;
pub const CMD_ALLOC_DAQ: u8 = 0xD5;
pub const CMD_ALLOC_ODT: u8 = 0xD4;
pub const CMD_ALLOC_ODT_ENTRY: u8 = 0xD3;
pub const CMD_SET_DAQ_PTR: u8 = 0xE2;
pub const CMD_WRITE_DAQ: u8 = 0xE1;
pub const CMD_WRITE_DAQ_MULTIPLE: u8 = 0xC7;
pub const CMD_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CMD_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CMD_START_STOP_SYNCH: u8 = 0xDD;

// ============================================================================
// Packet identifiers (target -> host)
// ============================================================================

/// Positive response.
pub const PID_RES: u8 = 0xFF;
/// Negative response, followed by one error-code byte.
pub const PID_ERR: u8 = 0xFE;
/// Asynchronous event.
pub const PID_EV: u8 = 0xFD;
/// Service request.
pub const PID_SERV: u8 = 0xFC;

/// First packet identifier that is not a DAQ identifier. DAQ packets use
/// absolute identifiers below this, starting at the per-list FIRST_PID
/// reported by START_STOP_DAQ_LIST(SELECT).
pub const PID_DAQ_LIMIT: u8 = 0xFC;

// ============================================================================
// CONNECT
// ============================================================================

/// CONNECT mode parameter: normal session.
pub const CONNECT_MODE_NORMAL: u8 = 0x00;

// RESOURCE byte bits
pub const RESOURCE_CAL_PAG: u8 = 0x01;
pub const RESOURCE_DAQ: u8 = 0x04;
pub const RESOURCE_STIM: u8 = 0x08;
pub const RESOURCE_PGM: u8 = 0x10;

// COMM_MODE_BASIC bits
pub const COMM_MODE_BYTE_ORDER_MOTOROLA: u8 = 0x01;
pub const COMM_MODE_ADDRESS_GRANULARITY: u8 = 0x06;
pub const COMM_MODE_SLAVE_BLOCK_MODE: u8 = 0x40;
pub const COMM_MODE_OPTIONAL: u8 = 0x80;

/// Smallest MAX_CTO the client can work with: SET_MTA is an 8-byte command
/// and DAQ setup cannot be expressed in anything shorter. Targets reporting
/// less are rejected at connect time.
pub const MIN_SUPPORTED_CTO: u8 = 8;

// ============================================================================
// GET_STATUS session bits
// ============================================================================

pub const SESSION_STATUS_STORE_CAL_REQ: u8 = 0x01;
pub const SESSION_STATUS_STORE_DAQ_REQ: u8 = 0x04;
pub const SESSION_STATUS_CLEAR_DAQ_REQ: u8 = 0x08;
pub const SESSION_STATUS_DAQ_RUNNING: u8 = 0x40;
pub const SESSION_STATUS_RESUME: u8 = 0x80;

// ============================================================================
// DAQ
// ============================================================================

// GET_DAQ_PROCESSOR_INFO properties bits
pub const DAQ_PROPERTY_DYNAMIC: u8 = 0x01;
pub const DAQ_PROPERTY_PRESCALER: u8 = 0x02;
pub const DAQ_PROPERTY_RESUME: u8 = 0x04;
pub const DAQ_PROPERTY_BIT_STIM: u8 = 0x08;
pub const DAQ_PROPERTY_TIMESTAMP: u8 = 0x10;
pub const DAQ_PROPERTY_PID_OFF: u8 = 0x20;
pub const DAQ_PROPERTY_OVERLOAD_MSB: u8 = 0x40;
pub const DAQ_PROPERTY_OVERLOAD_EVENT: u8 = 0x80;

// SET_DAQ_LIST_MODE bits
pub const DAQ_LIST_MODE_TIMESTAMP: u8 = 0x10;

// START_STOP_DAQ_LIST modes
pub const DAQ_LIST_STOP: u8 = 0x00;
pub const DAQ_LIST_START: u8 = 0x01;
pub const DAQ_LIST_SELECT: u8 = 0x02;

// START_STOP_SYNCH modes
pub const SYNCH_STOP_ALL: u8 = 0x00;
pub const SYNCH_START_SELECTED: u8 = 0x01;
pub const SYNCH_STOP_SELECTED: u8 = 0x02;

/// WRITE_DAQ bit-offset value meaning "whole element, no bit access".
pub const WRITE_DAQ_NO_BIT: u8 = 0xFF;

// ============================================================================
// Error codes carried by negative responses
// ============================================================================

pub const ERR_CMD_SYNCH: u8 = 0x00;
pub const ERR_CMD_BUSY: u8 = 0x10;
pub const ERR_DAQ_ACTIVE: u8 = 0x11;
pub const ERR_PGM_ACTIVE: u8 = 0x12;
pub const ERR_CMD_UNKNOWN: u8 = 0x20;
pub const ERR_CMD_SYNTAX: u8 = 0x21;
pub const ERR_OUT_OF_RANGE: u8 = 0x22;
pub const ERR_WRITE_PROTECTED: u8 = 0x23;
pub const ERR_ACCESS_DENIED: u8 = 0x24;
pub const ERR_ACCESS_LOCKED: u8 = 0x25;
pub const ERR_PAGE_NOT_VALID: u8 = 0x26;
pub const ERR_MODE_NOT_VALID: u8 = 0x27;
pub const ERR_SEGMENT_NOT_VALID: u8 = 0x28;
pub const ERR_SEQUENCE: u8 = 0x29;
pub const ERR_DAQ_CONFIG: u8 = 0x2A;
pub const ERR_MEMORY_OVERFLOW: u8 = 0x30;
pub const ERR_GENERIC: u8 = 0x31;
pub const ERR_VERIFY: u8 = 0x32;

/// Human-readable name for a negative-response code. The code itself is
/// always preserved verbatim in the error value.
pub fn error_name(code: u8) -> &'static str {
    match code {
        ERR_CMD_SYNCH => "ERR_CMD_SYNCH",
        ERR_CMD_BUSY => "ERR_CMD_BUSY",
        ERR_DAQ_ACTIVE => "ERR_DAQ_ACTIVE",
        ERR_PGM_ACTIVE => "ERR_PGM_ACTIVE",
        ERR_CMD_UNKNOWN => "ERR_CMD_UNKNOWN",
        ERR_CMD_SYNTAX => "ERR_CMD_SYNTAX",
        ERR_OUT_OF_RANGE => "ERR_OUT_OF_RANGE",
        ERR_WRITE_PROTECTED => "ERR_WRITE_PROTECTED",
        ERR_ACCESS_DENIED => "ERR_ACCESS_DENIED",
        ERR_ACCESS_LOCKED => "ERR_ACCESS_LOCKED",
        ERR_PAGE_NOT_VALID => "ERR_PAGE_NOT_VALID",
        ERR_MODE_NOT_VALID => "ERR_MODE_NOT_VALID",
        ERR_SEGMENT_NOT_VALID => "ERR_SEGMENT_NOT_VALID",
        ERR_SEQUENCE => "ERR_SEQUENCE",
        ERR_DAQ_CONFIG => "ERR_DAQ_CONFIG",
        ERR_MEMORY_OVERFLOW => "ERR_MEMORY_OVERFLOW",
        ERR_GENERIC => "ERR_GENERIC",
        ERR_VERIFY => "ERR_VERIFY",
        _ => "unknown",
    }
}
