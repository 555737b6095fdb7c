//! Typed views of command response payloads.
//!
//! All parsers take the response payload with the leading PID byte already
//! stripped. Multi-byte fields follow the byte order negotiated at CONNECT,
//! except inside the CONNECT response itself, where the byte order is taken
//! from the same packet before MAX_DTO is read.

use std::io::Cursor;

use super::constants::*;
use crate::error::{Error, Result};
use crate::types::ByteOrder;

fn short_payload(expected: usize, actual: usize) -> Error {
    Error::SizeMismatch { expected, actual }
}

/// Contents of the CONNECT positive response.
#[derive(Debug, Clone, Copy)]
pub struct ConnectInfo {
    pub resources: u8,
    pub comm_mode: u8,
    pub byte_order: ByteOrder,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_version: u8,
    pub transport_version: u8,
}

impl ConnectInfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 7 {
            return Err(short_payload(7, payload.len()));
        }
        let comm_mode = payload[1];
        let byte_order = if comm_mode & COMM_MODE_BYTE_ORDER_MOTOROLA != 0 {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        };
        let mut cursor = Cursor::new(&payload[3..5]);
        let max_dto = byte_order.read_u16(&mut cursor)?;

        Ok(Self {
            resources: payload[0],
            comm_mode,
            byte_order,
            max_cto: payload[2],
            max_dto,
            protocol_version: payload[5],
            transport_version: payload[6],
        })
    }

    pub fn supports_daq(&self) -> bool {
        self.resources & RESOURCE_DAQ != 0
    }

    pub fn supports_calibration(&self) -> bool {
        self.resources & RESOURCE_CAL_PAG != 0
    }
}

/// Contents of the GET_STATUS positive response.
#[derive(Debug, Clone, Copy)]
pub struct StatusInfo {
    pub session_status: u8,
    pub resource_protection: u8,
    pub session_config_id: u16,
}

impl StatusInfo {
    pub fn parse(payload: &[u8], order: ByteOrder) -> Result<Self> {
        if payload.len() < 5 {
            return Err(short_payload(5, payload.len()));
        }
        let mut cursor = Cursor::new(&payload[3..5]);
        Ok(Self {
            session_status: payload[0],
            resource_protection: payload[1],
            session_config_id: order.read_u16(&mut cursor)?,
        })
    }

    pub fn daq_running(&self) -> bool {
        self.session_status & SESSION_STATUS_DAQ_RUNNING != 0
    }
}

/// Contents of the GET_COMM_MODE_INFO positive response.
#[derive(Debug, Clone, Copy)]
pub struct CommModeInfo {
    pub comm_mode_optional: u8,
    pub max_bs: u8,
    pub min_st: u8,
    pub queue_size: u8,
    pub driver_version: u8,
}

impl CommModeInfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 7 {
            return Err(short_payload(7, payload.len()));
        }
        Ok(Self {
            comm_mode_optional: payload[1],
            max_bs: payload[3],
            min_st: payload[4],
            queue_size: payload[5],
            driver_version: payload[6],
        })
    }
}

/// Contents of the GET_DAQ_PROCESSOR_INFO positive response.
#[derive(Debug, Clone, Copy)]
pub struct DaqProcessorInfo {
    pub properties: u8,
    pub max_daq: u16,
    pub max_event_channel: u16,
    pub min_daq: u8,
    pub daq_key_byte: u8,
}

impl DaqProcessorInfo {
    pub fn parse(payload: &[u8], order: ByteOrder) -> Result<Self> {
        if payload.len() < 7 {
            return Err(short_payload(7, payload.len()));
        }
        let mut cursor = Cursor::new(&payload[1..5]);
        Ok(Self {
            properties: payload[0],
            max_daq: order.read_u16(&mut cursor)?,
            max_event_channel: order.read_u16(&mut cursor)?,
            min_daq: payload[5],
            daq_key_byte: payload[6],
        })
    }

    pub fn dynamic_daq(&self) -> bool {
        self.properties & DAQ_PROPERTY_DYNAMIC != 0
    }

    pub fn timestamp_supported(&self) -> bool {
        self.properties & DAQ_PROPERTY_TIMESTAMP != 0
    }
}

/// Contents of the GET_DAQ_RESOLUTION_INFO positive response.
#[derive(Debug, Clone, Copy)]
pub struct DaqResolutionInfo {
    pub granularity_odt_entry_size: u8,
    pub max_odt_entry_size: u8,
    pub timestamp_mode: u8,
    pub timestamp_ticks: u16,
}

impl DaqResolutionInfo {
    pub fn parse(payload: &[u8], order: ByteOrder) -> Result<Self> {
        if payload.len() < 7 {
            return Err(short_payload(7, payload.len()));
        }
        let mut cursor = Cursor::new(&payload[5..7]);
        Ok(Self {
            granularity_odt_entry_size: payload[0],
            max_odt_entry_size: payload[1],
            timestamp_mode: payload[4],
            timestamp_ticks: order.read_u16(&mut cursor)?,
        })
    }

    /// Size in bytes of the timestamp field carried by the first ODT of a
    /// sample, per TIMESTAMP_MODE bits 0..2.
    pub fn timestamp_size(&self) -> u8 {
        match self.timestamp_mode & 0x07 {
            0x01 => 1,
            0x02 => 2,
            0x04 => 4,
            _ => 0,
        }
    }
}
