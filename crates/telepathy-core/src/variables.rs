//! The variable layer: typed read/write of resolved symbols through a
//! target interface.
//!
//! Encoding and range checks happen before any bytes move, so a rejected
//! write never reaches the wire. Symbols reached through a pointer cost one
//! extra round-trip to fetch the pointer first.

use crate::error::{Error, Result};
use crate::symbols::{Access, Storage, Symbol};
use crate::target::TargetMemory;
use crate::types::{ByteOrder, POINTER_SIZE, ScalarKind, Type};
use crate::value::{self, Value};

fn storage_address(
    memory: &dyn TargetMemory,
    order: ByteOrder,
    symbol: &Symbol,
) -> Result<u64> {
    match symbol.storage {
        Storage::Direct => Ok(symbol.address),
        Storage::Indirect { inner_offset } => {
            let raw = memory.read_memory(symbol.address, POINTER_SIZE as usize)?;
            let pointer = match value::decode(&raw, &Type::unsigned(POINTER_SIZE as u8), order)? {
                Value::UnsignedInt(p) => p,
                _ => unreachable!("pointer decodes to an unsigned scalar"),
            };
            Ok(pointer + u64::from(inner_offset))
        }
    }
}

/// Read a symbol's current value.
pub fn read(memory: &dyn TargetMemory, order: ByteOrder, symbol: &Symbol) -> Result<Value> {
    // Symbols kept in the table with a type the toolkit cannot decode are
    // rejected before anything touches the wire.
    if let Type::Opaque { reason, .. } = &symbol.ty {
        return Err(Error::UnsupportedType(reason.clone()));
    }
    let address = storage_address(memory, order, symbol)?;
    let bytes = memory.read_memory(address, symbol.ty.size() as usize)?;

    match symbol.bits {
        None => value::decode(&bytes, &symbol.ty, order),
        Some(bits) => {
            let Type::Scalar { kind, width } = symbol.ty else {
                return Err(Error::UnsupportedType(
                    "bit-field with non-scalar storage".into(),
                ));
            };
            let storage = match value::decode(&bytes, &Type::unsigned(width), order)? {
                Value::UnsignedInt(v) => v,
                _ => unreachable!("unsigned scalar decode"),
            };
            value::extract_bits(storage, bits, kind)
        }
    }
}

/// Write a value to a symbol.
pub fn write(
    memory: &dyn TargetMemory,
    order: ByteOrder,
    symbol: &Symbol,
    new_value: &Value,
) -> Result<()> {
    if symbol.access == Access::ReadOnly {
        return Err(Error::ReadOnlySymbol(symbol.path.clone()));
    }
    if let Type::Opaque { reason, .. } = &symbol.ty {
        return Err(Error::UnsupportedType(reason.clone()));
    }

    match symbol.bits {
        None => {
            // Encode first: an out-of-range value must be rejected before
            // any transaction goes out.
            let bytes = value::encode(new_value, &symbol.ty, order)?;
            let address = storage_address(memory, order, symbol)?;
            memory.write_memory(address, &bytes)
        }
        Some(bits) => write_bit_field(memory, order, symbol, new_value, bits),
    }
}

/// Bit-field writes are a read-modify-write of the enclosing storage unit.
fn write_bit_field(
    memory: &dyn TargetMemory,
    order: ByteOrder,
    symbol: &Symbol,
    new_value: &Value,
    bits: crate::types::BitField,
) -> Result<()> {
    let Type::Scalar { kind, width } = symbol.ty else {
        return Err(Error::UnsupportedType(
            "bit-field with non-scalar storage".into(),
        ));
    };

    let bit_width = u32::from(bits.bit_width);
    let mask = if bit_width >= 64 {
        u64::MAX
    } else {
        (1u64 << bit_width) - 1
    };

    let out_of_range = || Error::ValueOutOfRange {
        value: new_value.to_string(),
        ty: format!("{}-bit field", bits.bit_width),
    };
    let raw = match (kind, new_value) {
        (ScalarKind::Unsigned, Value::UnsignedInt(v)) => {
            if bit_width < 64 && *v > mask {
                return Err(out_of_range());
            }
            *v
        }
        (ScalarKind::Unsigned, Value::SignedInt(v)) if *v >= 0 => {
            let v = *v as u64;
            if bit_width < 64 && v > mask {
                return Err(out_of_range());
            }
            v
        }
        (ScalarKind::Signed, Value::SignedInt(v)) => {
            let min = -(1i64 << (bit_width - 1));
            let max = (1i64 << (bit_width - 1)) - 1;
            if bit_width < 64 && (*v < min || *v > max) {
                return Err(out_of_range());
            }
            (*v as u64) & mask
        }
        (ScalarKind::Signed, Value::UnsignedInt(v)) => {
            let max = (1u64 << (bit_width - 1)) - 1;
            if bit_width < 64 && *v > max {
                return Err(out_of_range());
            }
            *v & mask
        }
        _ => {
            return Err(Error::TypeMismatch {
                expected: format!("{}-bit integer field", bits.bit_width),
                actual: new_value.kind_name(),
            });
        }
    };

    let address = storage_address(memory, order, symbol)?;
    let current = memory.read_memory(address, usize::from(width))?;
    let storage = match value::decode(&current, &Type::unsigned(width), order)? {
        Value::UnsignedInt(v) => v,
        _ => unreachable!("unsigned scalar decode"),
    };

    let merged = (storage & !(mask << bits.bit_offset)) | (raw << bits.bit_offset);
    let bytes = value::encode(&Value::UnsignedInt(merged), &Type::unsigned(width), order)?;
    memory.write_memory(address, &bytes)
}
