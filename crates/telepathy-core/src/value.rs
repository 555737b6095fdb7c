//! Dynamically typed values crossing the caller boundary, and the
//! decode/encode dispatch between raw target bytes and those values.
//!
//! Encoding checks numeric range against the destination width before any
//! bytes are produced, so an out-of-range write is rejected without touching
//! the wire.

use std::fmt;

use crate::error::{Error, Result};
use crate::types::{BitField, ByteOrder, ScalarKind, Type};

/// A decoded target value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    SignedInt(i64),
    UnsignedInt(u64),
    Float(f64),
    Array(Vec<Value>),
    /// Field name → value, in declaration order.
    Record(Vec<(String, Value)>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::SignedInt(_) => "signed integer",
            Value::UnsignedInt(_) => "unsigned integer",
            Value::Float(_) => "float",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
        }
    }

    /// Numeric view of a scalar value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::SignedInt(v) => Some(*v as f64),
            Value::UnsignedInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::SignedInt(v) => write!(f, "{}", v),
            Value::UnsignedInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

fn scalar_to_u64(bytes: &[u8], order: ByteOrder) -> u64 {
    let mut value = 0u64;
    match order {
        ByteOrder::Little => {
            for &b in bytes.iter().rev() {
                value = (value << 8) | u64::from(b);
            }
        }
        ByteOrder::Big => {
            for &b in bytes {
                value = (value << 8) | u64::from(b);
            }
        }
    }
    value
}

fn u64_to_bytes(value: u64, width: u8, order: ByteOrder) -> Vec<u8> {
    let mut out = Vec::with_capacity(usize::from(width));
    match order {
        ByteOrder::Little => {
            for i in 0..width {
                out.push((value >> (8 * u32::from(i))) as u8);
            }
        }
        ByteOrder::Big => {
            for i in (0..width).rev() {
                out.push((value >> (8 * u32::from(i))) as u8);
            }
        }
    }
    out
}

fn sign_extend(raw: u64, bit_width: u32) -> i64 {
    if bit_width >= 64 {
        return raw as i64;
    }
    let shift = 64 - bit_width;
    ((raw << shift) as i64) >> shift
}

/// Extract a bit-field from its decoded storage unit.
pub(crate) fn extract_bits(storage: u64, bits: BitField, kind: ScalarKind) -> Result<Value> {
    let width = u32::from(bits.bit_width);
    let mask = if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    let raw = (storage >> bits.bit_offset) & mask;
    match kind {
        ScalarKind::Unsigned => Ok(Value::UnsignedInt(raw)),
        ScalarKind::Signed => Ok(Value::SignedInt(sign_extend(raw, width))),
        ScalarKind::Float => Err(Error::UnsupportedType(
            "bit-field with floating point type".into(),
        )),
    }
}

fn decode_scalar(bytes: &[u8], kind: ScalarKind, width: u8, order: ByteOrder) -> Result<Value> {
    let raw = scalar_to_u64(bytes, order);
    match (kind, width) {
        (ScalarKind::Unsigned, _) => Ok(Value::UnsignedInt(raw)),
        (ScalarKind::Signed, w) => Ok(Value::SignedInt(sign_extend(raw, u32::from(w) * 8))),
        (ScalarKind::Float, 4) => Ok(Value::Float(f64::from(f32::from_bits(raw as u32)))),
        (ScalarKind::Float, 8) => Ok(Value::Float(f64::from_bits(raw))),
        (ScalarKind::Float, w) => Err(Error::UnsupportedType(format!("{}-byte float", w))),
    }
}

/// Interpret `bytes` as a value of type `ty` with the given byte order.
pub fn decode(bytes: &[u8], ty: &Type, order: ByteOrder) -> Result<Value> {
    let expected = ty.size() as usize;
    if bytes.len() != expected {
        return Err(Error::SizeMismatch {
            expected,
            actual: bytes.len(),
        });
    }

    match ty {
        Type::Opaque { reason, .. } => Err(Error::UnsupportedType(reason.clone())),
        Type::Scalar { kind, width } => decode_scalar(bytes, *kind, *width, order),
        Type::Pointer { .. } => Ok(Value::UnsignedInt(scalar_to_u64(bytes, order))),
        Type::Array { element, len } => {
            let stride = element.size() as usize;
            let mut items = Vec::with_capacity(*len as usize);
            for i in 0..*len as usize {
                items.push(decode(&bytes[i * stride..(i + 1) * stride], element, order)?);
            }
            Ok(Value::Array(items))
        }
        Type::Record { fields, .. } => {
            let mut out = Vec::with_capacity(fields.len());
            for field in fields {
                let start = field.offset as usize;
                let end = start + field.ty.size() as usize;
                if end > bytes.len() {
                    return Err(Error::SizeMismatch {
                        expected: end,
                        actual: bytes.len(),
                    });
                }
                let slice = &bytes[start..end];
                let value = match (&field.bits, &field.ty) {
                    (Some(bits), Type::Scalar { kind, .. }) => {
                        extract_bits(scalar_to_u64(slice, order), *bits, *kind)?
                    }
                    (Some(_), other) => {
                        return Err(Error::UnsupportedType(format!(
                            "bit-field with non-scalar type {}",
                            other
                        )));
                    }
                    (None, _) => decode(slice, &field.ty, order)?,
                };
                out.push((field.name.clone(), value));
            }
            Ok(Value::Record(out))
        }
    }
}

fn unsigned_range_check(value: u64, width: u8, ty: &Type) -> Result<u64> {
    if width < 8 && value >= (1u64 << (8 * u32::from(width))) {
        return Err(Error::ValueOutOfRange {
            value: value.to_string(),
            ty: ty.to_string(),
        });
    }
    Ok(value)
}

fn signed_range_check(value: i64, width: u8, ty: &Type) -> Result<u64> {
    if width < 8 {
        let bits = 8 * u32::from(width);
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if value < min || value > max {
            return Err(Error::ValueOutOfRange {
                value: value.to_string(),
                ty: ty.to_string(),
            });
        }
    }
    Ok(value as u64)
}

fn encode_scalar(value: &Value, ty: &Type, kind: ScalarKind, width: u8, order: ByteOrder) -> Result<Vec<u8>> {
    let raw = match (kind, value) {
        (ScalarKind::Unsigned, Value::UnsignedInt(v)) => unsigned_range_check(*v, width, ty)?,
        (ScalarKind::Unsigned, Value::SignedInt(v)) => {
            if *v < 0 {
                return Err(Error::ValueOutOfRange {
                    value: v.to_string(),
                    ty: ty.to_string(),
                });
            }
            unsigned_range_check(*v as u64, width, ty)?
        }
        (ScalarKind::Signed, Value::SignedInt(v)) => signed_range_check(*v, width, ty)?,
        (ScalarKind::Signed, Value::UnsignedInt(v)) => {
            if *v > i64::MAX as u64 {
                return Err(Error::ValueOutOfRange {
                    value: v.to_string(),
                    ty: ty.to_string(),
                });
            }
            signed_range_check(*v as i64, width, ty)?
        }
        (ScalarKind::Float, value) => {
            let v = value.as_f64().ok_or_else(|| Error::TypeMismatch {
                expected: ty.to_string(),
                actual: value.kind_name(),
            })?;
            match width {
                4 => {
                    if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                        return Err(Error::ValueOutOfRange {
                            value: v.to_string(),
                            ty: ty.to_string(),
                        });
                    }
                    u64::from((v as f32).to_bits())
                }
                8 => v.to_bits(),
                w => return Err(Error::UnsupportedType(format!("{}-byte float", w))),
            }
        }
        (_, value) => {
            return Err(Error::TypeMismatch {
                expected: ty.to_string(),
                actual: value.kind_name(),
            });
        }
    };
    Ok(u64_to_bytes(raw, width, order))
}

/// Produce the raw bytes for writing `value` as type `ty`.
pub fn encode(value: &Value, ty: &Type, order: ByteOrder) -> Result<Vec<u8>> {
    match ty {
        Type::Opaque { reason, .. } => Err(Error::UnsupportedType(reason.clone())),
        Type::Scalar { kind, width } => encode_scalar(value, ty, *kind, *width, order),
        Type::Pointer { .. } => {
            let v = match value {
                Value::UnsignedInt(v) => *v,
                other => {
                    return Err(Error::TypeMismatch {
                        expected: ty.to_string(),
                        actual: other.kind_name(),
                    });
                }
            };
            if v > u64::from(u32::MAX) {
                return Err(Error::AddressOverflow(v));
            }
            Ok(u64_to_bytes(v, 4, order))
        }
        Type::Array { element, len } => {
            let items = match value {
                Value::Array(items) => items,
                other => {
                    return Err(Error::TypeMismatch {
                        expected: ty.to_string(),
                        actual: other.kind_name(),
                    });
                }
            };
            if items.len() != *len as usize {
                return Err(Error::SizeMismatch {
                    expected: *len as usize,
                    actual: items.len(),
                });
            }
            let mut out = Vec::with_capacity(ty.size() as usize);
            for item in items {
                out.extend(encode(item, element, order)?);
            }
            Ok(out)
        }
        Type::Record { fields, size } => {
            let values = match value {
                Value::Record(values) => values,
                other => {
                    return Err(Error::TypeMismatch {
                        expected: ty.to_string(),
                        actual: other.kind_name(),
                    });
                }
            };
            let mut out = vec![0u8; *size as usize];
            for field in fields {
                if field.bits.is_some() {
                    // Writing a bit-field needs read-modify-write of the
                    // shared storage unit, which a whole-record write cannot
                    // express.
                    return Err(Error::UnsupportedType(format!(
                        "record with bit-field member '{}' cannot be encoded",
                        field.name
                    )));
                }
                let value = values
                    .iter()
                    .find(|(name, _)| *name == field.name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| Error::TypeMismatch {
                        expected: format!("record with field '{}'", field.name),
                        actual: "record",
                    })?;
                let bytes = encode(value, &field.ty, order)?;
                let start = field.offset as usize;
                out[start..start + bytes.len()].copy_from_slice(&bytes);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;

    fn roundtrip(value: Value, ty: &Type, order: ByteOrder) {
        let bytes = encode(&value, ty, order).unwrap();
        assert_eq!(bytes.len(), ty.size() as usize);
        assert_eq!(decode(&bytes, ty, order).unwrap(), value);
    }

    #[test]
    fn scalar_roundtrips_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            roundtrip(Value::UnsignedInt(0xAB), &Type::unsigned(1), order);
            roundtrip(Value::SignedInt(-2), &Type::signed(2), order);
            roundtrip(Value::SignedInt(-123456), &Type::signed(4), order);
            roundtrip(Value::UnsignedInt(u64::MAX), &Type::unsigned(8), order);
            roundtrip(Value::Float(1.5), &Type::float(4), order);
            roundtrip(Value::Float(-0.1), &Type::float(8), order);
        }
    }

    #[test]
    fn byte_order_matters() {
        let bytes = encode(&Value::UnsignedInt(0x1234), &Type::unsigned(2), ByteOrder::Little)
            .unwrap();
        assert_eq!(bytes, vec![0x34, 0x12]);
        let bytes =
            encode(&Value::UnsignedInt(0x1234), &Type::unsigned(2), ByteOrder::Big).unwrap();
        assert_eq!(bytes, vec![0x12, 0x34]);
    }

    #[test]
    fn float_decodes_ieee754() {
        let bytes = 1.0f32.to_le_bytes();
        assert_eq!(
            decode(&bytes, &Type::float(4), ByteOrder::Little).unwrap(),
            Value::Float(1.0)
        );
    }

    #[test]
    fn out_of_range_writes_rejected() {
        assert!(matches!(
            encode(&Value::UnsignedInt(256), &Type::unsigned(1), ByteOrder::Little),
            Err(Error::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            encode(&Value::SignedInt(128), &Type::signed(1), ByteOrder::Little),
            Err(Error::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            encode(&Value::SignedInt(-1), &Type::unsigned(4), ByteOrder::Little),
            Err(Error::ValueOutOfRange { .. })
        ));
        // At the boundary it still fits.
        assert!(encode(&Value::SignedInt(127), &Type::signed(1), ByteOrder::Little).is_ok());
        assert!(encode(&Value::SignedInt(-128), &Type::signed(1), ByteOrder::Little).is_ok());
    }

    #[test]
    fn array_roundtrip() {
        let ty = Type::array(Type::signed(2), 3);
        roundtrip(
            Value::Array(vec![
                Value::SignedInt(-1),
                Value::SignedInt(0),
                Value::SignedInt(300),
            ]),
            &ty,
            ByteOrder::Little,
        );
    }

    #[test]
    fn record_decode_respects_offsets_and_padding() {
        let ty = Type::Record {
            fields: vec![
                Field {
                    name: "flag".into(),
                    offset: 0,
                    ty: Type::unsigned(1),
                    bits: None,
                },
                Field {
                    name: "count".into(),
                    offset: 4,
                    ty: Type::unsigned(4),
                    bits: None,
                },
            ],
            size: 8,
        };
        let bytes = [0x01, 0xEE, 0xEE, 0xEE, 0x10, 0x00, 0x00, 0x00];
        let value = decode(&bytes, &ty, ByteOrder::Little).unwrap();
        assert_eq!(
            value,
            Value::Record(vec![
                ("flag".into(), Value::UnsignedInt(1)),
                ("count".into(), Value::UnsignedInt(16)),
            ])
        );
    }

    #[test]
    fn bit_fields_mask_and_sign_extend() {
        // Storage unit 0b1110_0100: field at bits [2..5) = 0b001.
        let unsigned = extract_bits(
            0b1110_0100,
            BitField {
                bit_offset: 2,
                bit_width: 3,
            },
            ScalarKind::Unsigned,
        )
        .unwrap();
        assert_eq!(unsigned, Value::UnsignedInt(1));

        // Signed field at bits [5..8) = 0b111 → -1.
        let signed = extract_bits(
            0b1110_0100,
            BitField {
                bit_offset: 5,
                bit_width: 3,
            },
            ScalarKind::Signed,
        )
        .unwrap();
        assert_eq!(signed, Value::SignedInt(-1));
    }

    #[test]
    fn record_with_bitfield_decodes() {
        let ty = Type::Record {
            fields: vec![Field {
                name: "mode".into(),
                offset: 0,
                ty: Type::unsigned(2),
                bits: Some(BitField {
                    bit_offset: 4,
                    bit_width: 4,
                }),
            }],
            size: 2,
        };
        let value = decode(&[0x5A, 0x00], &ty, ByteOrder::Little).unwrap();
        assert_eq!(value, Value::Record(vec![("mode".into(), Value::UnsignedInt(5))]));
    }
}
