//! Descriptors for the target-side data types a symbol can have.
//!
//! A [`Type`] is a tagged tree closed under scalars, fixed-size arrays,
//! records and pointers. Sizes are statically determined except for objects
//! reached through a pointer, whose size is the pointee's size.

use std::fmt;
use std::io::{self, Cursor};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

/// All supported targets are 32-bit; a pointer occupies four bytes.
pub const POINTER_SIZE: u32 = 4;

/// Byte order of multi-byte fields on the target, discovered from the
/// CONNECT response and applied to everything that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    pub fn read_u16(self, cursor: &mut Cursor<&[u8]>) -> io::Result<u16> {
        match self {
            ByteOrder::Little => cursor.read_u16::<LittleEndian>(),
            ByteOrder::Big => cursor.read_u16::<BigEndian>(),
        }
    }

    pub fn read_u32(self, cursor: &mut Cursor<&[u8]>) -> io::Result<u32> {
        match self {
            ByteOrder::Little => cursor.read_u32::<LittleEndian>(),
            ByteOrder::Big => cursor.read_u32::<BigEndian>(),
        }
    }

    pub fn read_i32(self, cursor: &mut Cursor<&[u8]>) -> io::Result<i32> {
        match self {
            ByteOrder::Little => cursor.read_i32::<LittleEndian>(),
            ByteOrder::Big => cursor.read_i32::<BigEndian>(),
        }
    }

    pub fn put_u16(self, buf: &mut Vec<u8>, value: u16) {
        match self {
            ByteOrder::Little => buf.write_u16::<LittleEndian>(value).unwrap(),
            ByteOrder::Big => buf.write_u16::<BigEndian>(value).unwrap(),
        }
    }

    pub fn put_u32(self, buf: &mut Vec<u8>, value: u32) {
        match self {
            ByteOrder::Little => buf.write_u32::<LittleEndian>(value).unwrap(),
            ByteOrder::Big => buf.write_u32::<BigEndian>(value).unwrap(),
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => write!(f, "little-endian"),
            ByteOrder::Big => write!(f, "big-endian"),
        }
    }
}

/// Interpretation of a scalar's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Signed,
    Unsigned,
    Float,
}

/// Bit-field placement within a scalar storage unit.
///
/// `bit_offset` counts from the least significant bit of the storage unit
/// (DWARF v4 `DW_AT_data_bit_offset` semantics; v3 descriptions are
/// converted when parsed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub bit_offset: u8,
    pub bit_width: u8,
}

/// One member of a record type.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    /// Byte offset of the member's storage unit from the record start.
    pub offset: u32,
    pub ty: Type,
    /// Set when the member is a bit-field inside its storage unit.
    pub bits: Option<BitField>,
}

/// Tagged type descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Scalar { kind: ScalarKind, width: u8 },
    Array { element: Box<Type>, len: u32 },
    /// `size` is the full record size including trailing padding, so that
    /// arrays of records stride correctly.
    Record { fields: Vec<Field>, size: u32 },
    Pointer { pointee: Box<Type> },
    /// A type the producer recognised but cannot decode. Symbols with this
    /// type still resolve and enumerate; reading or writing them reports
    /// `reason`.
    Opaque { reason: String, size: u32 },
}

impl Type {
    pub fn signed(width: u8) -> Type {
        Type::Scalar {
            kind: ScalarKind::Signed,
            width,
        }
    }

    pub fn unsigned(width: u8) -> Type {
        Type::Scalar {
            kind: ScalarKind::Unsigned,
            width,
        }
    }

    pub fn float(width: u8) -> Type {
        Type::Scalar {
            kind: ScalarKind::Float,
            width,
        }
    }

    pub fn array(element: Type, len: u32) -> Type {
        Type::Array {
            element: Box::new(element),
            len,
        }
    }

    /// Total size in bytes on the target.
    pub fn size(&self) -> u32 {
        match self {
            Type::Scalar { width, .. } => u32::from(*width),
            Type::Array { element, len } => element.size() * len,
            Type::Record { size, .. } => *size,
            Type::Pointer { .. } => POINTER_SIZE,
            Type::Opaque { size, .. } => *size,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Scalar { .. })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar { kind, width } => {
                let prefix = match kind {
                    ScalarKind::Signed => "i",
                    ScalarKind::Unsigned => "u",
                    ScalarKind::Float => "f",
                };
                write!(f, "{}{}", prefix, u32::from(*width) * 8)
            }
            Type::Array { element, len } => write!(f, "[{}; {}]", element, len),
            Type::Record { fields, .. } => write!(f, "record({} fields)", fields.len()),
            Type::Pointer { pointee } => write!(f, "*{}", pointee),
            Type::Opaque { reason, .. } => write!(f, "unsupported ({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(Type::float(4).size(), 4);
        assert_eq!(Type::array(Type::signed(2), 10).size(), 20);
        assert_eq!(
            Type::Pointer {
                pointee: Box::new(Type::float(8))
            }
            .size(),
            POINTER_SIZE
        );

        // Record size is the declared size, not the sum of the members, so
        // trailing padding is preserved for array strides.
        let rec = Type::Record {
            fields: vec![
                Field {
                    name: "a".into(),
                    offset: 0,
                    ty: Type::unsigned(1),
                    bits: None,
                },
                Field {
                    name: "b".into(),
                    offset: 4,
                    ty: Type::unsigned(4),
                    bits: None,
                },
            ],
            size: 12,
        };
        assert_eq!(rec.size(), 12);
        assert_eq!(Type::array(rec, 3).size(), 36);
    }

    #[test]
    fn display() {
        assert_eq!(Type::signed(4).to_string(), "i32");
        assert_eq!(Type::array(Type::float(4), 3).to_string(), "[f32; 3]");
    }
}
