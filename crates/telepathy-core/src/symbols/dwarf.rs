//! Debug-info reader: turns the DWARF sections of a linked ELF image into a
//! symbol table.
//!
//! A pure function of the image file; it never touches the target. Global
//! variables are enumerated from the top-level DIEs of every compile unit;
//! their type chains are walked into [`Type`] descriptors. Variables with
//! types this toolkit cannot represent (function pointers, flexible arrays,
//! recursive structures reached by value) are skipped with a debug log, the
//! rest of the table is unaffected.

use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;

use gimli::Reader as _;

use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use tracing::debug;

use super::{Access, SymbolTable, TableEntry};
use crate::error::{Error, Result};
use crate::types::{BitField, Field, ScalarKind, Type};

type Reader = EndianRcSlice<RunTimeEndian>;
type Die<'abbrev, 'unit> = gimli::DebuggingInformationEntry<'abbrev, 'unit, Reader>;
type Unit = gimli::Unit<Reader>;
type UnitOffset = gimli::UnitOffset<usize>;

/// Contents of a `.version_info` section, used to verify that the image on
/// disk matches the firmware running on the target before any symbol from
/// it is trusted.
#[derive(Debug, Clone)]
pub struct VersionSection {
    pub address: u64,
    pub data: Vec<u8>,
}

/// Result of reading an image: the symbol table plus the optional version
/// section.
#[derive(Debug)]
pub struct ImageSymbols {
    pub symbols: SymbolTable,
    pub version_section: Option<VersionSection>,
}

/// Read DWARF symbols from an ELF file on disk.
pub fn read_image(path: &Path) -> Result<ImageSymbols> {
    let data = std::fs::read(path)
        .map_err(|e| Error::ImageParse(format!("{}: {}", path.display(), e)))?;
    read_image_bytes(&data)
}

/// Read DWARF symbols from an in-memory ELF image.
pub fn read_image_bytes(data: &[u8]) -> Result<ImageSymbols> {
    eprintln!("DEBUG len={}", data.len());
    let file = object::File::parse(data)?;
    let endian = if file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> std::result::Result<Reader, gimli::Error> {
        let data = file
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or_else(|| Cow::Borrowed(&[][..]));
        Ok(EndianRcSlice::new(Rc::from(&*data), endian))
    };
    let dwarf = gimli::Dwarf::load(load_section)?;

    let mut symbols = SymbolTable::new();
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        collect_unit_variables(&dwarf, &unit, &mut symbols)?;
    }

    let version_section = match file.section_by_name(".version_info") {
        Some(section) => Some(VersionSection {
            address: section.address(),
            data: section.data()?.to_vec(),
        }),
        None => None,
    };

    Ok(ImageSymbols {
        symbols,
        version_section,
    })
}

fn collect_unit_variables(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &Unit,
    table: &mut SymbolTable,
) -> Result<()> {
    let mut tree = unit.entries_tree(None)?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() != gimli::DW_TAG_variable {
            continue;
        }
        // Extern declarations have no storage of their own.
        if flag(entry, gimli::DW_AT_declaration) {
            continue;
        }
        let Some(name) = attr_name(dwarf, unit, entry)? else {
            continue;
        };
        let Some(address) = variable_address(unit, entry)? else {
            continue;
        };
        let Some(type_offset) = type_ref(entry)? else {
            continue;
        };

        let mut visiting = HashSet::new();
        match convert_type(dwarf, unit, type_offset, &mut visiting) {
            Ok(ty) => table.insert(
                name,
                TableEntry {
                    address,
                    ty,
                    access: Access::ReadWrite,
                },
            ),
            Err(e) => debug!(variable = %name, error = %e, "skipping variable"),
        }
    }
    Ok(())
}

/// Address of a variable whose location is a plain `DW_OP_addr` expression.
/// Anything fancier (registers, TLS, composite locations) does not describe
/// a global we can reach over the wire.
fn variable_address(unit: &Unit, entry: &Die) -> Result<Option<u64>> {
    let Some(gimli::AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_location)?
    else {
        return Ok(None);
    };
    let mut bytes = expr.0.clone();
    let opcode = match gimli::Reader::read_u8(&mut bytes) {
        Ok(op) => op,
        Err(_) => return Ok(None),
    };
    if opcode != gimli::DW_OP_addr.0 {
        return Ok(None);
    }
    let address =
        gimli::Reader::read_address(&mut bytes, unit.encoding().address_size)?;
    Ok(Some(address))
}

fn attr_name(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &Unit,
    entry: &Die,
) -> Result<Option<String>> {
    let Some(value) = entry.attr_value(gimli::DW_AT_name)? else {
        return Ok(None);
    };
    let string = dwarf.attr_string(unit, value)?;
    Ok(Some(string.to_string_lossy()?.into_owned()))
}

fn type_ref(entry: &Die) -> Result<Option<UnitOffset>> {
    match entry.attr_value(gimli::DW_AT_type)? {
        Some(gimli::AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
        _ => Ok(None),
    }
}

fn udata(entry: &Die, name: gimli::DwAt) -> Option<u64> {
    entry
        .attr(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.udata_value())
}

fn flag(entry: &Die, name: gimli::DwAt) -> bool {
    matches!(
        entry.attr_value(name),
        Ok(Some(gimli::AttributeValue::Flag(true)))
    )
}

/// Convert the DWARF type at `offset` into a [`Type`].
///
/// `visiting` breaks cycles: a structure that reaches itself by value is
/// malformed, and one that reaches itself through a pointer cannot be
/// expressed as a finite descriptor tree, so both are rejected.
fn convert_type(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &Unit,
    offset: UnitOffset,
    visiting: &mut HashSet<usize>,
) -> Result<Type> {
    if !visiting.insert(offset.0) {
        return Err(Error::UnsupportedType("recursive type".to_string()));
    }
    let result = convert_type_inner(dwarf, unit, offset, visiting);
    visiting.remove(&offset.0);
    result
}

fn convert_type_inner(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &Unit,
    offset: UnitOffset,
    visiting: &mut HashSet<usize>,
) -> Result<Type> {
    let entry = unit.entry(offset)?;
    let tag = entry.tag();
    match tag {
        // Transparent wrappers.
        gimli::DW_TAG_typedef
        | gimli::DW_TAG_const_type
        | gimli::DW_TAG_volatile_type
        | gimli::DW_TAG_restrict_type => {
            let inner = type_ref(&entry)?.ok_or_else(|| {
                Error::UnsupportedType(format!("{} without a target type", tag))
            })?;
            convert_type(dwarf, unit, inner, visiting)
        }

        gimli::DW_TAG_base_type => {
            let encoding = match entry.attr_value(gimli::DW_AT_encoding)? {
                Some(gimli::AttributeValue::Encoding(ate)) => ate,
                _ => return Err(Error::UnsupportedType("base type without encoding".into())),
            };
            let width = udata(&entry, gimli::DW_AT_byte_size)
                .ok_or_else(|| Error::UnsupportedType("base type without size".into()))?;
            if !matches!(width, 1 | 2 | 4 | 8) {
                return Err(Error::UnsupportedType(format!("{}-byte scalar", width)));
            }
            let kind = match encoding {
                gimli::DW_ATE_float => ScalarKind::Float,
                gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => ScalarKind::Signed,
                gimli::DW_ATE_unsigned
                | gimli::DW_ATE_unsigned_char
                | gimli::DW_ATE_boolean
                | gimli::DW_ATE_address => ScalarKind::Unsigned,
                other => {
                    return Err(Error::UnsupportedType(format!("encoding {}", other)));
                }
            };
            Ok(Type::Scalar {
                kind,
                width: width as u8,
            })
        }

        // Enumerations read as their underlying unsigned storage.
        gimli::DW_TAG_enumeration_type => {
            let width = udata(&entry, gimli::DW_AT_byte_size)
                .ok_or_else(|| Error::UnsupportedType("enumeration without size".into()))?;
            if !matches!(width, 1 | 2 | 4 | 8) {
                return Err(Error::UnsupportedType(format!("{}-byte enumeration", width)));
            }
            Ok(Type::unsigned(width as u8))
        }

        gimli::DW_TAG_pointer_type => {
            let inner = type_ref(&entry)?
                .ok_or_else(|| Error::UnsupportedType("pointer to void".into()))?;
            let pointee = convert_type(dwarf, unit, inner, visiting)?;
            Ok(Type::Pointer {
                pointee: Box::new(pointee),
            })
        }

        gimli::DW_TAG_array_type => {
            let inner = type_ref(&entry)?
                .ok_or_else(|| Error::UnsupportedType("array without element type".into()))?;
            let element = convert_type(dwarf, unit, inner, visiting)?;

            let mut lengths = Vec::new();
            let mut tree = unit.entries_tree(Some(offset))?;
            let node = tree.root()?;
            let mut children = node.children();
            while let Some(child) = children.next()? {
                let child_entry = child.entry();
                if child_entry.tag() != gimli::DW_TAG_subrange_type {
                    continue;
                }
                let len = if let Some(count) = udata(child_entry, gimli::DW_AT_count) {
                    count
                } else if let Some(upper) = udata(child_entry, gimli::DW_AT_upper_bound) {
                    upper + 1
                } else {
                    return Err(Error::UnsupportedType("array without bounds".into()));
                };
                lengths.push(len as u32);
            }
            if lengths.is_empty() {
                return Err(Error::UnsupportedType("array without dimensions".into()));
            }
            // Multi-dimensional arrays nest from the innermost dimension out.
            let mut ty = element;
            for len in lengths.into_iter().rev() {
                ty = Type::array(ty, len);
            }
            Ok(ty)
        }

        gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type => {
            let size = udata(&entry, gimli::DW_AT_byte_size)
                .ok_or_else(|| Error::UnsupportedType("structure without size".into()))?;
            let fields = collect_members(dwarf, unit, offset, tag == gimli::DW_TAG_union_type, 0, visiting)?;
            Ok(Type::Record {
                fields,
                size: size as u32,
            })
        }

        other => Err(Error::UnsupportedType(other.to_string())),
    }
}

/// Collect the members of a structure or union. Anonymous struct/union
/// members are flattened into the parent with their offsets combined.
/// Members whose types cannot be represented are skipped.
fn collect_members(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &Unit,
    offset: UnitOffset,
    is_union: bool,
    base_offset: u32,
    visiting: &mut HashSet<usize>,
) -> Result<Vec<Field>> {
    let mut fields = Vec::new();
    let mut tree = unit.entries_tree(Some(offset))?;
    let node = tree.root()?;
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() != gimli::DW_TAG_member {
            continue;
        }
        let Some(member_type) = type_ref(entry)? else {
            continue;
        };
        let name = attr_name(dwarf, unit, entry)?;
        let member_offset = if is_union {
            0
        } else {
            udata(entry, gimli::DW_AT_data_member_location).unwrap_or(0) as u32
        };

        match name {
            None => {
                // Anonymous struct/union member: pull its fields up.
                let resolved = resolve_wrappers(unit, member_type)?;
                let inner_tag = unit.entry(resolved)?.tag();
                if inner_tag == gimli::DW_TAG_structure_type
                    || inner_tag == gimli::DW_TAG_union_type
                {
                    let inner = collect_members(
                        dwarf,
                        unit,
                        resolved,
                        inner_tag == gimli::DW_TAG_union_type,
                        base_offset + member_offset,
                        visiting,
                    )?;
                    fields.extend(inner);
                }
            }
            Some(name) => {
                let ty = match convert_type(dwarf, unit, member_type, visiting) {
                    Ok(ty) => ty,
                    Err(e) => {
                        debug!(member = %name, error = %e, "skipping member");
                        continue;
                    }
                };
                let (offset_in_record, bits) = member_placement(entry, member_offset, &ty)?;
                fields.push(Field {
                    name,
                    offset: base_offset + offset_in_record,
                    ty,
                    bits,
                });
            }
        }
    }
    Ok(fields)
}

/// Follow typedef/const/volatile wrappers to the underlying type offset.
fn resolve_wrappers(unit: &Unit, mut offset: UnitOffset) -> Result<UnitOffset> {
    loop {
        let entry = unit.entry(offset)?;
        match entry.tag() {
            gimli::DW_TAG_typedef
            | gimli::DW_TAG_const_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type => {
                let Some(inner) = type_ref(&entry)? else {
                    return Ok(offset);
                };
                offset = inner;
            }
            _ => return Ok(offset),
        }
    }
}

/// Work out a member's storage-unit offset and bit-field placement.
///
/// Bit offsets are normalised to count from the least significant bit of
/// the storage unit (DWARF v4 semantics); v3 `DW_AT_bit_offset` counts from
/// the most significant bit and is converted here.
fn member_placement(
    entry: &Die,
    member_offset: u32,
    ty: &Type,
) -> Result<(u32, Option<BitField>)> {
    let Some(bit_size) = udata(entry, gimli::DW_AT_bit_size) else {
        return Ok((member_offset, None));
    };
    let storage = ty.size();
    if storage == 0 || !ty.is_scalar() {
        return Err(Error::UnsupportedType("bit-field with non-scalar type".into()));
    }

    if let Some(data_bit_offset) = udata(entry, gimli::DW_AT_data_bit_offset) {
        // DWARF v4: bit offset from the start of the containing structure.
        let byte = (data_bit_offset / 8) as u32;
        let unit_start = byte - byte % storage;
        let bit_offset = data_bit_offset - u64::from(unit_start) * 8;
        return Ok((
            unit_start,
            Some(BitField {
                bit_offset: bit_offset as u8,
                bit_width: bit_size as u8,
            }),
        ));
    }

    if let Some(bit_offset_msb) = udata(entry, gimli::DW_AT_bit_offset) {
        // DWARF v3: offset of the field's most significant bit, counted
        // from the most significant bit of the storage unit.
        let storage_bits = u64::from(storage) * 8;
        let bit_offset = storage_bits
            .checked_sub(bit_offset_msb + bit_size)
            .ok_or_else(|| Error::UnsupportedType("bit-field exceeds storage unit".into()))?;
        return Ok((
            member_offset,
            Some(BitField {
                bit_offset: bit_offset as u8,
                bit_width: bit_size as u8,
            }),
        ));
    }

    Err(Error::UnsupportedType(
        "bit-field without a bit offset".into(),
    ))
}
