//! Model-map reader: walks the self-describing mapping structure that
//! model-based code generation publishes in target memory and produces a
//! symbol table whose paths follow the model's block hierarchy.
//!
//! The structure is a set of flat tables (signals, parameters, states, data
//! types, dimensions, addresses) that reference each other by index. The
//! whole map is read once through the target interface at session start and
//! resolved into symbols in a second pass; nothing is re-fetched afterwards.
//!
//! Layouts are the 32-bit C-API structures; only mapping version 1 is
//! accepted.

use std::collections::HashMap;
use std::io::Cursor;

use tracing::{debug, info, warn};

use super::{Access, SymbolTable, TableEntry};
use crate::error::{Error, Result};
use crate::target::TargetMemory;
use crate::types::{ByteOrder, Type};

/// Default name of the root structure in the target image.
pub const DEFAULT_ROOT_SYMBOL: &str = "rtwCAPI_ModelMappingInfo";

/// Null-terminated strings are fetched in blocks of this size: a trade-off
/// between round-trips and reading past the end of short strings.
const STRING_BLOCK_SIZE: usize = 64;

/// Upper bound on any table element count; protects against walking garbage
/// if the root address is wrong.
const MAX_TABLE_LEN: u32 = 100_000;

const MAPPING_INFO_SIZE: usize = 48;
const STATIC_INFO_SIZE: usize = 101;
const SIGNAL_SIZE: usize = 28;
const PARAMETER_SIZE: usize = 20;
const STATE_SIZE: usize = 40;
const DATA_TYPE_SIZE: usize = 20;
const DIMENSION_MAP_SIZE: usize = 6;

/// The fully-read model map.
#[derive(Debug)]
pub struct ModelMap {
    pub model_path: Option<String>,
    pub target_type: Option<String>,
    pub checksums: [u32; 4],
    pub symbols: SymbolTable,
}

/// Read the model map rooted at `root_address`.
pub fn read_model_map(
    memory: &dyn TargetMemory,
    order: ByteOrder,
    root_address: u64,
) -> Result<ModelMap> {
    Reader {
        memory,
        order,
        strings: HashMap::new(),
        data_types: HashMap::new(),
        dimensions: HashMap::new(),
        addresses: HashMap::new(),
    }
    .read(root_address)
}

struct DataTypeEntry {
    data_size: u16,
    sl_data_id: u8,
    num_elements: u16,
    is_complex: bool,
    is_pointer: bool,
}

struct ItemEntry {
    addr_index: u32,
    block_path_ptr: u32,
    name_ptr: u32,
    data_type_index: u16,
    dimension_index: u16,
    fixed_point_index: u16,
}

struct StaticInfo {
    signals: (u32, u32),
    root_inputs: (u32, u32),
    root_outputs: (u32, u32),
    block_parameters: (u32, u32),
    model_parameters: (u32, u32),
    states: (u32, u32),
    data_type_map: u32,
    dimension_map: u32,
    dimension_array: u32,
    target_type_ptr: u32,
    checksums: [u32; 4],
}

struct Reader<'a> {
    memory: &'a dyn TargetMemory,
    order: ByteOrder,
    strings: HashMap<u32, Option<String>>,
    data_types: HashMap<u16, Type>,
    dimensions: HashMap<u16, Vec<u32>>,
    addresses: HashMap<u32, u32>,
}

impl Reader<'_> {
    fn read(mut self, root_address: u64) -> Result<ModelMap> {
        let mmi = self.memory.read_memory(root_address, MAPPING_INFO_SIZE)?;
        let version = mmi[0];
        if version != 1 {
            return Err(Error::ModelMapVersion(version));
        }
        let mut cursor = Cursor::new(&mmi[4..]);
        let static_ptr = self.order.read_u32(&mut cursor)?;
        let path_ptr = self.order.read_u32(&mut cursor)?;
        let _full_path_ptr = self.order.read_u32(&mut cursor)?;
        let data_addr_map_ptr = self.order.read_u32(&mut cursor)?;

        let statics = self.read_static_info(static_ptr)?;
        let model_path = self.read_string(path_ptr)?;
        let target_type = self.read_string(statics.target_type_ptr)?;

        info!(
            model = model_path.as_deref().unwrap_or("?"),
            target = target_type.as_deref().unwrap_or("?"),
            signals = statics.signals.1,
            parameters = statics.block_parameters.1 + statics.model_parameters.1,
            states = statics.states.1,
            "reading model map"
        );

        let mut symbols = SymbolTable::new();

        // Parameters first, then signals, then states: when a path exists in
        // more than one category, the earlier category stays accessible.
        for table in [statics.block_parameters, statics.model_parameters] {
            let entries = self.read_item_table(table.0, table.1, PARAMETER_SIZE)?;
            for entry in &entries {
                self.add_symbol(&mut symbols, entry, Access::ReadWrite, false, data_addr_map_ptr, &statics)?;
            }
        }
        for table in [statics.signals, statics.root_inputs, statics.root_outputs] {
            let entries = self.read_item_table(table.0, table.1, SIGNAL_SIZE)?;
            for entry in &entries {
                self.add_symbol(&mut symbols, entry, Access::ReadOnly, true, data_addr_map_ptr, &statics)?;
            }
        }
        {
            let entries = self.read_item_table(statics.states.0, statics.states.1, STATE_SIZE)?;
            for entry in &entries {
                self.add_symbol(&mut symbols, entry, Access::ReadOnly, false, data_addr_map_ptr, &statics)?;
            }
        }

        Ok(ModelMap {
            model_path,
            target_type,
            checksums: statics.checksums,
            symbols,
        })
    }

    fn read_static_info(&mut self, address: u32) -> Result<StaticInfo> {
        let data = self.memory.read_memory(u64::from(address), STATIC_INFO_SIZE)?;
        let mut cursor = Cursor::new(&data[..]);
        let mut pair = |cursor: &mut Cursor<&[u8]>| -> Result<(u32, u32)> {
            let ptr = self.order.read_u32(cursor)?;
            let num = self.order.read_u32(cursor)?;
            if num > MAX_TABLE_LEN {
                return Err(Error::ImageParse(format!(
                    "implausible model map table length {}",
                    num
                )));
            }
            Ok((ptr, num))
        };

        let signals = pair(&mut cursor)?;
        let root_inputs = pair(&mut cursor)?;
        let root_outputs = pair(&mut cursor)?;
        let block_parameters = pair(&mut cursor)?;
        let model_parameters = pair(&mut cursor)?;
        let states = pair(&mut cursor)?;

        let data_type_map = self.order.read_u32(&mut cursor)?;
        let dimension_map = self.order.read_u32(&mut cursor)?;
        let _fixpt_map = self.order.read_u32(&mut cursor)?;
        let _element_map = self.order.read_u32(&mut cursor)?;
        let _sample_time_map = self.order.read_u32(&mut cursor)?;
        let dimension_array = self.order.read_u32(&mut cursor)?;
        let target_type_ptr = self.order.read_u32(&mut cursor)?;
        let checksums = [
            self.order.read_u32(&mut cursor)?,
            self.order.read_u32(&mut cursor)?,
            self.order.read_u32(&mut cursor)?,
            self.order.read_u32(&mut cursor)?,
        ];

        Ok(StaticInfo {
            signals,
            root_inputs,
            root_outputs,
            block_parameters,
            model_parameters,
            states,
            data_type_map,
            dimension_map,
            dimension_array,
            target_type_ptr,
            checksums,
        })
    }

    /// Read a table of signal/parameter/state entries. The three layouts
    /// share their leading fields up to the type/dimension indices; only
    /// the field offsets differ.
    fn read_item_table(&mut self, ptr: u32, num: u32, entry_size: usize) -> Result<Vec<ItemEntry>> {
        if ptr == 0 || num == 0 {
            return Ok(Vec::new());
        }
        let data = self
            .memory
            .read_memory(u64::from(ptr), num as usize * entry_size)?;

        let mut entries = Vec::with_capacity(num as usize);
        for raw in data.chunks_exact(entry_size) {
            let mut cursor = Cursor::new(raw);
            let addr_index = self.order.read_u32(&mut cursor)?;
            let entry = match entry_size {
                SIGNAL_SIZE => {
                    let _sysnum = self.order.read_u32(&mut cursor)?;
                    let block_path_ptr = self.order.read_u32(&mut cursor)?;
                    let name_ptr = self.order.read_u32(&mut cursor)?;
                    let _port_number = self.order.read_u16(&mut cursor)?;
                    let data_type_index = self.order.read_u16(&mut cursor)?;
                    let dimension_index = self.order.read_u16(&mut cursor)?;
                    let fixed_point_index = self.order.read_u16(&mut cursor)?;
                    ItemEntry {
                        addr_index,
                        block_path_ptr,
                        name_ptr,
                        data_type_index,
                        dimension_index,
                        fixed_point_index,
                    }
                }
                PARAMETER_SIZE => {
                    let block_path_ptr = self.order.read_u32(&mut cursor)?;
                    let name_ptr = self.order.read_u32(&mut cursor)?;
                    let data_type_index = self.order.read_u16(&mut cursor)?;
                    let dimension_index = self.order.read_u16(&mut cursor)?;
                    let fixed_point_index = self.order.read_u16(&mut cursor)?;
                    ItemEntry {
                        addr_index,
                        block_path_ptr,
                        name_ptr,
                        data_type_index,
                        dimension_index,
                        fixed_point_index,
                    }
                }
                STATE_SIZE => {
                    let _cont_state_start = self.order.read_i32(&mut cursor)?;
                    let block_path_ptr = self.order.read_u32(&mut cursor)?;
                    let name_ptr = self.order.read_u32(&mut cursor)?;
                    let _path_alias_ptr = self.order.read_u32(&mut cursor)?;
                    let _dwork = self.order.read_u16(&mut cursor)?;
                    let data_type_index = self.order.read_u16(&mut cursor)?;
                    let dimension_index = self.order.read_u16(&mut cursor)?;
                    let fixed_point_index = self.order.read_u16(&mut cursor)?;
                    ItemEntry {
                        addr_index,
                        block_path_ptr,
                        name_ptr,
                        data_type_index,
                        dimension_index,
                        fixed_point_index,
                    }
                }
                other => unreachable!("unknown entry size {}", other),
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    fn add_symbol(
        &mut self,
        symbols: &mut SymbolTable,
        entry: &ItemEntry,
        access: Access,
        reroot_signal_path: bool,
        data_addr_map_ptr: u32,
        statics: &StaticInfo,
    ) -> Result<()> {
        let Some(name) = self.read_string(entry.name_ptr)? else {
            return Ok(());
        };
        let Some(raw_path) = self.read_string(entry.block_path_ptr)? else {
            return Ok(());
        };
        if name.is_empty() {
            return Ok(());
        }

        let block_path = transform_block_path(&raw_path, reroot_signal_path);
        let path = if block_path.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", block_path, name)
        };

        let mut element = self.data_type(entry.data_type_index, statics.data_type_map)?;
        if entry.fixed_point_index != 0 && !matches!(element, Type::Opaque { .. }) {
            element = Type::Opaque {
                reason: "fixed-point data type".to_string(),
                size: element.size(),
            };
        }

        // Undecodable entries stay in the table so they resolve and
        // enumerate; reading or writing one reports the reason.
        let opaque = matches!(element, Type::Opaque { .. });
        if opaque {
            debug!(path = %path, ty = %element, "entry kept with unsupported type");
        }
        let ty = if opaque {
            element
        } else {
            let dims = self.dimensions(entry.dimension_index, statics)?;
            let total: u64 = dims.iter().map(|&d| u64::from(d)).product();
            if total <= 1 {
                element
            } else {
                // Dimensions flatten to one linear array; the map stores
                // column-major data but the element count is what matters
                // for addressing.
                Type::array(element, total as u32)
            }
        };

        let address = self.data_address(entry.addr_index, data_addr_map_ptr)?;
        symbols.insert(
            path,
            TableEntry {
                address: u64::from(address),
                ty,
                access,
            },
        );
        Ok(())
    }

    fn data_type(&mut self, index: u16, map_ptr: u32) -> Result<Type> {
        if let Some(ty) = self.data_types.get(&index) {
            return Ok(ty.clone());
        }
        let address = u64::from(map_ptr) + u64::from(index) * DATA_TYPE_SIZE as u64;
        let data = self.memory.read_memory(address, DATA_TYPE_SIZE)?;
        let mut cursor = Cursor::new(&data[..]);
        let _c_name_ptr = self.order.read_u32(&mut cursor)?;
        let _mw_name_ptr = self.order.read_u32(&mut cursor)?;
        let num_elements = self.order.read_u16(&mut cursor)?;
        let _elements_ptr = self.order.read_u16(&mut cursor)?;
        let data_size = self.order.read_u16(&mut cursor)?;
        let sl_data_id = data[14];
        let flags = data[15];
        let raw = DataTypeEntry {
            data_size,
            sl_data_id,
            num_elements,
            is_complex: flags & 0x01 != 0,
            is_pointer: flags & 0x02 != 0,
        };

        let ty = scalar_for(&raw);
        self.data_types.insert(index, ty.clone());
        Ok(ty)
    }

    fn dimensions(&mut self, index: u16, statics: &StaticInfo) -> Result<Vec<u32>> {
        if let Some(dims) = self.dimensions.get(&index) {
            return Ok(dims.clone());
        }
        if statics.dimension_map == 0 {
            return Ok(Vec::new());
        }
        let address =
            u64::from(statics.dimension_map) + u64::from(index) * DIMENSION_MAP_SIZE as u64;
        let data = self.memory.read_memory(address, DIMENSION_MAP_SIZE)?;
        let dim_array_index = {
            let mut cursor = Cursor::new(&data[2..4]);
            self.order.read_u16(&mut cursor)?
        };
        let num_dims = data[4];
        if num_dims > 0 && statics.dimension_array == 0 {
            return Ok(Vec::new());
        }

        let mut dims = Vec::with_capacity(usize::from(num_dims));
        for k in 0..u64::from(num_dims) {
            let address = u64::from(statics.dimension_array) + (u64::from(dim_array_index) + k) * 4;
            let raw = self.memory.read_memory(address, 4)?;
            let mut cursor = Cursor::new(&raw[..]);
            dims.push(self.order.read_u32(&mut cursor)?);
        }
        self.dimensions.insert(index, dims.clone());
        Ok(dims)
    }

    fn data_address(&mut self, index: u32, map_ptr: u32) -> Result<u32> {
        if let Some(address) = self.addresses.get(&index) {
            return Ok(*address);
        }
        let raw = self
            .memory
            .read_memory(u64::from(map_ptr) + u64::from(index) * 4, 4)?;
        let mut cursor = Cursor::new(&raw[..]);
        let address = self.order.read_u32(&mut cursor)?;
        self.addresses.insert(index, address);
        Ok(address)
    }

    /// Read a null-terminated string, in blocks, with an address cache.
    /// A null pointer reads as `None`.
    fn read_string(&mut self, address: u32) -> Result<Option<String>> {
        if address == 0 {
            return Ok(None);
        }
        if let Some(cached) = self.strings.get(&address) {
            return Ok(cached.clone());
        }

        let mut collected: Vec<u8> = Vec::new();
        let mut block_address = u64::from(address);
        let value = loop {
            let block = self.memory.read_memory(block_address, STRING_BLOCK_SIZE)?;
            if let Some(nul) = block.iter().position(|&b| b == 0) {
                collected.extend(&block[..nul]);
                break String::from_utf8_lossy(&collected).into_owned();
            }
            collected.extend(&block);
            block_address += STRING_BLOCK_SIZE as u64;
            if collected.len() > 4096 {
                warn!(address = format_args!("0x{:X}", address), "unterminated string");
                break String::from_utf8_lossy(&collected).into_owned();
            }
        };

        self.strings.insert(address, Some(value.clone()));
        Ok(Some(value))
    }
}

/// Map an `slDataId` (the Simulink built-in type identifier) to a scalar.
/// Pointer, complex, structured and fixed-point entries become opaque types
/// carrying the reason, so their symbols still resolve and enumerate while
/// any value access reports why it cannot be served.
fn scalar_for(entry: &DataTypeEntry) -> Type {
    let opaque = |reason: String| Type::Opaque {
        reason,
        size: u32::from(entry.data_size),
    };
    if entry.is_pointer {
        return opaque("pointer data type".into());
    }
    if entry.is_complex {
        return opaque("complex data type".into());
    }
    if entry.num_elements > 0 {
        return opaque("structured data type".into());
    }
    let ty = match entry.sl_data_id {
        0 => Type::float(8),    // double
        1 => Type::float(4),    // single
        2 => Type::signed(1),   // int8
        3 => Type::unsigned(1), // uint8
        4 => Type::signed(2),   // int16
        5 => Type::unsigned(2), // uint16
        6 => Type::signed(4),   // int32
        7 => Type::unsigned(4), // uint32
        8 => Type::unsigned(1), // boolean
        other => return opaque(format!("slDataId {}", other)),
    };
    if ty.size() != u32::from(entry.data_size) {
        return opaque(format!(
            "slDataId {} with size {}",
            entry.sl_data_id, entry.data_size
        ));
    }
    ty
}

/// Strip the model-name prefix from a block path; for signals also drop the
/// last component, so the signal hangs off the block that defines it.
/// Embedded newlines in block names become spaces.
fn transform_block_path(path: &str, reroot_signal: bool) -> String {
    let stripped = match path.find('/') {
        Some(idx) => &path[idx + 1..],
        None => "",
    };
    let stripped = if reroot_signal {
        match stripped.rfind('/') {
            Some(idx) => &stripped[..idx],
            None => "",
        }
    } else {
        stripped
    };
    stripped.replace('\n', " ")
}
