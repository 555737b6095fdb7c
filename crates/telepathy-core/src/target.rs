//! The memory-access seam between symbol layers and the protocol client.
//!
//! The variable layer and the model-map reader only need byte-level access
//! to target memory. Abstracting it lets tests substitute an in-memory
//! target image for a live connection.

use std::sync::Mutex;

use crate::error::{Error, Result};

pub trait TargetMemory: Send + Sync {
    /// Read `size` bytes at `address`.
    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Write `data` at `address`.
    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()>;
}

/// A simulated target backed by host memory regions.
///
/// Useful for exercising the symbol layers without hardware; an access must
/// fall entirely inside one region.
#[derive(Default)]
pub struct MemoryImage {
    regions: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_region(&self, address: u64, data: Vec<u8>) {
        self.regions.lock().unwrap().push((address, data));
    }

    fn locate<T>(
        &self,
        address: u64,
        size: usize,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Result<T> {
        let mut regions = self.regions.lock().unwrap();
        for (start, data) in regions.iter_mut() {
            if address >= *start && address - *start < data.len() as u64 {
                let offset = (address - *start) as usize;
                if offset + size > data.len() {
                    return Err(Error::SizeMismatch {
                        expected: size,
                        actual: data.len() - offset,
                    });
                }
                return Ok(f(&mut data[offset..offset + size]));
            }
        }
        Err(Error::UnknownSymbol(format!("no data at 0x{:X}", address)))
    }
}

impl TargetMemory for MemoryImage {
    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.locate(address, size, |bytes| bytes.to_vec())
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.locate(address, data.len(), |bytes| bytes.copy_from_slice(data))
    }
}
