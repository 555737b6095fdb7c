//! Symbol tables: the mapping from dotted/indexed paths to typed target
//! locations.
//!
//! Two producers fill the same table shape: the DWARF reader (from a linked
//! image) and the model-map reader (from target memory). The table is built
//! once per session and read-only afterwards; resolution derives fresh
//! [`Symbol`]s without mutating it.

pub mod dwarf;
pub mod modelmap;

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::{BitField, Type};

/// How a symbol's storage is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// The symbol lives at its address.
    Direct,
    /// The address holds a pointer; the symbol lives at
    /// `*address + inner_offset`. The pointer is read first (one
    /// round-trip), then the pointee.
    Indirect { inner_offset: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    /// Signals and states are observations; writing them is rejected.
    ReadOnly,
}

/// A resolved symbol: immutable once created for a given session.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub path: String,
    /// Address of the storage (of the pointer itself for indirect symbols).
    pub address: u64,
    pub ty: Type,
    pub storage: Storage,
    pub access: Access,
    /// Set when the path names a bit-field member.
    pub bits: Option<BitField>,
}

/// A root entry as produced by a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    pub address: u64,
    pub ty: Type,
    pub access: Access,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: BTreeMap<String, TableEntry>,
}

#[derive(Debug, PartialEq)]
enum PathSegment<'a> {
    Member(&'a str),
    Index(u32),
}

fn parse_path(path: &str) -> Result<Vec<PathSegment<'_>>> {
    let bad = |reason: &str| Error::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    let mut rest = path;
    let mut first = true;
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(|| bad("unterminated index"))?;
            let index: u32 = stripped[..end]
                .trim()
                .parse()
                .map_err(|_| bad("index is not a number"))?;
            segments.push(PathSegment::Index(index));
            rest = &stripped[end + 1..];
        } else {
            let rest2 = if first {
                rest
            } else {
                rest.strip_prefix('.').ok_or_else(|| bad("expected '.'"))?
            };
            let end = rest2
                .find(['.', '[', ']'])
                .unwrap_or(rest2.len());
            if end == 0 {
                return Err(bad("empty member name"));
            }
            segments.push(PathSegment::Member(&rest2[..end]));
            rest = &rest2[end..];
        }
        first = false;
    }
    if segments.is_empty() {
        return Err(bad("empty path"));
    }
    Ok(segments)
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a root entry. The first producer of a path wins; duplicates
    /// are logged and dropped, keeping resolution deterministic.
    pub fn insert(&mut self, path: String, entry: TableEntry) {
        match self.entries.entry(path) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
            }
            std::collections::btree_map::Entry::Occupied(slot) => {
                tracing::debug!(path = %slot.key(), "duplicate symbol ignored");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All root paths, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, path: &str) -> Option<&TableEntry> {
        self.entries.get(path)
    }

    /// Resolve a path to a symbol.
    ///
    /// The path is either a root entry verbatim (model-map paths contain
    /// `/` and match this way) or a root entry followed by member and index
    /// accesses: `outer.inner.leaf`, `array[3].x`. Member access through a
    /// pointer dereferences it implicitly.
    pub fn resolve(&self, path: &str) -> Result<Symbol> {
        if let Some(entry) = self.entries.get(path) {
            return Ok(Symbol {
                path: path.to_string(),
                address: entry.address,
                ty: entry.ty.clone(),
                storage: Storage::Direct,
                access: entry.access,
                bits: None,
            });
        }

        let segments = parse_path(path)?;
        let root = match segments.first() {
            Some(PathSegment::Member(name)) => *name,
            _ => {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                    reason: "path must start with a symbol name".to_string(),
                });
            }
        };
        let entry = self
            .entries
            .get(root)
            .ok_or_else(|| Error::UnknownSymbol(path.to_string()))?;

        self.descend(path, entry, &segments[1..])
    }

    fn descend(&self, path: &str, entry: &TableEntry, segments: &[PathSegment<'_>]) -> Result<Symbol> {
        let mut address = entry.address;
        let mut storage = Storage::Direct;
        let mut ty = entry.ty.clone();
        let mut bits: Option<BitField> = None;

        fn advance(storage: &mut Storage, address: &mut u64, delta: u32) {
            match storage {
                Storage::Direct => *address += u64::from(delta),
                Storage::Indirect { inner_offset } => *inner_offset += delta,
            }
        }

        for segment in segments {
            if bits.is_some() {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                    reason: "cannot access members of a bit-field".to_string(),
                });
            }

            // A member or index access on a pointer dereferences it first.
            if let Type::Pointer { pointee } = &ty {
                if matches!(storage, Storage::Indirect { .. }) {
                    return Err(Error::UnsupportedType(format!(
                        "double indirection in '{}'",
                        path
                    )));
                }
                storage = Storage::Indirect { inner_offset: 0 };
                ty = (**pointee).clone();
            }

            match (segment, &ty) {
                (PathSegment::Member(name), Type::Record { fields, .. }) => {
                    let field = fields
                        .iter()
                        .find(|f| f.name == *name)
                        .ok_or_else(|| Error::UnknownSymbol(path.to_string()))?;
                    advance(&mut storage, &mut address, field.offset);
                    bits = field.bits;
                    ty = field.ty.clone();
                }
                (PathSegment::Index(index), Type::Array { element, len }) => {
                    if *index >= *len {
                        return Err(Error::InvalidPath {
                            path: path.to_string(),
                            reason: format!("index {} out of range (length {})", index, len),
                        });
                    }
                    let stride = element.size();
                    advance(&mut storage, &mut address, index * stride);
                    ty = (**element).clone();
                }
                (PathSegment::Member(_), _) => {
                    return Err(Error::InvalidPath {
                        path: path.to_string(),
                        reason: format!("{} has no members", ty),
                    });
                }
                (PathSegment::Index(_), _) => {
                    return Err(Error::InvalidPath {
                        path: path.to_string(),
                        reason: format!("{} is not an array", ty),
                    });
                }
            }
        }

        Ok(Symbol {
            path: path.to_string(),
            address,
            ty,
            storage,
            access: entry.access,
            bits,
        })
    }
}
