//! Symbolization of addresses inside another process's mapped images.
//!
//! A runtime address is first located in `/proc/<pid>/maps`, turned into an
//! offset within the backing file, and then into the image's own virtual
//! address through its program headers. That address is looked up in the
//! image's symbol table and, when the image carries DWARF, its line tables.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use log::debug;
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol};

use crate::error::Result;
use crate::frame::{AddressKind, StackFrame};
use crate::maps::{MemoryMapping, ProcessMaps};
use crate::symbols::demangle_symbol;

#[derive(Debug, Clone, Copy)]
struct Segment {
    file_offset: u64,
    file_size: u64,
    address: u64,
}

/// Symbols, line tables and load layout of one image file.
pub struct ImageSymbols {
    segments: Vec<Segment>,
    /// Sorted by address.
    symbols: Vec<(u64, String)>,
    dwarf: Option<Context<EndianRcSlice<RunTimeEndian>>>,
}

impl ImageSymbols {
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let data = fs::read(path.as_ref())?;
        let obj = object::File::parse(&*data)?;

        let segments = obj
            .segments()
            .map(|seg| {
                let (file_offset, file_size) = seg.file_range();
                Segment {
                    file_offset,
                    file_size,
                    address: seg.address(),
                }
            })
            .filter(|seg| seg.file_size > 0)
            .collect();

        let mut symbols: Vec<(u64, String)> = obj
            .symbols()
            .chain(obj.dynamic_symbols())
            .filter(|sym| sym.kind() == object::SymbolKind::Text && sym.address() != 0)
            .filter_map(|sym| sym.name().ok().map(|name| (sym.address(), name.to_string())))
            .filter(|(_, name)| !name.is_empty())
            .collect();
        symbols.sort_by_key(|(addr, _)| *addr);
        symbols.dedup_by_key(|(addr, _)| *addr);

        let dwarf = if obj.section_by_name(".debug_info").is_some() {
            Self::load_dwarf(&obj).ok()
        } else {
            None
        };

        Ok(ImageSymbols {
            segments,
            symbols,
            dwarf,
        })
    }

    fn load_dwarf(
        obj: &object::File<'_>,
    ) -> std::result::Result<Context<EndianRcSlice<RunTimeEndian>>, gimli::Error> {
        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| {
            let data = obj
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[][..]));
            Ok::<_, gimli::Error>(EndianRcSlice::new(Rc::from(&*data), endian))
        };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        Context::from_dwarf(dwarf)
    }

    /// Image virtual address for a file offset, if a loaded segment covers it.
    #[must_use]
    pub fn address_for_offset(&self, file_offset: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|seg| {
                file_offset >= seg.file_offset && file_offset < seg.file_offset + seg.file_size
            })
            .map(|seg| file_offset - seg.file_offset + seg.address)
    }

    /// Nearest symbol at or below `address`.
    #[must_use]
    pub fn symbol_name(&self, address: u64) -> Option<&str> {
        let idx = self.symbols.partition_point(|(addr, _)| *addr <= address);
        idx.checked_sub(1).map(|i| self.symbols[i].1.as_str())
    }

    /// Resolve an image-relative address to (function, file, line).
    fn lookup(&self, address: u64) -> (Option<String>, Option<(String, Option<u32>)>) {
        let mut function = None;
        let mut location = None;

        if let Some(ctx) = &self.dwarf {
            if let Ok(mut frames) = ctx.find_frames(address).skip_all_loads() {
                if let Ok(Some(frame)) = frames.next() {
                    function = frame
                        .function
                        .and_then(|f| f.demangle().ok().map(|s| s.to_string()));
                    location = frame
                        .location
                        .and_then(|loc| loc.file.map(|file| (file.to_string(), loc.line)));
                }
            }
        }

        if function.is_none() {
            function = self.symbol_name(address).map(demangle_symbol);
        }
        (function, location)
    }
}

/// Every image mapped into one process, loaded on first use.
pub struct MappedImages {
    maps: ProcessMaps,
    images: RefCell<HashMap<String, Option<Rc<ImageSymbols>>>>,
}

impl MappedImages {
    pub fn for_pid(pid: i32) -> Result<Self> {
        Ok(Self::new(ProcessMaps::for_pid(pid)?))
    }

    #[must_use]
    pub fn new(maps: ProcessMaps) -> Self {
        MappedImages {
            maps,
            images: RefCell::new(HashMap::new()),
        }
    }

    fn image(&self, mapping: &MemoryMapping) -> Option<Rc<ImageSymbols>> {
        self.images
            .borrow_mut()
            .entry(mapping.pathname.clone())
            .or_insert_with(|| match ImageSymbols::load(&mapping.pathname) {
                Ok(image) => Some(Rc::new(image)),
                Err(e) => {
                    debug!("Cannot load symbols from {}: {e}", mapping.pathname);
                    None
                }
            })
            .clone()
    }

    pub fn resolve(&self, address: u64, kind: AddressKind) -> StackFrame {
        let frame = StackFrame::new(address);
        let lookup = kind.lookup_address(address);

        let Some(mapping) = self.maps.find(lookup).filter(|m| m.is_file_backed()) else {
            return frame;
        };
        let Some(image) = self.image(mapping) else {
            return frame;
        };
        let Some(image_address) = image.address_for_offset(mapping.file_offset(lookup)) else {
            return frame;
        };

        match image.lookup(image_address) {
            (Some(function), Some((file, line))) => {
                frame.with_function(function).with_location(file, line)
            }
            (Some(function), None) => frame
                .with_function(function)
                .with_location(mapping.pathname.clone(), None),
            (None, _) => frame,
        }
    }
}

/// Difference between where `path` was loaded in `maps` and the address its
/// image expects, so that `runtime - bias` is an image address. Zero when the
/// image is not mapped.
///
/// Only the program headers are consulted; symbols and debug info stay
/// unread.
#[must_use]
pub fn load_bias(maps: &ProcessMaps, path: &str) -> u64 {
    let Some(base) = maps.base_address(path) else {
        return 0;
    };
    base.saturating_sub(first_segment_address(path).unwrap_or(0))
}

/// Lowest address of a loaded segment with file contents.
fn first_segment_address(path: &str) -> Option<u64> {
    let data = fs::read(path).ok()?;
    let obj = object::File::parse(&*data).ok()?;
    obj.segments()
        .filter(|seg| seg.file_range().1 > 0)
        .map(|seg| seg.address())
        .min()
}
