use std::ffi::c_void;

use crate::error::Result;
use crate::frame::{AddressKind, StackFrame};
use crate::symbols::SymbolResolver;
use crate::symbols::image::MappedImages;

/// Symbol lookup through the loaded images themselves, without any external
/// tool.
pub enum NativeImageLookup {
    /// Addresses of the calling process, looked up through the platform
    /// unwinder's symbolizer (loader tables plus debug info of the images
    /// loaded here).
    InProcess,
    /// Addresses of another process, looked up in the images it has mapped.
    Mapped(MappedImages),
}

impl NativeImageLookup {
    #[must_use]
    pub fn in_process() -> Self {
        NativeImageLookup::InProcess
    }

    /// Lookup for the images mapped into `pid`.
    pub fn for_process(pid: i32) -> Result<Self> {
        Ok(NativeImageLookup::Mapped(MappedImages::for_pid(pid)?))
    }

    fn resolve_in_process(address: u64, kind: AddressKind) -> StackFrame {
        let mut name = None;
        let mut location = None;

        // Inlined callees are reported first; keep the innermost.
        let lookup = kind.lookup_address(address) as usize as *mut c_void;
        backtrace::resolve(lookup, |symbol| {
            if name.is_some() {
                return;
            }
            name = symbol.name().map(|n| format!("{n:#}"));
            location = symbol
                .filename()
                .map(|file| (file.display().to_string(), symbol.lineno()));
        });

        let mut frame = StackFrame::new(address);
        if let Some(name) = name {
            frame = frame.with_function(name);
            if let Some((file, line)) = location {
                frame = frame.with_location(file, line);
            }
        }
        frame
    }
}

impl SymbolResolver for NativeImageLookup {
    fn resolve_as(&self, address: u64, kind: AddressKind) -> StackFrame {
        match self {
            NativeImageLookup::InProcess => Self::resolve_in_process(address, kind),
            NativeImageLookup::Mapped(images) => images.resolve(address, kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn known_function() -> u64 {
        std::hint::black_box(42)
    }

    fn known_address() -> u64 {
        known_function as *const () as usize as u64
    }

    #[test]
    fn test_resolves_own_function() {
        // An address inside the body, not at its first byte.
        let address = known_address() + 1;
        let frame = NativeImageLookup::in_process().resolve(address);
        assert_eq!(frame.address(), address);
        let name = frame.function_name().expect("own function should resolve");
        assert!(name.contains("known_function"), "got {name}");
    }

    #[test]
    fn test_program_counter_at_function_entry() {
        let frame = NativeImageLookup::in_process()
            .resolve_as(known_address(), AddressKind::ProgramCounter);
        let name = frame.function_name().expect("own function should resolve");
        assert!(name.contains("known_function"), "got {name}");
    }

    #[test]
    fn test_same_address_twice_is_identical() {
        let lookup = NativeImageLookup::in_process();
        let address = known_address() + 1;
        let a = lookup.resolve(address);
        let b = lookup.resolve(address);
        assert_eq!(a.function_name(), b.function_name());
        assert_eq!(a.source_file(), b.source_file());
        assert_eq!(a.line_number(), b.line_number());
    }

    #[test]
    fn test_wild_address_stays_unresolved() {
        let frame = NativeImageLookup::in_process().resolve(0x10);
        assert!(!frame.has_symbol_info());
        assert_eq!(frame.address(), 0x10);
    }
}
