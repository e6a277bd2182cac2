//! Address → function/file/line resolution.
//!
//! Three resolver flavours sit behind [`SymbolResolver`]:
//!
//! - [`NativeImageLookup`]: in-process loader lookup for the caller's own
//!   addresses, or the ELF symbol tables and DWARF of every image mapped into
//!   a remote process.
//! - [`DebugLineTool`]: an external `addr2line` process run against the
//!   target's executable.
//! - `OsDebugApi` (Windows only): a DbgHelp symbol-handler session.
//!
//! [`FallbackResolver`] chains a fast resolver with a slower one, which is
//! how the default resolvers are assembled.

pub mod addr2line_tool;
#[cfg(windows)]
pub mod dbghelp;
pub mod image;
pub mod native;

pub use addr2line_tool::DebugLineTool;
#[cfg(windows)]
pub use dbghelp::OsDebugApi;
pub use native::NativeImageLookup;

use log::debug;
use rustc_demangle::try_demangle;

use crate::frame::{AddressKind, StackFrame};

pub trait SymbolResolver {
    /// Resolve `address`, looked up according to `kind`. Never fails: an
    /// address that cannot be resolved produces a frame carrying only the
    /// address.
    fn resolve_as(&self, address: u64, kind: AddressKind) -> StackFrame;

    /// Resolve a return address.
    fn resolve(&self, address: u64) -> StackFrame {
        self.resolve_as(address, AddressKind::ReturnAddress)
    }

    /// Whether this resolver can currently produce anything at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// Resolver of last resort: every frame keeps only its address.
pub struct AddressOnly;

impl SymbolResolver for AddressOnly {
    fn resolve_as(&self, address: u64, _kind: AddressKind) -> StackFrame {
        StackFrame::new(address)
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Tries `primary`, then `fallback` when the primary produced no usable name.
pub struct FallbackResolver {
    primary: Box<dyn SymbolResolver>,
    fallback: Option<Box<dyn SymbolResolver>>,
}

impl FallbackResolver {
    #[must_use]
    pub fn new(
        primary: Box<dyn SymbolResolver>,
        fallback: Option<Box<dyn SymbolResolver>>,
    ) -> Self {
        FallbackResolver { primary, fallback }
    }
}

impl SymbolResolver for FallbackResolver {
    fn resolve_as(&self, address: u64, kind: AddressKind) -> StackFrame {
        let frame = self.primary.resolve_as(address, kind);
        if has_usable_name(&frame) {
            return frame;
        }

        if let Some(fallback) = self.fallback.as_ref().filter(|f| f.is_available()) {
            let second = fallback.resolve_as(address, kind);
            if has_usable_name(&second) {
                debug!("0x{address:x} resolved by fallback resolver");
                return second;
            }
        }

        StackFrame::new(address)
    }

    fn is_available(&self) -> bool {
        self.primary.is_available() || self.fallback.as_ref().is_some_and(|f| f.is_available())
    }
}

fn has_usable_name(frame: &StackFrame) -> bool {
    frame
        .function_name()
        .is_some_and(|name| !looks_like_address(name))
}

/// Some resolvers render an unnamed location as `0x7f3a...` or
/// `libfoo.so+0x1234`; such names carry no symbol information.
#[must_use]
pub fn looks_like_address(name: &str) -> bool {
    let is_hex = |digits: &str| {
        !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_hexdigit())
    };
    let name = name.trim();
    if let Some(digits) = name.strip_prefix("0x") {
        return is_hex(digits);
    }
    name.rsplit_once("+0x").is_some_and(|(_, digits)| is_hex(digits))
}

/// Demangle a Rust symbol without its hash suffix. Names that do not demangle
/// are returned unchanged.
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    match try_demangle(symbol) {
        Ok(demangled) => format!("{demangled:#}"),
        Err(_) => symbol.to_string(),
    }
}
