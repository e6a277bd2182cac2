use std::cmp::Ordering;
use std::fmt;

use crate::error::TraceError;

/// How a walked address relates to the instruction it stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// The instruction itself, such as the program counter of a stopped
    /// thread.
    ProgramCounter,
    /// The instruction after a call. The call itself sits just below it and
    /// may belong to another line or even the preceding function.
    ReturnAddress,
}

impl AddressKind {
    /// Address whose symbol describes the frame.
    #[must_use]
    pub fn lookup_address(self, address: u64) -> u64 {
        match self {
            AddressKind::ProgramCounter => address,
            AddressKind::ReturnAddress => address.saturating_sub(1),
        }
    }
}

/// One call site of a captured stack.
///
/// Walkers create frames with an address only; resolvers attach symbol
/// information through the `with_*` builders before the frame is handed to
/// the caller. Equality and ordering look at the address alone, so frames can
/// be sorted and deduplicated regardless of how well they were resolved.
#[derive(Debug, Clone)]
pub struct StackFrame {
    address: u64,
    function_name: Option<String>,
    source_file: Option<String>,
    line_number: Option<u32>,
}

impl StackFrame {
    #[must_use]
    pub fn new(address: u64) -> Self {
        StackFrame {
            address,
            function_name: None,
            source_file: None,
            line_number: None,
        }
    }

    /// Attach a function name. Empty names are treated as unresolved.
    #[must_use]
    pub fn with_function(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.function_name = if name.trim().is_empty() {
            None
        } else {
            Some(name)
        };
        self
    }

    /// Attach a source location. A line of 0 means "file known, line unknown".
    #[must_use]
    pub fn with_location(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        let file = file.into();
        if !file.is_empty() {
            self.source_file = Some(file);
            self.line_number = line.filter(|&l| l > 0);
        }
        self
    }

    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[must_use]
    pub fn function_name(&self) -> Option<&str> {
        self.function_name.as_deref()
    }

    #[must_use]
    pub fn source_file(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    #[must_use]
    pub fn line_number(&self) -> Option<u32> {
        self.line_number
    }

    #[must_use]
    pub fn has_symbol_info(&self) -> bool {
        self.function_name.is_some()
    }

    /// Report a frame without a function name as a degraded resolution.
    pub fn check_resolved(&self) -> Result<(), TraceError> {
        if self.has_symbol_info() {
            Ok(())
        } else {
            Err(TraceError::ResolutionDegraded {
                address: self.address,
            })
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.function_name {
            None => write!(f, "0x{:016x}", self.address),
            Some(ref name) => {
                write!(f, "0x{:016x} in {name}", self.address)?;
                if let Some(ref file) = self.source_file {
                    write!(f, " at {file}")?;
                    if let Some(line) = self.line_number {
                        write!(f, ":{line}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl PartialEq for StackFrame {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for StackFrame {}

impl PartialOrd for StackFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StackFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_only_frame_is_unresolved() {
        let frame = StackFrame::new(0xdead_beef);
        assert!(!frame.has_symbol_info());
        assert_eq!(frame.function_name(), None);
        assert!(matches!(
            frame.check_resolved(),
            Err(TraceError::ResolutionDegraded {
                address: 0xdead_beef,
            })
        ));
    }

    #[test]
    fn test_resolution_keeps_address() {
        let frame = StackFrame::new(0x4000)
            .with_function("main")
            .with_location("src/main.rs", Some(12));
        assert!(frame.has_symbol_info());
        assert_eq!(frame.address(), 0x4000);
        assert_eq!(frame.source_file(), Some("src/main.rs"));
        assert_eq!(frame.line_number(), Some(12));
    }

    #[test]
    fn test_empty_name_stays_unresolved() {
        let frame = StackFrame::new(1).with_function("  ");
        assert!(!frame.has_symbol_info());
    }

    #[test]
    fn test_zero_line_recorded_as_absent() {
        let frame = StackFrame::new(1)
            .with_function("f")
            .with_location("/lib/libc.so.6", Some(0));
        assert_eq!(frame.source_file(), Some("/lib/libc.so.6"));
        assert_eq!(frame.line_number(), None);
    }

    #[test]
    fn test_ordering_by_address_only() {
        let mut frames = vec![
            StackFrame::new(0x30).with_function("a"),
            StackFrame::new(0x10),
            StackFrame::new(0x20).with_function("z"),
        ];
        frames.sort();
        let addrs: Vec<u64> = frames.iter().map(StackFrame::address).collect();
        assert_eq!(addrs, vec![0x10, 0x20, 0x30]);
        assert_eq!(StackFrame::new(5), StackFrame::new(5).with_function("x"));
    }

    #[test]
    fn test_lookup_address_by_kind() {
        assert_eq!(AddressKind::ReturnAddress.lookup_address(0x1000), 0xfff);
        assert_eq!(AddressKind::ReturnAddress.lookup_address(0), 0);
        assert_eq!(AddressKind::ProgramCounter.lookup_address(0x1000), 0x1000);
    }

    #[test]
    fn test_display() {
        assert_eq!(StackFrame::new(0x10).to_string(), "0x0000000000000010");
        let frame = StackFrame::new(0x10)
            .with_function("f")
            .with_location("a.rs", Some(3));
        assert_eq!(frame.to_string(), "0x0000000000000010 in f at a.rs:3");
    }
}
