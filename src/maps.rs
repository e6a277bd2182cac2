//! `/proc/<pid>/maps` parsing.
//!
//! Remote symbolization needs to know which image an address belongs to and
//! where that image was loaded, since PIE executables and shared objects are
//! mapped at randomized bases.

use std::fs::File;
use std::io::{BufRead, BufReader};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub permissions: String,
    pub offset: u64,
    pub device: String,
    pub inode: u64,
    pub pathname: String,
}

impl MemoryMapping {
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.permissions.as_bytes().get(2) == Some(&b'x')
    }

    /// File-backed mappings have an absolute path; `[stack]`, `[vdso]` and
    /// anonymous regions do not.
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        self.pathname.starts_with('/')
    }

    /// Translate a runtime address inside this mapping into a file offset.
    #[must_use]
    pub fn file_offset(&self, address: u64) -> u64 {
        address - self.start + self.offset
    }
}

/// Parse one line of a maps file.
///
/// Format: `address perms offset dev inode pathname`, for example
/// `559a9c400000-559a9c401000 r--p 00000000 103:02 2621487 /path/to/exe`.
#[must_use]
pub fn parse_memory_mapping(line: &str) -> Option<MemoryMapping> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }

    let (start, end) = parts[0].split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(parts[2], 16).ok()?;
    let inode = parts[4].parse::<u64>().ok()?;

    Some(MemoryMapping {
        start,
        end,
        permissions: parts[1].to_string(),
        offset,
        device: parts[3].to_string(),
        inode,
        pathname: parts[5..].join(" "),
    })
}

/// The memory map of one process.
#[derive(Debug, Clone, Default)]
pub struct ProcessMaps {
    mappings: Vec<MemoryMapping>,
}

impl ProcessMaps {
    /// Read `/proc/<pid>/maps`.
    pub fn for_pid(pid: i32) -> Result<Self> {
        let file = File::open(format!("/proc/{pid}/maps"))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut mappings = Vec::new();
        for line in reader.lines() {
            if let Some(mapping) = parse_memory_mapping(&line?) {
                mappings.push(mapping);
            }
        }
        Ok(ProcessMaps { mappings })
    }

    #[must_use]
    pub fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }

    #[must_use]
    pub fn find(&self, address: u64) -> Option<&MemoryMapping> {
        self.mappings.iter().find(|m| m.contains(address))
    }

    /// Start of the first mapping of `path` (offset 0), i.e. its load base.
    #[must_use]
    pub fn base_address(&self, path: &str) -> Option<u64> {
        self.mappings
            .iter()
            .find(|m| m.pathname == path && m.offset == 0)
            .map(|m| m.start)
    }

    /// Whether `address` falls in any mapping of `path`.
    #[must_use]
    pub fn image_contains(&self, path: &str, address: u64) -> bool {
        self.mappings
            .iter()
            .any(|m| m.pathname == path && m.contains(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
563b0178b000-563b01807000 r--p 00000000 00:40 3659174697971092           /home/me/app
563b01807000-563b01c4b000 r-xp 0007c000 00:40 3659174697971092           /home/me/app
7f38911ff000-7f38913ff000 rw-p 00000000 00:00 0
7f3892fbd000-7f3892fe0000 r-xp 00001000 08:20 42625                      /usr/lib/ld 2.31.so
7ffd5a1e0000-7ffd5a201000 rw-p 00000000 00:00 0                          [stack]
";

    #[test]
    fn test_parse_line() {
        let m = parse_memory_mapping(SAMPLE.lines().nth(1).unwrap()).unwrap();
        assert_eq!(m.start, 0x563b_0180_7000);
        assert_eq!(m.end, 0x563b_01c4_b000);
        assert_eq!(m.offset, 0x7c000);
        assert_eq!(m.pathname, "/home/me/app");
        assert!(m.is_executable());
        assert!(m.is_file_backed());
    }

    #[test]
    fn test_anonymous_and_spaced_paths() {
        let maps = ProcessMaps::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(maps.mappings().len(), 5);
        assert_eq!(maps.mappings()[2].pathname, "");
        assert!(!maps.mappings()[2].is_file_backed());
        assert_eq!(maps.mappings()[3].pathname, "/usr/lib/ld 2.31.so");
        assert!(!maps.mappings()[4].is_file_backed());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_memory_mapping("not a mapping").is_none());
        assert!(parse_memory_mapping("zz-10 r--p 0 0:0 0 /x").is_none());
    }

    #[test]
    fn test_base_address_and_lookup() {
        let maps = ProcessMaps::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(maps.base_address("/home/me/app"), Some(0x563b_0178_b000));
        assert_eq!(maps.base_address("/nope"), None);

        let addr = 0x563b_0180_7010;
        let m = maps.find(addr).unwrap();
        assert_eq!(m.file_offset(addr), 0x7c010);
        assert!(maps.image_contains("/home/me/app", addr));
        assert!(maps.find(0x10).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_maps_are_readable() {
        let maps = ProcessMaps::for_pid(std::process::id() as i32).unwrap();
        assert!(maps.mappings().iter().any(MemoryMapping::is_executable));
    }
}
