use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, OnceLock, PoisonError};

use log::{debug, warn};

use crate::error::Result;
use crate::frame::{AddressKind, StackFrame};
use crate::maps::ProcessMaps;
use crate::symbols::SymbolResolver;
use crate::symbols::image::load_bias;

pub const DEFAULT_TOOL: &str = "addr2line";

/// Longest reply line accepted from the tool. A longer reply means the tool
/// is confused or hung mid-line; it is killed and respawned on the next use.
const MAX_REPLY_BYTES: u64 = 8 * 1024;

struct ToolProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Drop for ToolProcess {
    fn drop(&mut self) {
        // Closing stdin makes addr2line exit; kill in case it does not.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Resolves addresses by feeding them to an external `addr2line` process.
///
/// The tool is started once with `-f -C -p` and kept alive; each lookup is one
/// line out and one line back. Whether the tool exists is checked on first
/// use and remembered by this instance.
pub struct DebugLineTool {
    tool: OsString,
    executable: String,
    /// Runtime addresses of the executable's mappings, when known.
    maps: Option<ProcessMaps>,
    /// Load bias of the executable, read from its headers on first lookup.
    bias: OnceLock<u64>,
    available: OnceLock<bool>,
    process: Mutex<Option<ToolProcess>>,
}

impl DebugLineTool {
    /// Tool for `executable` with addresses passed through unchanged.
    pub fn new(tool: impl AsRef<OsStr>, executable: impl Into<String>) -> Self {
        DebugLineTool {
            tool: tool.as_ref().to_os_string(),
            executable: executable.into(),
            maps: None,
            bias: OnceLock::new(),
            available: OnceLock::new(),
            process: Mutex::new(None),
        }
    }

    /// Translate runtime addresses using where `executable` is mapped in
    /// `maps`; addresses outside the executable are not sent to the tool.
    ///
    /// Only `maps` is kept here. The executable itself is not opened until
    /// the first lookup.
    #[must_use]
    pub fn with_maps(mut self, maps: ProcessMaps) -> Self {
        self.maps = Some(maps);
        self
    }

    /// Tool for the executable of `pid`, with PIE translation from its maps.
    pub fn for_process(
        tool: impl AsRef<OsStr>,
        pid: i32,
        executable: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::new(tool, executable).with_maps(ProcessMaps::for_pid(pid)?))
    }

    fn bias(&self) -> u64 {
        *self.bias.get_or_init(|| match &self.maps {
            Some(maps) => load_bias(maps, &self.executable),
            None => 0,
        })
    }

    fn spawn(&self) -> std::io::Result<ToolProcess> {
        let mut child = Command::new(&self.tool)
            .arg("-e")
            .arg(&self.executable)
            .arg("-f") // Include function names
            .arg("-C") // Demangle
            .arg("-p") // One line per address
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok(ToolProcess {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            }),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                Err(std::io::Error::other("failed to create pipes to addr2line process"))
            }
        }
    }

    fn query(&self, file_address: u64) -> std::io::Result<String> {
        let mut guard = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let Some(process) = guard.as_mut() else {
            return Err(std::io::Error::other("addr2line process missing"));
        };

        let result = (|| {
            writeln!(process.stdin, "0x{file_address:x}")?;
            process.stdin.flush()?;

            let mut line = String::new();
            let read = (&mut process.stdout)
                .take(MAX_REPLY_BYTES)
                .read_line(&mut line)?;
            if read == 0 || !line.ends_with('\n') {
                return Err(std::io::Error::other("truncated reply from addr2line"));
            }
            Ok(line)
        })();

        if result.is_err() {
            // Out of sync with the tool; start over next time.
            *guard = None;
        }
        result
    }
}

impl SymbolResolver for DebugLineTool {
    fn resolve_as(&self, address: u64, kind: AddressKind) -> StackFrame {
        let frame = StackFrame::new(address);
        if !self.is_available() {
            return frame;
        }

        let lookup = kind.lookup_address(address);
        if let Some(maps) = &self.maps {
            if !maps.image_contains(&self.executable, lookup) {
                return frame;
            }
        }
        let file_address = lookup.saturating_sub(self.bias());

        let reply = match self.query(file_address) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("addr2line lookup of 0x{address:x} failed: {e}");
                return frame;
            }
        };

        let parsed = parse_tool_output(&reply);
        let Some(function) = parsed.function else {
            return frame;
        };
        let frame = frame.with_function(function);
        match parsed.file {
            Some(file) => frame.with_location(file, parsed.line),
            None => frame,
        }
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            let found = Command::new(&self.tool)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok_and(|status| status.success());
            if !found {
                let tool = self.tool.to_string_lossy();
                debug!("{tool} not available; line lookups disabled");
            }
            found
        })
    }
}

/// One parsed reply line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ToolReply {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Parse `function at file:line` (pretty-print mode) or `function(file:line)`.
/// `??`, `?` and a line of 0 mean "unknown" and become `None`.
#[must_use]
pub fn parse_tool_output(output: &str) -> ToolReply {
    let mut text = output.trim_end_matches(['\n', '\r']).trim();
    if let Some(idx) = text.find(" (discriminator") {
        text = text[..idx].trim_end();
    }
    if text.is_empty() {
        return ToolReply::default();
    }

    let (function, location) = if let Some((function, location)) = text.split_once(" at ") {
        (function, Some(location))
    } else if let (Some(open), true) = (text.find('('), text.ends_with(')')) {
        (&text[..open], Some(&text[open + 1..text.len() - 1]))
    } else if let Some((function, location)) = text.split_once(' ') {
        (function, Some(location))
    } else {
        (text, None)
    };

    let known = |s: &str| {
        let s = s.trim();
        (!s.is_empty() && s != "??" && s != "?").then(|| s.to_string())
    };

    let mut reply = ToolReply {
        function: known(function),
        ..ToolReply::default()
    };
    if let Some((file, line)) = location.and_then(|loc| loc.trim().rsplit_once(':')) {
        reply.file = known(file);
        reply.line = line.trim().parse::<u32>().ok().filter(|&l| l > 0);
    }
    reply
}
