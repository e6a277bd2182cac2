//! Platform backends and the small process queries around them.
//!
//! The queries (`is_process_running`, `executable_path`, ...) only help decide
//! which PID to target; the [`Platform`] trait is what the orchestrator
//! drives to attach, walk and pick resolvers for a remote target.

use std::fs;
use std::path::{Path, PathBuf};

use crate::attach::{DebugPort, ProcessAttachment};
use crate::config::TraceConfig;
use crate::error::Result;
use crate::symbols::{
    AddressOnly, DebugLineTool, FallbackResolver, NativeImageLookup, SymbolResolver,
};
use crate::walker::WalkedStack;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub mod unsupported;

#[cfg(target_os = "linux")]
pub type NativePlatform = linux::LinuxPlatform;
#[cfg(target_os = "macos")]
pub type NativePlatform = macos::MacPlatform;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub type NativePlatform = unsupported::UnsupportedPlatform;

pub const UNKNOWN_THREAD_NAME: &str = "<unknown>";

/// Everything a remote capture needs from the operating system.
pub trait Platform {
    type Port: DebugPort;

    fn port(&self) -> &Self::Port;

    fn is_process_running(&self, pid: i32) -> bool;

    /// Executable image of `pid`, symlinks resolved.
    fn executable_path(&self, pid: i32) -> Option<PathBuf> {
        executable_path(pid)
    }

    /// Individually attachable threads of `pid`.
    fn threads(&self, pid: i32) -> Result<Vec<i32>> {
        Ok(vec![pid])
    }

    fn thread_name(&self, _pid: i32, _tid: i32) -> String {
        UNKNOWN_THREAD_NAME.to_string()
    }

    /// Walk the attached target with whatever remote mode this platform has.
    fn walk(
        &self,
        attachment: &ProcessAttachment<'_, Self::Port>,
        max_depth: usize,
    ) -> Result<WalkedStack>;

    /// Resolver for addresses of `pid`. Called while the target is attached,
    /// so it only reads what depends on the live process (its maps). Image
    /// files are opened on first lookup, after the target is released.
    fn resolver_for(
        &self,
        pid: i32,
        executable: Option<&Path>,
        config: &TraceConfig,
    ) -> Box<dyn SymbolResolver>;
}

/// Resolver for the calling process: loader lookup first, then the external
/// tool against our own executable.
#[must_use]
pub fn local_resolver(config: &TraceConfig) -> Box<dyn SymbolResolver> {
    #[cfg(windows)]
    {
        match crate::symbols::OsDebugApi::current_process() {
            Ok(api) => {
                let native = Box::new(NativeImageLookup::in_process());
                return Box::new(FallbackResolver::new(native, Some(Box::new(api))));
            }
            Err(e) => log::warn!("{e}"),
        }
    }

    let fallback = if config.use_debug_line_tool {
        std::env::current_exe().ok().map(|exe| {
            let exe = resolve_symbolic_link(&exe).display().to_string();
            let tool = DebugLineTool::new(&config.debug_line_tool, exe);
            #[cfg(target_os = "linux")]
            let tool = match crate::maps::ProcessMaps::for_pid(std::process::id() as i32) {
                Ok(maps) => tool.with_maps(maps),
                Err(_) => tool,
            };
            Box::new(tool) as Box<dyn SymbolResolver>
        })
    } else {
        None
    };
    Box::new(FallbackResolver::new(Box::new(NativeImageLookup::in_process()), fallback))
}

/// Assemble a remote resolver from whichever parts could be built.
pub(crate) fn chain_resolvers(
    native: Option<NativeImageLookup>,
    tool: Option<DebugLineTool>,
) -> Box<dyn SymbolResolver> {
    match (native, tool) {
        (Some(native), tool) => {
            let tool = tool.map(|t| Box::new(t) as Box<dyn SymbolResolver>);
            Box::new(FallbackResolver::new(Box::new(native), tool))
        }
        (None, Some(tool)) => Box::new(tool),
        (None, None) => Box::new(AddressOnly),
    }
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
}

#[must_use]
pub fn platform_name() -> &'static str {
    if cfg!(target_os = "linux") {
        "Linux"
    } else if cfg!(target_os = "macos") {
        "MacOS"
    } else if cfg!(windows) {
        "Windows"
    } else {
        "Unknown"
    }
}

/// Whether `pid` names a live (non-zombie) process. Inherently racy.
#[must_use]
pub fn is_process_running(pid: i32) -> bool {
    pid > 0 && process_exists(pid)
}

#[cfg(target_os = "linux")]
fn process_exists(pid: i32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return answers_signal(pid);
    };
    // State follows the parenthesised command name, which may itself contain
    // spaces or parentheses.
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next());
    !matches!(state, Some("Z" | "X" | "x"))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_exists(pid: i32) -> bool {
    answers_signal(pid)
}

/// `kill(pid, 0)`: EPERM still proves the process exists.
#[cfg(unix)]
fn answers_signal(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn process_exists(_pid: i32) -> bool {
    true
}

#[cfg(target_os = "linux")]
#[must_use]
pub fn executable_path(pid: i32) -> Option<PathBuf> {
    fs::read_link(format!("/proc/{pid}/exe")).ok()
}

#[cfg(target_os = "macos")]
#[must_use]
pub fn executable_path(pid: i32) -> Option<PathBuf> {
    macos::executable_path(pid)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
#[must_use]
pub fn executable_path(_pid: i32) -> Option<PathBuf> {
    None
}

/// Canonical form of `path`, or `path` itself when it cannot be resolved.
#[must_use]
pub fn resolve_symbolic_link(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[must_use]
pub fn process_name(pid: i32) -> Option<String> {
    let from_comm = fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|name| name.trim().to_string());
    from_comm.or_else(|| {
        let path = executable_path(pid)?;
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
    })
}

/// Every process visible through `/proc`, sorted by PID. Empty where there is
/// no `/proc`.
pub fn list_processes() -> Result<Vec<ProcessInfo>> {
    let Ok(proc_dir) = fs::read_dir("/proc") else {
        return Ok(Vec::new());
    };

    let mut processes: Vec<ProcessInfo> = proc_dir
        .flatten()
        .filter_map(|entry| entry.file_name().to_string_lossy().parse::<i32>().ok())
        .filter_map(|pid| process_name(pid).map(|name| ProcessInfo { pid, name }))
        .collect();
    processes.sort_by_key(|p| p.pid);
    Ok(processes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        assert!(is_process_running(std::process::id() as i32));
    }

    #[test]
    fn test_invalid_pids_are_not_running() {
        assert!(!is_process_running(0));
        assert!(!is_process_running(-5));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_executable_and_listing() {
        let pid = std::process::id() as i32;
        let exe = executable_path(pid).unwrap();
        let current = std::env::current_exe().unwrap();
        assert_eq!(resolve_symbolic_link(&exe), resolve_symbolic_link(&current));
        assert!(process_name(pid).is_some());
        assert!(list_processes().unwrap().iter().any(|p| p.pid == pid));
    }

    #[test]
    fn test_platform_name_is_known() {
        assert_ne!(platform_name(), "");
    }
}
