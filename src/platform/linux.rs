//! Linux backend: ptrace attach and frame-pointer walks through
//! `PTRACE_PEEKDATA`.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::attach::{Capability, DebugPort, ProcessAttachment};
use crate::config::TraceConfig;
use crate::error::{Result, TraceError};
use crate::memory::PtraceMemory;
use crate::platform::{Platform, UNKNOWN_THREAD_NAME, chain_resolvers, is_process_running};
use crate::symbols::{DebugLineTool, NativeImageLookup, SymbolResolver};
use crate::walker::{WalkedStack, walk_frame_pointers};

/// `PTRACE_ATTACH` / `PTRACE_DETACH` on a single thread id.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ptrace;

impl DebugPort for Ptrace {
    fn attach(&self, pid: i32) -> Result<Capability> {
        match ptrace::attach(Pid::from_raw(pid)) {
            Ok(()) => Ok(Capability::Full),
            Err(Errno::ESRCH) => Err(TraceError::ProcessNotRunning(pid)),
            Err(Errno::EPERM) => Err(TraceError::AttachFailed {
                pid,
                reason: "permission denied \
                         (check /proc/sys/kernel/yama/ptrace_scope or run as root)"
                    .into(),
            }),
            Err(e) => Err(TraceError::AttachFailed {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    fn wait_for_stop(&self, pid: i32) -> Result<()> {
        // __WALL so that non-leader threads are waited for as well.
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, signal)) => {
                debug!("Thread {pid} stopped by {signal}");
                Ok(())
            }
            Ok(status) => Err(TraceError::AttachFailed {
                pid,
                reason: format!("unexpected wait status {status:?}"),
            }),
            Err(e) => Err(TraceError::AttachFailed {
                pid,
                reason: format!("wait failed: {e}"),
            }),
        }
    }

    fn detach(&self, pid: i32) -> Result<()> {
        match ptrace::detach(Pid::from_raw(pid), None) {
            Ok(()) => Ok(()),
            // Already gone, nothing left to release.
            Err(Errno::ESRCH) => {
                warn!("Thread {pid} exited while attached");
                Ok(())
            }
            Err(e) => Err(TraceError::DetachFailed {
                pid,
                reason: e.to_string(),
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct LinuxPlatform {
    port: Ptrace,
}

impl Platform for LinuxPlatform {
    type Port = Ptrace;

    fn port(&self) -> &Ptrace {
        &self.port
    }

    fn is_process_running(&self, pid: i32) -> bool {
        is_process_running(pid)
    }

    fn threads(&self, pid: i32) -> Result<Vec<i32>> {
        let mut thread_ids: Vec<i32> = fs::read_dir(format!("/proc/{pid}/task"))
            .map_err(|_| TraceError::ProcessNotRunning(pid))?
            .flatten()
            .filter_map(|entry| entry.file_name().to_string_lossy().parse::<i32>().ok())
            .collect();
        thread_ids.sort_unstable();
        Ok(thread_ids)
    }

    fn thread_name(&self, pid: i32, tid: i32) -> String {
        match fs::read_to_string(format!("/proc/{pid}/task/{tid}/comm")) {
            Ok(name) => name.trim().to_string(),
            Err(_) => UNKNOWN_THREAD_NAME.to_string(),
        }
    }

    fn walk(
        &self,
        attachment: &ProcessAttachment<'_, Ptrace>,
        max_depth: usize,
    ) -> Result<WalkedStack> {
        attachment.require_full()?;
        walk_frame_pointers(&PtraceMemory::new(attachment.pid()), max_depth)
    }

    fn resolver_for(
        &self,
        pid: i32,
        executable: Option<&Path>,
        config: &TraceConfig,
    ) -> Box<dyn SymbolResolver> {
        let native = match NativeImageLookup::for_process(pid) {
            Ok(lookup) => Some(lookup),
            Err(e) => {
                warn!("Image lookup for {pid} unavailable: {e}");
                None
            }
        };

        let tool = match executable {
            Some(exe) if config.use_debug_line_tool => {
                let exe = exe.display().to_string();
                match DebugLineTool::for_process(&config.debug_line_tool, pid, exe) {
                    Ok(tool) => Some(tool),
                    Err(e) => {
                        debug!("addr2line fallback for {pid} unavailable: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        chain_resolvers(native, tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_of_own_process() {
        let platform = LinuxPlatform::default();
        let pid = std::process::id() as i32;
        let threads = platform.threads(pid).unwrap();
        assert!(threads.contains(&pid));
        assert!(threads.windows(2).all(|w| w[0] < w[1]));
        assert_ne!(platform.thread_name(pid, pid), UNKNOWN_THREAD_NAME);
    }

    #[test]
    fn test_unknown_thread_name() {
        let platform = LinuxPlatform::default();
        assert_eq!(platform.thread_name(i32::MAX, i32::MAX), UNKNOWN_THREAD_NAME);
        assert!(matches!(platform.threads(i32::MAX), Err(TraceError::ProcessNotRunning(_))));
    }

    #[test]
    fn test_attach_to_missing_process() {
        let err = Ptrace.attach(i32::MAX).unwrap_err();
        assert!(err.is_attach_error() || matches!(err, TraceError::ProcessNotRunning(_)));
    }
}
