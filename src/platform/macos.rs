//! macOS backend: Mach task ports.
//!
//! Attaching takes the task port and suspends the whole task. There is no
//! portable way to read another task's frame records here, so the walk is a
//! task enumeration: the program counter of every thread, one frame each.
//! A denied task port (no entitlement, SIP) still leaves the process visible,
//! which is reported as metadata-only capability.

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::ptr;

use log::{debug, warn};
use mach2::kern_return::{KERN_SUCCESS, kern_return_t};
use mach2::mach_port::mach_port_deallocate;
use mach2::mach_types::{thread_act_array_t, thread_act_t};
use mach2::message::mach_msg_type_number_t;
use mach2::port::{MACH_PORT_NULL, mach_port_t};
use mach2::task::{task_resume, task_suspend, task_threads};
use mach2::thread_act::thread_get_state;
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::mach_vm_deallocate;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, natural_t};

use crate::attach::{Capability, DebugPort, ProcessAttachment};
use crate::config::TraceConfig;
use crate::error::{Result, TraceError};
use crate::platform::{Platform, chain_resolvers, is_process_running};
use crate::symbols::{DebugLineTool, SymbolResolver};
use crate::walker::{ThreadStates, WalkedStack, walk_threads};

#[cfg(target_arch = "x86_64")]
mod thread_state {
    pub const FLAVOR: i32 = 4; // x86_THREAD_STATE64

    /// rax..r15, rip, rflags, cs, fs, gs
    #[repr(C)]
    #[derive(Default)]
    pub struct State {
        regs: [u64; 21],
    }

    impl State {
        pub fn pc(&self) -> u64 {
            self.regs[16]
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod thread_state {
    pub const FLAVOR: i32 = 6; // ARM_THREAD_STATE64

    #[repr(C)]
    #[derive(Default)]
    #[allow(dead_code)]
    pub struct State {
        x: [u64; 29],
        fp: u64,
        lr: u64,
        sp: u64,
        pc: u64,
        cpsr: u32,
        pad: u32,
    }

    impl State {
        pub fn pc(&self) -> u64 {
            self.pc
        }
    }
}

fn check(kr: kern_return_t, what: &str) -> std::result::Result<(), String> {
    if kr == KERN_SUCCESS {
        Ok(())
    } else {
        Err(format!("{what} returned {kr}"))
    }
}

/// Task ports of suspended targets, keyed by PID.
#[derive(Default)]
pub struct TaskPort {
    tasks: RefCell<HashMap<i32, mach_port_t>>,
}

impl TaskPort {
    fn task(&self, pid: i32) -> Option<mach_port_t> {
        self.tasks.borrow().get(&pid).copied()
    }
}

impl DebugPort for TaskPort {
    fn attach(&self, pid: i32) -> Result<Capability> {
        let mut task: mach_port_t = MACH_PORT_NULL;
        // SAFETY: `task` is a valid out-pointer.
        let kr = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
        if kr != KERN_SUCCESS {
            if is_process_running(pid) {
                warn!("task_for_pid({pid}) returned {kr}; only process metadata is available");
                return Ok(Capability::MetadataOnly);
            }
            return Err(TraceError::ProcessNotRunning(pid));
        }

        // SAFETY: `task` was just obtained for this process.
        if let Err(reason) = check(unsafe { task_suspend(task) }, "task_suspend") {
            // SAFETY: releasing the send right acquired above.
            unsafe { mach_port_deallocate(mach_task_self(), task) };
            return Err(TraceError::AttachFailed { pid, reason });
        }

        self.tasks.borrow_mut().insert(pid, task);
        Ok(Capability::Full)
    }

    fn wait_for_stop(&self, _pid: i32) -> Result<()> {
        // task_suspend only returns once every thread is suspended.
        Ok(())
    }

    fn detach(&self, pid: i32) -> Result<()> {
        let Some(task) = self.tasks.borrow_mut().remove(&pid) else {
            return Ok(());
        };
        // SAFETY: `task` is the send right stored by `attach`.
        let resumed = check(unsafe { task_resume(task) }, "task_resume");
        unsafe { mach_port_deallocate(mach_task_self(), task) };
        resumed.map_err(|reason| TraceError::DetachFailed { pid, reason })
    }
}

struct TaskThreads(mach_port_t);

impl TaskThreads {
    fn program_counter(thread: thread_act_t) -> Option<u64> {
        let mut state = thread_state::State::default();
        let mut count =
            (size_of::<thread_state::State>() / size_of::<natural_t>()) as mach_msg_type_number_t;
        let state_ptr = (&mut state as *mut thread_state::State).cast();
        // SAFETY: `state` is sized for FLAVOR and `count` says so.
        let kr = unsafe { thread_get_state(thread, thread_state::FLAVOR, state_ptr, &mut count) };
        if kr != KERN_SUCCESS {
            debug!("thread_get_state({thread}) returned {kr}");
            return None;
        }
        Some(state.pc())
    }
}

impl ThreadStates for TaskThreads {
    fn program_counters(&self) -> Result<Vec<u64>> {
        let mut threads: thread_act_array_t = ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        // SAFETY: both out-pointers are valid.
        check(unsafe { task_threads(self.0, &mut threads, &mut count) }, "task_threads")
            .map_err(TraceError::CaptureFailed)?;

        // SAFETY: the kernel returned `count` thread ports at `threads`.
        let list = unsafe { std::slice::from_raw_parts(threads, count as usize) };
        let pcs = list
            .iter()
            .filter_map(|&thread| {
                let pc = Self::program_counter(thread);
                // SAFETY: each port in the list is a send right we now own.
                unsafe { mach_port_deallocate(mach_task_self(), thread) };
                pc
            })
            .collect();

        // SAFETY: the array was allocated in our address space by task_threads.
        unsafe {
            mach_vm_deallocate(
                mach_task_self(),
                threads as mach_vm_address_t,
                (count as usize * size_of::<thread_act_t>()) as mach_vm_size_t,
            );
        }
        Ok(pcs)
    }
}

#[derive(Default)]
pub struct MacPlatform {
    port: TaskPort,
}

impl Platform for MacPlatform {
    type Port = TaskPort;

    fn port(&self) -> &TaskPort {
        &self.port
    }

    fn is_process_running(&self, pid: i32) -> bool {
        is_process_running(pid)
    }

    fn walk(
        &self,
        attachment: &ProcessAttachment<'_, TaskPort>,
        max_depth: usize,
    ) -> Result<WalkedStack> {
        attachment.require_full()?;
        let pid = attachment.pid();
        let task = self
            .port
            .task(pid)
            .ok_or_else(|| TraceError::CaptureFailed(format!("no task port held for {pid}")))?;
        walk_threads(&TaskThreads(task), max_depth)
    }

    fn resolver_for(
        &self,
        _pid: i32,
        executable: Option<&Path>,
        config: &TraceConfig,
    ) -> Box<dyn SymbolResolver> {
        // No maps to translate through: runtime addresses go to the tool as-is.
        let tool = executable
            .filter(|_| config.use_debug_line_tool)
            .map(|exe| DebugLineTool::new(&config.debug_line_tool, exe.display().to_string()));
        chain_resolvers(None, tool)
    }
}

pub(crate) fn executable_path(pid: i32) -> Option<PathBuf> {
    let mut buf = vec![0u8; libc::PROC_PIDPATHINFO_MAXSIZE as usize];
    let capacity = buf.len() as u32;
    // SAFETY: `buf` is writable for its full length.
    let len = unsafe { libc::proc_pidpath(pid, buf.as_mut_ptr().cast(), capacity) };
    if len <= 0 {
        return None;
    }
    buf.truncate(len as usize);
    String::from_utf8(buf).ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_executable_path() {
        let path = executable_path(std::process::id() as i32).unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn test_detach_without_attach_is_noop() {
        assert!(TaskPort::default().detach(12345).is_ok());
    }
}
