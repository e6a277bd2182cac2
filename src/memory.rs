//! Remote memory and register access.

use std::collections::HashMap;

use crate::error::{Result, TraceError};

pub const WORD_SIZE: u64 = 8;

/// The two registers a frame-pointer walk starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub instruction_pointer: u64,
    pub frame_pointer: u64,
}

/// Read access to a stopped target.
pub trait RemoteMemory {
    fn read_word(&self, address: u64) -> Result<u64>;
    fn registers(&self) -> Result<Registers>;
}

/// A fixed memory image, for driving the walker without a live target.
#[derive(Debug, Clone)]
pub struct SnapshotMemory {
    registers: Registers,
    words: HashMap<u64, u64>,
}

impl SnapshotMemory {
    #[must_use]
    pub fn new(registers: Registers) -> Self {
        SnapshotMemory {
            registers,
            words: HashMap::new(),
        }
    }

    pub fn write_word(&mut self, address: u64, value: u64) {
        self.words.insert(address, value);
    }

    /// Lay out a frame record at `frame_pointer`: saved frame pointer, then
    /// the return address one word above it.
    pub fn push_frame(
        &mut self,
        frame_pointer: u64,
        saved_frame_pointer: u64,
        return_address: u64,
    ) {
        self.write_word(frame_pointer, saved_frame_pointer);
        self.write_word(frame_pointer + WORD_SIZE, return_address);
    }
}

impl RemoteMemory for SnapshotMemory {
    fn read_word(&self, address: u64) -> Result<u64> {
        self.words.get(&address).copied().ok_or_else(|| {
            TraceError::CaptureFailed(format!("address 0x{address:x} is not mapped"))
        })
    }

    fn registers(&self) -> Result<Registers> {
        Ok(self.registers)
    }
}

#[cfg(target_os = "linux")]
pub use ptrace_memory::PtraceMemory;

#[cfg(target_os = "linux")]
mod ptrace_memory {
    use nix::libc::c_void;
    use nix::sys::ptrace;
    use nix::unistd::Pid;

    use super::{Registers, RemoteMemory};
    use crate::error::{Result, TraceError};

    // Compile-time architecture verification
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    compile_error!("Remote register access supports only x86_64 and aarch64");

    /// Memory and registers of a ptrace-stopped thread.
    #[derive(Debug, Clone, Copy)]
    pub struct PtraceMemory {
        pid: Pid,
    }

    impl PtraceMemory {
        #[must_use]
        pub fn new(tid: i32) -> Self {
            PtraceMemory {
                pid: Pid::from_raw(tid),
            }
        }
    }

    impl RemoteMemory for PtraceMemory {
        fn read_word(&self, address: u64) -> Result<u64> {
            let pid = self.pid;
            let word = ptrace::read(pid, address as *mut c_void).map_err(|e| {
                TraceError::CaptureFailed(format!("read of 0x{address:x} in {pid} failed: {e}"))
            })?;
            Ok(word as u64)
        }

        fn registers(&self) -> Result<Registers> {
            let regs = ptrace::getregs(self.pid).map_err(|e| {
                TraceError::CaptureFailed(format!("reading registers of {} failed: {e}", self.pid))
            })?;

            #[cfg(target_arch = "x86_64")]
            return Ok(Registers {
                instruction_pointer: regs.rip,
                frame_pointer: regs.rbp,
            });

            // X29 is the frame pointer on ARM64
            #[cfg(target_arch = "aarch64")]
            return Ok(Registers {
                instruction_pointer: regs.pc,
                frame_pointer: regs.regs[29],
            });
        }
    }
}
