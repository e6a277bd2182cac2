//! DbgHelp symbol-handler session (Windows).

use std::mem::size_of;

use log::warn;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{
    IMAGEHLP_LINE64, MAX_SYM_NAME, SYMBOL_INFO, SYMOPT_DEFERRED_LOADS, SYMOPT_LOAD_LINES,
    SYMOPT_UNDNAME, SymCleanup, SymFromAddr, SymGetLineFromAddr64, SymInitialize, SymSetOptions,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};
use windows::core::PCSTR;

use crate::error::{Result, TraceError};
use crate::frame::{AddressKind, StackFrame};
use crate::symbols::SymbolResolver;

/// Who created the process handle the session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleOrigin {
    /// `GetCurrentProcess()` pseudo handle: clean the session, nothing to close.
    CurrentProcess,
    /// Opened here: clean the session and close the handle.
    Opened,
    /// Supplied by the caller, who owns both the handle and the session.
    External,
}

/// Symbol lookup through a DbgHelp session bound to one process handle.
///
/// The session lives exactly as long as this value and is torn down once, on
/// drop, and only when the handle was not supplied from outside.
pub struct OsDebugApi {
    process: HANDLE,
    origin: HandleOrigin,
}

impl OsDebugApi {
    pub fn current_process() -> Result<Self> {
        // SAFETY: the pseudo handle is always valid.
        let process = unsafe { GetCurrentProcess() };
        Self::initialize(process, HandleOrigin::CurrentProcess)
    }

    pub fn for_pid(pid: i32) -> Result<Self> {
        // SAFETY: plain handle acquisition; ownership moves into the resolver.
        let access = PROCESS_QUERY_INFORMATION | PROCESS_VM_READ;
        let process = unsafe { OpenProcess(access, false, pid as u32) }.map_err(|e| {
            TraceError::AttachFailed {
                pid,
                reason: e.to_string(),
            }
        })?;
        Self::initialize(process, HandleOrigin::Opened)
    }

    /// Bind to a handle owned by the caller. The caller must keep the handle
    /// open for the resolver's lifetime and clean up the session itself.
    pub fn for_handle(process: HANDLE) -> Result<Self> {
        Self::initialize(process, HandleOrigin::External)
    }

    fn initialize(process: HANDLE, origin: HandleOrigin) -> Result<Self> {
        // SAFETY: `process` is a valid process handle for the duration of the call.
        unsafe {
            SymSetOptions(SYMOPT_UNDNAME | SYMOPT_DEFERRED_LOADS | SYMOPT_LOAD_LINES);
            if let Err(e) = SymInitialize(process, PCSTR::null(), true) {
                if origin == HandleOrigin::Opened {
                    let _ = CloseHandle(process);
                }
                return Err(TraceError::CaptureFailed(format!(
                    "failed to initialize symbol handler: {e}"
                )));
            }
        }
        Ok(OsDebugApi { process, origin })
    }

    fn function_name(&self, address: u64) -> Option<String> {
        // SYMBOL_INFO is followed in memory by up to MAX_SYM_NAME name bytes.
        let words = (size_of::<SYMBOL_INFO>() + MAX_SYM_NAME as usize).div_ceil(size_of::<u64>());
        let mut buffer = vec![0u64; words];
        let symbol = buffer.as_mut_ptr().cast::<SYMBOL_INFO>();
        let mut displacement = 0u64;

        // SAFETY: `buffer` is large enough and suitably aligned for SYMBOL_INFO
        // plus MaxNameLen name bytes.
        unsafe {
            (*symbol).SizeOfStruct = size_of::<SYMBOL_INFO>() as u32;
            (*symbol).MaxNameLen = MAX_SYM_NAME;
            SymFromAddr(self.process, address, Some(&mut displacement), symbol).ok()?;
            let len = ((*symbol).NameLen as usize).min(MAX_SYM_NAME as usize);
            let name = std::slice::from_raw_parts((*symbol).Name.as_ptr().cast::<u8>(), len);
            Some(String::from_utf8_lossy(name).into_owned())
        }
    }

    fn source_line(&self, address: u64) -> Option<(String, u32)> {
        let mut line = IMAGEHLP_LINE64 {
            SizeOfStruct: size_of::<IMAGEHLP_LINE64>() as u32,
            ..Default::default()
        };
        let mut displacement = 0u32;

        // SAFETY: `line` is initialized with its size as DbgHelp requires.
        unsafe {
            SymGetLineFromAddr64(self.process, address, &mut displacement, &mut line).ok()?;
            let file = line.FileName.to_string().ok()?;
            Some((file, line.LineNumber))
        }
    }
}

impl SymbolResolver for OsDebugApi {
    fn resolve_as(&self, address: u64, kind: AddressKind) -> StackFrame {
        let lookup = kind.lookup_address(address);
        let frame = StackFrame::new(address);
        let Some(name) = self.function_name(lookup) else {
            return frame;
        };
        let frame = frame.with_function(name);
        match self.source_line(lookup) {
            Some((file, line)) => frame.with_location(file, Some(line)),
            None => frame,
        }
    }
}

impl Drop for OsDebugApi {
    fn drop(&mut self) {
        if self.origin == HandleOrigin::External {
            return;
        }
        // SAFETY: the session was initialized by this value and is cleaned once.
        unsafe {
            if let Err(e) = SymCleanup(self.process) {
                warn!("SymCleanup failed: {e}");
            }
            if self.origin == HandleOrigin::Opened {
                let _ = CloseHandle(self.process);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn dbghelp_marker() -> u64 {
        std::hint::black_box(3)
    }

    fn marker_address() -> u64 {
        dbghelp_marker as *const () as usize as u64
    }

    #[test]
    fn test_resolves_own_function() {
        let api = OsDebugApi::current_process().unwrap();
        let frame = api.resolve(marker_address() + 1);
        let name = frame.function_name().unwrap_or_default();
        assert!(name.contains("dbghelp_marker"), "got {name}");
    }

    #[test]
    fn test_program_counter_at_function_entry() {
        let api = OsDebugApi::current_process().unwrap();
        let frame = api.resolve_as(marker_address(), AddressKind::ProgramCounter);
        let name = frame.function_name().unwrap_or_default();
        assert!(name.contains("dbghelp_marker"), "got {name}");
    }
}
