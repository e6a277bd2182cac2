//! Targets without a remote attach primitive (Windows among them). Local
//! capture still works; remote capture reports the missing facility.

use std::path::Path;

use crate::attach::{Capability, DebugPort, ProcessAttachment};
use crate::config::TraceConfig;
use crate::error::{Result, TraceError};
use crate::platform::{Platform, platform_name};
use crate::symbols::{AddressOnly, SymbolResolver};
use crate::walker::WalkedStack;

fn unsupported() -> TraceError {
    let platform = platform_name();
    TraceError::CaptureFailed(format!("remote capture is not supported on {platform}"))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoDebugPort;

impl DebugPort for NoDebugPort {
    fn attach(&self, _pid: i32) -> Result<Capability> {
        Err(unsupported())
    }

    fn wait_for_stop(&self, _pid: i32) -> Result<()> {
        Err(unsupported())
    }

    fn detach(&self, _pid: i32) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct UnsupportedPlatform {
    port: NoDebugPort,
}

impl Platform for UnsupportedPlatform {
    type Port = NoDebugPort;

    fn port(&self) -> &NoDebugPort {
        &self.port
    }

    fn is_process_running(&self, pid: i32) -> bool {
        // Unknown here; let the attach report what is missing.
        pid > 0
    }

    fn walk(
        &self,
        _attachment: &ProcessAttachment<'_, NoDebugPort>,
        _max_depth: usize,
    ) -> Result<WalkedStack> {
        Err(unsupported())
    }

    #[cfg(windows)]
    fn resolver_for(
        &self,
        pid: i32,
        _executable: Option<&Path>,
        _config: &TraceConfig,
    ) -> Box<dyn SymbolResolver> {
        match crate::symbols::OsDebugApi::for_pid(pid) {
            Ok(api) => Box::new(api),
            Err(e) => {
                log::warn!("{e}");
                Box::new(AddressOnly)
            }
        }
    }

    #[cfg(not(windows))]
    fn resolver_for(
        &self,
        _pid: i32,
        _executable: Option<&Path>,
        _config: &TraceConfig,
    ) -> Box<dyn SymbolResolver> {
        Box::new(AddressOnly)
    }
}
