//! Attach/detach lifecycle for a foreign process.
//!
//! [`DebugPort`] is the seam over the OS debug-attach primitive (ptrace on
//! Linux, task ports on macOS). [`ProcessAttachment`] drives it: it pairs
//! every successful attach with exactly one detach, waits for the target to
//! stop before reporting success, refuses a second attachment to the same PID
//! from this process, and keeps the calling thread's signals blocked while the
//! target is held.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::{LazyLock, Mutex, PoisonError};

use log::{debug, warn};

use crate::error::{Result, TraceError};

/// What an attachment is allowed to do with its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Memory and registers are readable.
    Full,
    /// The process is known to exist but cannot be inspected.
    MetadataOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Detached,
    Attaching,
    Attached,
    Detaching,
    AttachFailed,
}

/// OS debug-attach primitive.
pub trait DebugPort {
    /// Issue the attach call. Must not wait for the target to stop.
    fn attach(&self, pid: i32) -> Result<Capability>;

    /// Block until the target reports that it has stopped.
    fn wait_for_stop(&self, pid: i32) -> Result<()>;

    fn detach(&self, pid: i32) -> Result<()>;
}

static ACTIVE: LazyLock<Mutex<HashSet<i32>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Entry in the process-wide set of PIDs with an outstanding attachment.
struct Registration(i32);

impl Registration {
    fn acquire(pid: i32) -> Result<Self> {
        let mut active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
        if active.insert(pid) {
            Ok(Registration(pid))
        } else {
            Err(TraceError::AlreadyAttached(pid))
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        ACTIVE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.0);
    }
}

/// Blocks every signal on the current thread and restores the previous mask
/// when dropped. Tied to the thread that created it.
struct SignalMaskGuard {
    #[cfg(unix)]
    previous: nix::sys::signal::SigSet,
    _thread_bound: PhantomData<*const ()>,
}

impl SignalMaskGuard {
    #[cfg(unix)]
    fn block_all() -> Option<Self> {
        use nix::sys::signal::{SigSet, SigmaskHow, pthread_sigmask};

        let mut previous = SigSet::empty();
        match pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut previous)) {
            Ok(()) => Some(SignalMaskGuard {
                previous,
                _thread_bound: PhantomData,
            }),
            Err(e) => {
                warn!("Failed to block signals around attach: {e}");
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn block_all() -> Option<Self> {
        None
    }
}

#[cfg(unix)]
impl Drop for SignalMaskGuard {
    fn drop(&mut self) {
        use nix::sys::signal::{SigmaskHow, pthread_sigmask};

        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!("Failed to restore signal mask: {e}");
        }
    }
}

/// A held attachment to one process.
///
/// Dropping an attachment that is still attached detaches it. The value is
/// neither `Send` nor `Sync`: ptrace only accepts requests from the thread that
/// attached, and the signal mask belongs to that thread too.
pub struct ProcessAttachment<'p, P: DebugPort + ?Sized> {
    port: &'p P,
    pid: i32,
    state: AttachState,
    capability: Capability,
    is_self: bool,
    signal_mask: Option<SignalMaskGuard>,
    registration: Option<Registration>,
}

impl<'p, P: DebugPort + ?Sized> ProcessAttachment<'p, P> {
    /// Attach to `pid` and wait for it to stop.
    ///
    /// Attaching to the calling process is an identity operation: it succeeds
    /// without touching the OS primitive and never detaches anything.
    pub fn attach(port: &'p P, pid: i32) -> Result<Self> {
        if i64::from(pid) == i64::from(std::process::id()) {
            return Ok(ProcessAttachment {
                port,
                pid,
                state: AttachState::Attached,
                capability: Capability::Full,
                is_self: true,
                signal_mask: None,
                registration: None,
            });
        }

        let registration = Registration::acquire(pid)?;
        let mut attachment = ProcessAttachment {
            port,
            pid,
            state: AttachState::Attaching,
            capability: Capability::Full,
            is_self: false,
            signal_mask: SignalMaskGuard::block_all(),
            registration: Some(registration),
        };

        debug!("Attaching to process {pid}");
        match port.attach(pid) {
            Ok(capability) => attachment.capability = capability,
            Err(e) => {
                attachment.state = AttachState::AttachFailed;
                return Err(e);
            }
        }

        if attachment.capability == Capability::Full {
            if let Err(e) = port.wait_for_stop(pid) {
                attachment.state = AttachState::AttachFailed;
                if let Err(detach_err) = port.detach(pid) {
                    warn!("Best-effort detach after failed wait also failed: {detach_err}");
                }
                return Err(match e {
                    TraceError::AttachFailed { .. } => e,
                    other => TraceError::AttachFailed {
                        pid,
                        reason: other.to_string(),
                    },
                });
            }
        }

        attachment.state = AttachState::Attached;
        debug!("Attached to process {pid} ({:?})", attachment.capability);
        Ok(attachment)
    }

    /// Release the target. A second call, or a call on a self attachment, is
    /// a no-op.
    pub fn detach(&mut self) -> Result<()> {
        if self.is_self || self.state != AttachState::Attached {
            return Ok(());
        }

        self.state = AttachState::Detaching;
        let result = self.port.detach(self.pid);
        self.state = AttachState::Detached;
        self.registration = None;
        self.signal_mask = None;
        debug!("Detached from process {}", self.pid);
        result
    }

    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    #[must_use]
    pub fn is_self(&self) -> bool {
        self.is_self
    }

    #[must_use]
    pub fn state(&self) -> AttachState {
        self.state
    }

    #[must_use]
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Fail with `ReducedCapability` unless memory and registers are readable.
    pub fn require_full(&self) -> Result<()> {
        match self.capability {
            Capability::Full => Ok(()),
            Capability::MetadataOnly => Err(TraceError::ReducedCapability(self.pid)),
        }
    }
}

impl<P: DebugPort + ?Sized> Drop for ProcessAttachment<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("{e}");
        }
    }
}
