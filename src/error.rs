//! Error taxonomy for capture, attach and walk operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Process {0} is not running")]
    ProcessNotRunning(i32),

    #[error("Failed to attach to process {pid}: {reason}")]
    AttachFailed { pid: i32, reason: String },

    #[error("Process {0} already has an outstanding attachment")]
    AlreadyAttached(i32),

    #[error("Failed to detach from process {pid}: {reason}")]
    DetachFailed { pid: i32, reason: String },

    #[error("Failed to capture stack trace: {0}")]
    CaptureFailed(String),

    /// The target could be located but its memory and registers are not
    /// readable (for example, a Mach task port was denied).
    #[error("Process {0} is visible but its memory and registers cannot be read")]
    ReducedCapability(i32),

    /// Per-frame condition; never aborts a capture.
    #[error("No symbol information for address 0x{address:x}")]
    ResolutionDegraded { address: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TraceError>;

impl TraceError {
    /// Whether this error came from the attach stage (as opposed to walking or
    /// resolving).
    #[must_use]
    pub fn is_attach_error(&self) -> bool {
        matches!(
            self,
            TraceError::ProcessNotRunning(_)
                | TraceError::AttachFailed { .. }
                | TraceError::AlreadyAttached(_)
                | TraceError::ReducedCapability(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_running_display() {
        let err = TraceError::ProcessNotRunning(4242);
        assert_eq!(err.to_string(), "Process 4242 is not running");
    }

    #[test]
    fn test_attach_failed_carries_reason() {
        let err = TraceError::AttachFailed {
            pid: 7,
            reason: "EPERM: Operation not permitted".into(),
        };
        assert!(err.to_string().contains("EPERM"));
        assert!(err.is_attach_error());
    }

    #[test]
    fn test_degraded_is_not_attach_error() {
        let err = TraceError::ResolutionDegraded { address: 0x1000 };
        assert_eq!(err.to_string(), "No symbol information for address 0x1000");
        assert!(!err.is_attach_error());
    }
}
