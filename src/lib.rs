//! Stack capture and symbolization for the calling thread or a running
//! process.
//!
//! ```no_run
//! use stackcap::StackTrace;
//!
//! let mut trace = StackTrace::new();
//! for frame in trace.capture_current_thread()? {
//!     println!("{frame}");
//! }
//! # Ok::<(), stackcap::TraceError>(())
//! ```

pub mod attach;
pub mod config;
pub mod console;
pub mod error;
pub mod frame;
pub mod maps;
pub mod memory;
pub mod platform;
pub mod symbols;
pub mod trace;
pub mod walker;

pub use attach::{AttachState, Capability, DebugPort, ProcessAttachment};
pub use config::{DEFAULT_MAX_DEPTH, MAX_SUPPORTED_DEPTH, TraceConfig};
pub use console::ConsolePrinter;
pub use error::{Result, TraceError};
pub use frame::{AddressKind, StackFrame};
pub use platform::{NativePlatform, Platform};
pub use symbols::{DebugLineTool, FallbackResolver, NativeImageLookup, SymbolResolver};
pub use trace::{StackTrace, ThreadTrace};
pub use walker::WalkedStack;
