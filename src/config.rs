use std::ffi::OsString;

use crate::symbols::addr2line_tool::DEFAULT_TOOL;

pub const DEFAULT_MAX_DEPTH: usize = 64;
pub const MAX_SUPPORTED_DEPTH: usize = 1024;

/// Settings shared by every capture of one [`StackTrace`](crate::StackTrace).
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub max_depth: usize,
    /// Fall back to the external address-to-line tool when the in-process
    /// lookup finds no name.
    pub use_debug_line_tool: bool,
    /// Name or path of that tool.
    pub debug_line_tool: OsString,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            max_depth: DEFAULT_MAX_DEPTH,
            use_debug_line_tool: true,
            debug_line_tool: OsString::from(DEFAULT_TOOL),
        }
    }
}

impl TraceConfig {
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = clamp_depth(max_depth);
        self
    }
}

/// Depths are at least 1 and at most [`MAX_SUPPORTED_DEPTH`].
#[must_use]
pub fn clamp_depth(depth: usize) -> usize {
    depth.clamp(1, MAX_SUPPORTED_DEPTH)
}
