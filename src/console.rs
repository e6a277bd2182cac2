//! Terminal rendering of captured traces and status messages.

use std::io::{self, IsTerminal, Write};

use crossterm::style::{Color, Stylize};

use crate::frame::StackFrame;
use crate::trace::ThreadTrace;

const FRAME_COLORS: [Color; 2] = [Color::Magenta, Color::Cyan];

/// One frame line: ` 3# 0x55d0c0de` or ` 3# worker::run at src/worker.rs:88`.
#[must_use]
pub fn format_frame(index: usize, frame: &StackFrame) -> String {
    let Some(name) = frame.function_name() else {
        return format!("{index:2}# 0x{:x}", frame.address());
    };
    let mut line = format!("{index:2}# {name}");
    if let Some(file) = frame.source_file() {
        line.push_str(" at ");
        line.push_str(file);
        if let Some(number) = frame.line_number() {
            line.push_str(&format!(":{number}"));
        }
    }
    line
}

pub struct ConsolePrinter {
    color: bool,
}

impl Default for ConsolePrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsolePrinter {
    /// Colours are on when stdout is a terminal.
    #[must_use]
    pub fn new() -> Self {
        ConsolePrinter {
            color: io::stdout().is_terminal(),
        }
    }

    pub fn set_color_enabled(&mut self, enabled: bool) {
        self.color = enabled && io::stdout().is_terminal();
    }

    #[must_use]
    pub fn color_enabled(&self) -> bool {
        self.color
    }

    pub fn write_stack_trace<W: Write>(
        &self,
        out: &mut W,
        frames: &[StackFrame],
    ) -> io::Result<()> {
        if frames.is_empty() {
            return writeln!(out, "No stack frames captured.");
        }
        writeln!(out, "Stack Trace:")?;
        for (index, frame) in frames.iter().enumerate() {
            let line = format_frame(index, frame);
            if self.color {
                let color = FRAME_COLORS[index % FRAME_COLORS.len()];
                writeln!(out, "{}", line.with(color))?;
            } else {
                writeln!(out, "{line}")?;
            }
        }
        Ok(())
    }

    pub fn write_thread_trace<W: Write>(
        &self,
        out: &mut W,
        thread: &ThreadTrace,
    ) -> io::Result<()> {
        let header = format!("=== Thread {} ({}) ===", thread.tid, thread.name);
        if self.color {
            writeln!(out, "{}", header.bold())?;
        } else {
            writeln!(out, "{header}")?;
        }
        self.write_stack_trace(out, &thread.frames)
    }

    pub fn print_stack_trace(&self, frames: &[StackFrame]) {
        let _ = self.write_stack_trace(&mut io::stdout().lock(), frames);
    }

    pub fn print_thread_traces(&self, threads: &[ThreadTrace]) {
        let mut out = io::stdout().lock();
        for thread in threads {
            let _ = self
                .write_thread_trace(&mut out, thread)
                .and_then(|()| writeln!(out));
        }
    }

    pub fn print_error(&self, message: &str) {
        self.status(&mut io::stderr().lock(), "[ERROR]", Color::Red, message);
    }

    pub fn print_warning(&self, message: &str) {
        self.status(&mut io::stderr().lock(), "[WARNING]", Color::Yellow, message);
    }

    pub fn print_info(&self, message: &str) {
        self.status(&mut io::stdout().lock(), "[INFO]", Color::Blue, message);
    }

    pub fn print_success(&self, message: &str) {
        self.status(&mut io::stdout().lock(), "[SUCCESS]", Color::Green, message);
    }

    fn status<W: Write>(&self, out: &mut W, tag: &str, color: Color, message: &str) {
        let _ = if self.color {
            writeln!(out, "{} {message}", tag.with(color).bold())
        } else {
            writeln!(out, "{tag} {message}")
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> ConsolePrinter {
        ConsolePrinter { color: false }
    }

    #[test]
    fn test_format_unresolved_frame() {
        let frame = StackFrame::new(0x7f00_1234);
        assert_eq!(format_frame(0, &frame), " 0# 0x7f001234");
        assert_eq!(format_frame(12, &StackFrame::new(0x10)), "12# 0x10");
    }

    #[test]
    fn test_format_resolved_frame() {
        let named = StackFrame::new(0x1).with_function("c");
        let frame = named.clone().with_location("src/abc.rs", Some(42));
        assert_eq!(format_frame(1, &frame), " 1# c at src/abc.rs:42");
        let frame = named.clone().with_location("libfoo.so", None);
        assert_eq!(format_frame(1, &frame), " 1# c at libfoo.so");
        assert_eq!(format_frame(1, &named), " 1# c");
    }

    #[test]
    fn test_stack_trace_block() {
        let frames = vec![
            StackFrame::new(0x10).with_function("inner"),
            StackFrame::new(0x20),
        ];
        let mut out = Vec::new();
        plain().write_stack_trace(&mut out, &frames).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Stack Trace:\n 0# inner\n 1# 0x20\n");
    }

    #[test]
    fn test_empty_trace_and_status_lines() {
        let mut out = Vec::new();
        plain().write_stack_trace(&mut out, &[]).unwrap();
        plain().status(&mut out, "[INFO]", Color::Blue, "Capturing");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "No stack frames captured.\n[INFO] Capturing\n"
        );
    }

    #[test]
    fn test_thread_header() {
        let thread = ThreadTrace {
            tid: 77,
            name: "worker".into(),
            frames: vec![StackFrame::new(0x5)],
        };
        let mut out = Vec::new();
        plain().write_thread_trace(&mut out, &thread).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("=== Thread 77 (worker) ===\nStack Trace:\n"));
    }
}
