use std::hint::black_box;

use stackcap::{StackFrame, StackTrace, TraceError};

#[inline(never)]
fn a(trace: &mut StackTrace) -> Vec<StackFrame> {
    black_box(b(trace))
}

#[inline(never)]
fn b(trace: &mut StackTrace) -> Vec<StackFrame> {
    black_box(c(trace))
}

#[inline(never)]
fn c(trace: &mut StackTrace) -> Vec<StackFrame> {
    black_box(trace.capture_current_thread().unwrap())
}

#[inline(never)]
fn nested(levels: usize, trace: &mut StackTrace) -> Vec<StackFrame> {
    if levels == 0 {
        black_box(trace.capture_current_thread().unwrap())
    } else {
        black_box(nested(levels - 1, trace))
    }
}

fn names(frames: &[StackFrame]) -> Vec<&str> {
    frames
        .iter()
        .map(|f| f.function_name().unwrap_or("?"))
        .collect()
}

#[test]
fn innermost_frame_is_the_capturing_function() {
    let mut trace = StackTrace::new();
    let frames = a(&mut trace);
    let names = names(&frames);
    assert!(names[0].ends_with("::c"), "{names:?}");
    assert!(names[1].ends_with("::b"), "{names:?}");
    assert!(names[2].ends_with("::a"), "{names:?}");
}

#[test]
fn nested_calls_all_appear() {
    let mut trace = StackTrace::new();
    trace.set_max_depth(256);
    let frames = nested(12, &mut trace);
    assert!(frames.len() >= 12, "only {} frames", frames.len());
    let nested_frames = names(&frames)
        .iter()
        .filter(|n| n.ends_with("::nested"))
        .count();
    assert_eq!(nested_frames, 13);
}

#[test]
fn max_depth_returns_innermost_frames() {
    let mut trace = StackTrace::new();
    trace.set_max_depth(3);
    let frames = nested(10, &mut trace);
    assert_eq!(frames.len(), 3);
    assert!(names(&frames).iter().all(|n| n.ends_with("::nested")));
}

#[test]
fn repeated_capture_resolves_identically() {
    let mut trace = StackTrace::new();
    let mut captures = Vec::new();
    for _ in 0..2 {
        captures.push(c(&mut trace));
    }
    assert_eq!(captures[0][0].address(), captures[1][0].address());
    assert_eq!(captures[0][0].function_name(), captures[1][0].function_name());
    assert_eq!(captures[0][0].line_number(), captures[1][0].line_number());
    assert_eq!(trace.last_trace(), captures[1].as_slice());
}

#[test]
fn missing_process_is_not_running() {
    let mut trace = StackTrace::new();
    let err = trace.capture_process(i32::MAX).unwrap_err();
    assert!(matches!(err, TraceError::ProcessNotRunning(_)), "{err}");
}

#[test]
fn own_process_is_captured_without_attaching() {
    let mut trace = StackTrace::new();
    let frames = trace.capture_process(std::process::id() as i32).unwrap();
    assert!(!frames.is_empty());
    assert!(frames.len() <= trace.max_depth());
}
