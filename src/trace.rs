//! Capture orchestration: attach, walk, release, then resolve.

use std::path::PathBuf;

use log::{debug, warn};

use crate::attach::ProcessAttachment;
use crate::config::{TraceConfig, clamp_depth};
use crate::error::{Result, TraceError};
use crate::frame::StackFrame;
use crate::platform::{self, NativePlatform, Platform};
use crate::symbols::SymbolResolver;
use crate::walker::{WalkedStack, walk_local};

/// Stack of one thread of a remote process.
#[derive(Debug, Clone)]
pub struct ThreadTrace {
    pub tid: i32,
    pub name: String,
    pub frames: Vec<StackFrame>,
}

/// Captures and symbolizes stacks of the calling thread or another process.
///
/// Remote targets are stopped only while their stack is walked. Resolution
/// runs after the target has been released, against the images on disk.
pub struct StackTrace<P: Platform = NativePlatform> {
    platform: P,
    config: TraceConfig,
    /// Resolver for our own addresses, built on first use and kept so that a
    /// running `addr2line` survives between captures.
    local_resolver: Option<Box<dyn SymbolResolver>>,
    last_trace: Vec<StackFrame>,
}

impl StackTrace<NativePlatform> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_platform(NativePlatform::default())
    }
}

impl Default for StackTrace<NativePlatform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> StackTrace<P> {
    pub fn with_platform(platform: P) -> Self {
        StackTrace {
            platform,
            config: TraceConfig::default(),
            local_resolver: None,
            last_trace: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: TraceConfig) -> Self {
        self.config = TraceConfig {
            max_depth: clamp_depth(config.max_depth),
            ..config
        };
        self.local_resolver = None;
        self
    }

    /// Use `resolver` for captures of the calling thread.
    #[must_use]
    pub fn with_local_resolver(mut self, resolver: Box<dyn SymbolResolver>) -> Self {
        self.local_resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.config.max_depth
    }

    /// Applies to later captures only.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.config.max_depth = clamp_depth(max_depth);
    }

    /// Frames of the most recent successful capture.
    #[must_use]
    pub fn last_trace(&self) -> &[StackFrame] {
        &self.last_trace
    }

    /// Stack of the calling thread, innermost first. Frame 0 is the caller of
    /// this method.
    #[inline(never)]
    pub fn capture_current_thread(&mut self) -> Result<Vec<StackFrame>> {
        let walked = walk_local(self.config.max_depth, 1);
        self.finish_local(walked)
    }

    /// Stack of `pid`.
    ///
    /// Fails with `ProcessNotRunning` before any attach when the process is
    /// gone. Once attached, the target is always released, whatever the walk
    /// returns.
    #[inline(never)]
    pub fn capture_process(&mut self, pid: i32) -> Result<Vec<StackFrame>> {
        if !self.platform.is_process_running(pid) {
            return Err(TraceError::ProcessNotRunning(pid));
        }

        if is_own_pid(pid) {
            debug!("Process {pid} is the caller; walking locally");
            let walked = walk_local(self.config.max_depth, 1);
            return self.finish_local(walked);
        }

        let max_depth = self.config.max_depth;
        let executable = self.executable(pid);

        let (walked, resolver) = {
            let mut attachment = ProcessAttachment::attach(self.platform.port(), pid)?;
            let walked = self.platform.walk(&attachment, max_depth);
            // Maps are read while the target is still stopped.
            let resolver = walked.is_ok().then(|| {
                self.platform
                    .resolver_for(pid, executable.as_deref(), &self.config)
            });
            if let Err(e) = attachment.detach() {
                warn!("{e}");
            }
            (walked, resolver)
        };

        let mut walked = walked?;
        if walked.is_empty() {
            return Err(TraceError::CaptureFailed(format!(
                "no frames captured from process {pid}"
            )));
        }
        walked.truncate(max_depth);
        debug!("Captured {} frames from process {pid}", walked.len());

        let frames = match resolver {
            Some(resolver) => resolve_all(resolver.as_ref(), &walked),
            None => walked
                .addresses()
                .iter()
                .map(|&address| StackFrame::new(address))
                .collect(),
        };
        self.last_trace.clone_from(&frames);
        Ok(frames)
    }

    /// Stack of every thread of `pid`.
    ///
    /// All threads are stopped, walked and released before any symbol is
    /// looked up. Threads that exit or refuse the attach are skipped.
    pub fn capture_threads(&mut self, pid: i32) -> Result<Vec<ThreadTrace>> {
        if !self.platform.is_process_running(pid) {
            return Err(TraceError::ProcessNotRunning(pid));
        }
        if is_own_pid(pid) {
            return Err(TraceError::CaptureFailed(
                "the threads of the calling process cannot be stopped; \
                 capture the current thread instead"
                    .into(),
            ));
        }

        let max_depth = self.config.max_depth;
        let executable = self.executable(pid);
        let thread_ids = self.platform.threads(pid)?;
        debug!("Found {} threads in process {pid}", thread_ids.len());

        let mut attachments = Vec::with_capacity(thread_ids.len());
        for tid in thread_ids {
            match ProcessAttachment::attach(self.platform.port(), tid) {
                Ok(attachment) => attachments.push(attachment),
                Err(e) => warn!("Skipping thread {tid}: {e}"),
            }
        }

        let mut walked = Vec::with_capacity(attachments.len());
        for attachment in &attachments {
            let tid = attachment.pid();
            match self.platform.walk(attachment, max_depth) {
                Ok(stack) if !stack.is_empty() => walked.push((tid, stack)),
                Ok(_) => warn!("Thread {tid} produced no frames"),
                Err(e) => warn!("Skipping thread {tid}: {e}"),
            }
        }

        let resolver = (!walked.is_empty()).then(|| {
            self.platform
                .resolver_for(pid, executable.as_deref(), &self.config)
        });

        // Release in reverse so each signal mask restores the one it replaced.
        while let Some(mut attachment) = attachments.pop() {
            if let Err(e) = attachment.detach() {
                warn!("{e}");
            }
        }

        let Some(resolver) = resolver else {
            return Err(TraceError::CaptureFailed(format!(
                "no thread of process {pid} could be captured"
            )));
        };

        Ok(walked
            .into_iter()
            .map(|(tid, mut stack)| {
                stack.truncate(max_depth);
                ThreadTrace {
                    tid,
                    name: self.platform.thread_name(pid, tid),
                    frames: resolve_all(resolver.as_ref(), &stack),
                }
            })
            .collect())
    }

    fn executable(&self, pid: i32) -> Option<PathBuf> {
        self.platform
            .executable_path(pid)
            .map(|path| platform::resolve_symbolic_link(&path))
    }

    fn finish_local(&mut self, mut walked: WalkedStack) -> Result<Vec<StackFrame>> {
        if walked.is_empty() {
            return Err(TraceError::CaptureFailed(
                "the platform unwinder returned no frames".into(),
            ));
        }
        walked.truncate(self.config.max_depth);

        let config = &self.config;
        let resolver = self
            .local_resolver
            .get_or_insert_with(|| platform::local_resolver(config));
        let frames = resolve_all(resolver.as_ref(), &walked);
        self.last_trace.clone_from(&frames);
        Ok(frames)
    }
}

fn is_own_pid(pid: i32) -> bool {
    i64::from(pid) == i64::from(std::process::id())
}

fn resolve_all(resolver: &dyn SymbolResolver, walked: &WalkedStack) -> Vec<StackFrame> {
    walked
        .iter()
        .map(|(address, kind)| {
            let frame = resolver.resolve_as(address, kind);
            if let Err(e) = frame.check_resolved() {
                debug!("{e}");
            }
            frame
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::path::Path;
    use std::rc::Rc;

    use crate::attach::{Capability, DebugPort};
    use crate::frame::AddressKind;
    use crate::memory::{Registers, SnapshotMemory};
    use crate::walker::walk_frame_pointers;

    #[derive(Default)]
    struct CountingPort {
        calls: RefCell<Vec<(&'static str, i32)>>,
        refuse: HashSet<i32>,
    }

    impl CountingPort {
        fn count(&self, what: &str) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|(call, _)| *call == what)
                .count()
        }
    }

    impl DebugPort for CountingPort {
        fn attach(&self, pid: i32) -> Result<Capability> {
            self.calls.borrow_mut().push(("attach", pid));
            if self.refuse.contains(&pid) {
                return Err(TraceError::AttachFailed {
                    pid,
                    reason: "EPERM".into(),
                });
            }
            Ok(Capability::Full)
        }

        fn wait_for_stop(&self, _pid: i32) -> Result<()> {
            Ok(())
        }

        fn detach(&self, pid: i32) -> Result<()> {
            self.calls.borrow_mut().push(("detach", pid));
            Ok(())
        }
    }

    /// Names every address `fn_<address>` and records how it was asked.
    #[derive(Default)]
    struct Labels {
        kinds: Rc<RefCell<Vec<AddressKind>>>,
    }

    impl SymbolResolver for Labels {
        fn resolve_as(&self, address: u64, kind: AddressKind) -> StackFrame {
            self.kinds.borrow_mut().push(kind);
            StackFrame::new(address).with_function(format!("fn_{address}"))
        }
    }

    #[derive(Default)]
    struct FakePlatform {
        port: CountingPort,
        running: bool,
        fail_walk: bool,
        depth: u64,
        threads: Vec<i32>,
        kinds: Rc<RefCell<Vec<AddressKind>>>,
    }

    impl FakePlatform {
        fn live(depth: u64) -> Self {
            FakePlatform {
                running: true,
                depth,
                ..Default::default()
            }
        }

        /// `depth` frame records; return addresses are 1, 2, 3, ...
        fn memory(&self) -> SnapshotMemory {
            let base = 0x10_0000;
            let mut mem = SnapshotMemory::new(Registers {
                instruction_pointer: 1,
                frame_pointer: base,
            });
            for i in 0..self.depth {
                let fp = base + i * 0x20;
                let saved = if i + 1 == self.depth { 0 } else { fp + 0x20 };
                mem.push_frame(fp, saved, i + 2);
            }
            mem
        }
    }

    impl Platform for FakePlatform {
        type Port = CountingPort;

        fn port(&self) -> &CountingPort {
            &self.port
        }

        fn is_process_running(&self, _pid: i32) -> bool {
            self.running
        }

        fn executable_path(&self, _pid: i32) -> Option<PathBuf> {
            None
        }

        fn threads(&self, pid: i32) -> Result<Vec<i32>> {
            if self.threads.is_empty() {
                Ok(vec![pid])
            } else {
                Ok(self.threads.clone())
            }
        }

        fn walk(
            &self,
            attachment: &ProcessAttachment<'_, CountingPort>,
            max_depth: usize,
        ) -> Result<WalkedStack> {
            if self.fail_walk {
                return Err(TraceError::CaptureFailed("register read failed".into()));
            }
            attachment.require_full()?;
            walk_frame_pointers(&self.memory(), max_depth)
        }

        fn resolver_for(
            &self,
            _pid: i32,
            _exe: Option<&Path>,
            _config: &TraceConfig,
        ) -> Box<dyn SymbolResolver> {
            Box::new(Labels {
                kinds: Rc::clone(&self.kinds),
            })
        }
    }

    #[test]
    fn test_remote_capture_pairs_attach_and_detach() {
        let mut trace = StackTrace::with_platform(FakePlatform::live(5));
        let frames = trace.capture_process(910_001).unwrap();
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[0].function_name(), Some("fn_1"));
        assert_eq!(trace.platform.port.count("attach"), 1);
        assert_eq!(trace.platform.port.count("detach"), 1);
        assert_eq!(trace.last_trace(), frames.as_slice());
    }

    #[test]
    fn test_walk_failure_still_detaches() {
        let platform = FakePlatform {
            fail_walk: true,
            ..FakePlatform::live(5)
        };
        let mut trace = StackTrace::with_platform(platform);
        let err = trace.capture_process(910_002).unwrap_err();
        assert!(matches!(err, TraceError::CaptureFailed(_)));
        assert_eq!(trace.platform.port.count("attach"), 1);
        assert_eq!(trace.platform.port.count("detach"), 1);
        assert!(trace.last_trace().is_empty());
    }

    #[test]
    fn test_missing_process_never_attaches() {
        let mut trace = StackTrace::with_platform(FakePlatform::default());
        let err = trace.capture_process(910_003).unwrap_err();
        assert!(matches!(err, TraceError::ProcessNotRunning(910_003)));
        assert!(trace.platform.port.calls.borrow().is_empty());
    }

    #[test]
    fn test_refused_attach_is_reported() {
        let mut platform = FakePlatform::live(5);
        platform.port.refuse.insert(910_004);
        let mut trace = StackTrace::with_platform(platform);
        let err = trace.capture_process(910_004).unwrap_err();
        assert!(matches!(err, TraceError::AttachFailed { pid: 910_004, .. }));
        assert_eq!(trace.platform.port.count("detach"), 0);
    }

    #[test]
    fn test_truncates_to_innermost_frames() {
        let mut trace = StackTrace::with_platform(FakePlatform::live(10));
        trace.set_max_depth(3);
        let frames = trace.capture_process(910_005).unwrap();
        let addresses: Vec<u64> = frames.iter().map(StackFrame::address).collect();
        assert_eq!(addresses, vec![1, 2, 3]);
    }

    #[test]
    fn test_only_the_stopped_pc_is_looked_up_exactly() {
        let platform = FakePlatform::live(2);
        let kinds = Rc::clone(&platform.kinds);
        let mut trace = StackTrace::with_platform(platform);
        assert_eq!(trace.capture_process(910_008).unwrap().len(), 3);
        assert_eq!(
            *kinds.borrow(),
            vec![
                AddressKind::ProgramCounter,
                AddressKind::ReturnAddress,
                AddressKind::ReturnAddress,
            ]
        );
    }

    #[test]
    fn test_repeated_capture_is_identical() {
        let mut trace = StackTrace::with_platform(FakePlatform::live(4));
        let first = trace.capture_process(910_006).unwrap();
        let second = trace.capture_process(910_006).unwrap();
        assert_eq!(first, second);
        assert_eq!(trace.platform.port.count("attach"), 2);
        assert_eq!(trace.platform.port.count("detach"), 2);
    }

    #[test]
    fn test_depth_change_does_not_touch_returned_trace() {
        let mut trace = StackTrace::with_platform(FakePlatform::live(10));
        let frames = trace.capture_process(910_007).unwrap();
        trace.set_max_depth(2);
        assert_eq!(frames.len(), 11);
        assert_eq!(trace.capture_process(910_007).unwrap().len(), 2);
        trace.set_max_depth(0);
        assert_eq!(trace.max_depth(), 1);
    }

    #[test]
    fn test_thread_capture_skips_refused_threads() {
        let mut platform = FakePlatform::live(2);
        platform.threads = vec![910_010, 910_011, 910_012];
        platform.port.refuse.insert(910_011);
        let mut trace = StackTrace::with_platform(platform);

        let threads = trace.capture_threads(910_010).unwrap();
        let tids: Vec<i32> = threads.iter().map(|t| t.tid).collect();
        assert_eq!(tids, vec![910_010, 910_012]);
        assert!(threads
            .iter()
            .all(|t| t.frames.len() == 3 && t.name == "<unknown>"));
        assert_eq!(trace.platform.port.count("attach"), 3);
        assert_eq!(trace.platform.port.count("detach"), 2);
    }

    #[test]
    fn test_thread_capture_with_nothing_walked_fails() {
        let mut platform = FakePlatform {
            fail_walk: true,
            ..FakePlatform::live(2)
        };
        platform.threads = vec![910_020, 910_021];
        let mut trace = StackTrace::with_platform(platform);
        assert!(matches!(trace.capture_threads(910_020), Err(TraceError::CaptureFailed(_))));
        assert_eq!(trace.platform.port.count("detach"), 2);
    }

    #[test]
    fn test_current_thread_uses_local_resolver() {
        let labels = Labels::default();
        let kinds = Rc::clone(&labels.kinds);
        let mut trace = StackTrace::with_platform(FakePlatform::default())
            .with_local_resolver(Box::new(labels));
        let frames = trace.capture_current_thread().unwrap();
        assert!(!frames.is_empty());
        assert!(frames.len() <= trace.max_depth());
        assert!(frames.iter().all(|f| {
            f.function_name() == Some(format!("fn_{}", f.address()).as_str())
        }));
        let kinds = kinds.borrow();
        assert!(kinds.iter().all(|&k| k == AddressKind::ReturnAddress));
        assert!(trace.platform.port.calls.borrow().is_empty());
    }

    #[test]
    fn test_own_pid_is_walked_locally() {
        let platform = FakePlatform::live(0);
        let mut trace = StackTrace::with_platform(platform)
            .with_local_resolver(Box::new(Labels::default()));
        let frames = trace.capture_process(std::process::id() as i32).unwrap();
        assert!(!frames.is_empty());
        assert!(trace.platform.port.calls.borrow().is_empty());
    }
}
