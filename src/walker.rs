//! Stack walking: turns a thread context into an innermost-first list of
//! code addresses.

use crate::error::Result;
use crate::frame::AddressKind;
use crate::memory::{RemoteMemory, WORD_SIZE};

/// Addresses produced by a walk, innermost first.
///
/// The first `program_counters` entries are where a thread is executing right
/// now; every later entry is a return address pushed by a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkedStack {
    addresses: Vec<u64>,
    program_counters: usize,
}

impl WalkedStack {
    /// Addresses that all came from saved return slots.
    #[must_use]
    pub fn return_addresses(addresses: Vec<u64>) -> Self {
        WalkedStack {
            addresses,
            program_counters: 0,
        }
    }

    /// Addresses that are all live program counters.
    #[must_use]
    pub fn program_counters(addresses: Vec<u64>) -> Self {
        let program_counters = addresses.len();
        WalkedStack {
            addresses,
            program_counters,
        }
    }

    #[must_use]
    pub fn addresses(&self) -> &[u64] {
        &self.addresses
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// How the address at `index` must be looked up.
    #[must_use]
    pub fn kind(&self, index: usize) -> AddressKind {
        if index < self.program_counters {
            AddressKind::ProgramCounter
        } else {
            AddressKind::ReturnAddress
        }
    }

    /// Keep the innermost `len` addresses.
    pub fn truncate(&mut self, len: usize) {
        self.addresses.truncate(len);
        self.program_counters = self.program_counters.min(len);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, AddressKind)> + '_ {
        self.addresses
            .iter()
            .enumerate()
            .map(|(index, &address)| (address, self.kind(index)))
    }
}

/// Frames recorded while looking for [`walk_local`]'s own frame. Only used if
/// the unwinder cannot report symbol addresses.
const LOCAL_SEARCH_SLACK: usize = 64;

/// Walk the calling thread with the platform unwinder.
///
/// Frames belonging to the unwinder and to this function are dropped, as are
/// `skip_callers` further frames, so the first address returned belongs to
/// the caller's caller when `skip_callers == 1`. Hitting the true bottom of
/// the stack before `max_depth` just yields fewer frames. Every address
/// returned is a return address.
#[inline(never)]
pub fn walk_local(max_depth: usize, skip_callers: usize) -> WalkedStack {
    if max_depth == 0 {
        return WalkedStack::default();
    }

    let marker = walk_local as *const () as usize;
    let mut found_marker = false;
    let mut skipped = 0;
    let mut unfiltered = Vec::new();
    let mut frames = Vec::with_capacity(max_depth);

    backtrace::trace(|frame| {
        let ip = frame.ip() as u64;
        if ip == 0 {
            return false;
        }
        if !found_marker {
            unfiltered.push(ip);
            if frame.symbol_address() as usize == marker {
                found_marker = true;
            }
            return unfiltered.len() < max_depth + LOCAL_SEARCH_SLACK;
        }
        if skipped < skip_callers {
            skipped += 1;
            return true;
        }
        frames.push(ip);
        frames.len() < max_depth
    });

    if found_marker {
        WalkedStack::return_addresses(frames)
    } else {
        unfiltered.truncate(max_depth);
        WalkedStack::return_addresses(unfiltered)
    }
}

/// Walk a stopped thread by chasing saved frame pointers through its memory.
///
/// Frame 0 is the current program counter. Each frame record holds the
/// caller's frame pointer at `[fp]` and the return address at `[fp + 8]`; this
/// layout holds for both x86_64 and AArch64 when frame pointers are kept.
/// Code compiled without frame pointers yields a truncated or wrong chain.
///
/// The walk ends at `max_depth`, at a null frame pointer or return address, at
/// an unreadable word, or when the saved frame pointer does not grow (stacks
/// grow down, so a caller's frame always sits above its callee's). Only a
/// failure to read the registers is an error.
pub fn walk_frame_pointers<M: RemoteMemory + ?Sized>(
    memory: &M,
    max_depth: usize,
) -> Result<WalkedStack> {
    let registers = memory.registers()?;
    let mut stack_trace = vec![registers.instruction_pointer];
    let mut fp = registers.frame_pointer;

    while stack_trace.len() < max_depth {
        if fp == 0 {
            break;
        }
        let Some(return_slot) = fp.checked_add(WORD_SIZE) else {
            break;
        };
        let Ok(return_addr) = memory.read_word(return_slot) else {
            break;
        };
        if return_addr == 0 {
            break;
        }
        stack_trace.push(return_addr);

        match memory.read_word(fp) {
            Ok(prev_fp) if prev_fp > fp => fp = prev_fp,
            _ => break,
        }
    }

    let mut walked = WalkedStack::return_addresses(stack_trace);
    walked.program_counters = 1;
    walked.truncate(max_depth);
    Ok(walked)
}

/// Per-thread register state of an attached task.
pub trait ThreadStates {
    /// Current program counter of every thread that could be read.
    fn program_counters(&self) -> Result<Vec<u64>>;
}

/// One frame per thread: the current program counter of each, capped at
/// `max_depth`. This is a breadth view of the task, not a call chain.
pub fn walk_threads<T: ThreadStates + ?Sized>(
    task: &T,
    max_depth: usize,
) -> Result<WalkedStack> {
    let mut walked = WalkedStack::program_counters(task.program_counters()?);
    walked.truncate(max_depth);
    Ok(walked)
}
