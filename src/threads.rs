//! Threading collaborator. The collector itself is single-threaded; it
//! relies on the host to stop the world, expose each thread's register and
//! stack windows for conservative scanning, and relay the final mark
//! verdicts before the world restarts.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Verdict handed to suspended threads for an address they care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsMarked {
    Yes,
    No,
    /// The address does not map to collector-owned memory.
    Unknown,
}

/// Host-side threading hooks, called in this order during a collection:
/// `suspend_all`, then `scan_all` (unless stack scanning is suppressed),
/// then `process_marks`, then `resume_all`. Implementations must flush
/// register state into the reported stack windows before `suspend_all`
/// returns.
pub trait ThreadContext: Send + Sync {
    /// Stop every thread but the calling one.
    fn suspend_all(&self) {}

    /// Restart the threads stopped by `suspend_all`.
    fn resume_all(&self) {}

    /// Invoke `scan` with each suspended thread's register+stack window.
    fn scan_all(&self, scan: &mut dyn FnMut(*const u8, *const u8));

    /// Let each thread inspect the final mark state while the world is
    /// still stopped.
    fn process_marks(&self, _is_marked: &mut dyn FnMut(*const u8) -> IsMarked) {}
}

/// Collaborator for single-threaded hosts. There is nothing to suspend;
/// `scan_all` reports the calling thread's stack between the recorded
/// bottom and the current stack pointer. With no bottom recorded, stack
/// scanning is skipped entirely and only roots and ranges pin memory.
pub struct SingleThread {
    stack_bottom: AtomicUsize,
}

impl SingleThread {
    pub fn new() -> SingleThread {
        SingleThread {
            stack_bottom: AtomicUsize::new(0),
        }
    }

    /// Record the deepest stack address conservative scans should reach,
    /// typically the address of a local early in `main`.
    pub fn set_stack_bottom(&self, p: *const u8) {
        self.stack_bottom.store(p as usize, Ordering::Relaxed);
    }

    #[inline(never)]
    fn approx_stack_pointer() -> usize {
        let marker = 0u8;
        &marker as *const u8 as usize
    }
}

impl Default for SingleThread {
    fn default() -> Self {
        SingleThread::new()
    }
}

impl ThreadContext for SingleThread {
    fn scan_all(&self, scan: &mut dyn FnMut(*const u8, *const u8)) {
        let bottom = self.stack_bottom.load(Ordering::Relaxed);
        if bottom == 0 {
            return;
        }
        let top = Self::approx_stack_pointer();
        // stacks grow downward on every supported target
        if top < bottom {
            scan(top as *const u8, bottom as *const u8);
        }
    }
}
