//! Remaining-count bookkeeping shared by the fan-out handlers

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::Callback;

#[derive(Default)]
struct Slot {
    /// First error reported by any branch: (code, message)
    error: Option<(u16, String)>,
    /// Armed by `reset`, cleared by `finished`
    running: bool,
    /// Connections already counted in this invocation
    finished: HashSet<u64>,
    terminate: Option<Callback>,
}

/// Outstanding-branch counter of one fan-out invocation.
///
/// Exactly one caller observes the transition to zero; that caller finalizes the invocation
/// and then calls `finished`, which releases any pending terminate callback.
#[derive(Default)]
pub struct NodeCounter {
    remaining: AtomicUsize,
    failed: AtomicBool,
    slot: Mutex<Slot>,
}

impl NodeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for a new invocation with `count` branches
    pub fn reset(&self, count: usize) {
        let mut slot = self.slot.lock();
        slot.error = None;
        slot.running = count > 0;
        slot.finished.clear();
        self.failed.store(false, Ordering::Release);
        self.remaining.store(count, Ordering::Release);
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().running
    }

    /// Count one branch as finished; true for the single caller that brings the count to zero
    pub fn decrement(&self) -> bool {
        self.decrement_by(1)
    }

    /// Count `n` branches as finished at once
    pub fn decrement_by(&self, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            let next = current.saturating_sub(n);
            match self.remaining.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next == 0,
                Err(actual) => current = actual,
            }
        }
    }

    /// Count the branch running on connection `id`; repeated reports for it are ignored
    pub fn decrement_once(&self, id: u64) -> bool {
        if !self.slot.lock().finished.insert(id) {
            return false;
        }
        self.decrement()
    }

    /// Mark the invocation failed. The first error recorded is the one surfaced.
    pub fn set_failed(&self, code: u16, message: impl Into<String>) {
        let mut slot = self.slot.lock();
        if slot.error.is_none() {
            slot.error = Some((code, message.into()));
        }
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn first_error(&self) -> Option<(u16, String)> {
        self.slot.lock().error.clone()
    }

    /// The invocation has been finalized; runs a terminate callback parked meanwhile
    pub fn finished(&self) {
        let callback = {
            let mut slot = self.slot.lock();
            slot.running = false;
            slot.terminate.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Run `callback` now if no invocation is in flight, otherwise after `finished`
    pub fn terminate(&self, callback: Callback) {
        {
            let mut slot = self.slot.lock();
            if slot.running {
                slot.terminate = Some(callback);
                return;
            }
        }
        callback();
    }
}

impl std::fmt::Debug for NodeCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCounter")
            .field("remaining", &self.remaining())
            .field("failed", &self.is_failed())
            .field("running", &self.is_running())
            .finish()
    }
}
