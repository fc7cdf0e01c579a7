//! Single-fire latch
//!
//! Unset, then set exactly once, then permanently observable as set. Waiters
//! park on their own context's `Parker`, which keeps every latch wait
//! interruptible by the safepoint coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::parking::{Parker, WaitOutcome};

pub struct Latch {
    set: AtomicBool,
    waiters: Mutex<Vec<Arc<Parker>>>,
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Set the latch and wake every registered waiter
    ///
    /// Returns `false` if the latch was already set.
    pub fn count_down(&self) -> bool {
        if self.set.swap(true, Ordering::SeqCst) {
            return false;
        }
        for waiter in self.waiters.lock().iter() {
            waiter.unpark();
        }
        true
    }

    /// Wait for the latch on `parker`'s context
    ///
    /// Returns early with `Interrupted` when the context is interrupted, so
    /// the caller can service safepoints and retry.
    pub fn await_on(&self, parker: &Arc<Parker>, deadline: Option<Instant>) -> WaitOutcome {
        if self.is_set() {
            return WaitOutcome::Ready;
        }

        self.waiters.lock().push(Arc::clone(parker));
        let outcome = parker.wait_until(deadline, || self.is_set());
        self.waiters.lock().retain(|w| !Arc::ptr_eq(w, parker));
        outcome
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("set", &self.is_set()).finish()
    }
}
