//! Blocking actions and the retry loop
//!
//! A blocking action wraps one interruptible wait. When the safepoint
//! coordinator interrupts the wait, the action reports `Interrupted`;
//! `run_until_result` then runs whatever is pending for the context and
//! calls the action again from scratch.
//!
//! # Example
//!
//! ```rust,ignore
//! let joined = run_until_result(|parker: &Arc<Parker>| {
//!     match latch.await_on(parker, deadline) {
//!         WaitOutcome::Ready => Ok(true),
//!         WaitOutcome::TimedOut => Ok(false),
//!         WaitOutcome::Interrupted => Err(Interrupted),
//!     }
//! })?;
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use vmthread_core::{GuestResult, ThreadStatus, Unwind};

use crate::parking::Parker;
use crate::safepoint::poll_current;
use crate::tls;

/// A wait was cut short by a coordinator interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// A retryable wait
///
/// `block` must be safe to call again after returning `Interrupted`.
pub trait BlockingAction<T> {
    fn block(&mut self, parker: &Arc<Parker>) -> Result<T, Interrupted>;
}

impl<T, F> BlockingAction<T> for F
where
    F: FnMut(&Arc<Parker>) -> Result<T, Interrupted>,
{
    #[inline]
    fn block(&mut self, parker: &Arc<Parker>) -> Result<T, Interrupted> {
        self(parker)
    }
}

/// Run `action` until it produces a result
pub fn run_until_result<T, A>(action: A) -> GuestResult<T>
where
    A: BlockingAction<T>,
{
    run_until_result_with(action, || {})
}

/// Run `action` until it produces a result, calling `on_interrupt` after
/// every interruption and before the retry
///
/// Entering the loop counts as entering a blocking region: interrupts
/// deferred under `OnBlocking` are delivered first. Any unwind produced by a
/// safepoint action propagates out immediately, as does a kill that was
/// applied earlier and swallowed by guest code.
pub fn run_until_result_with<T, A, U>(mut action: A, mut on_interrupt: U) -> GuestResult<T>
where
    A: BlockingAction<T>,
    U: FnMut(),
{
    let Some(current) = tls::current() else {
        // Host thread: nothing can queue work for it, only retry
        let parker = Arc::new(Parker::new());
        loop {
            match action.block(&parker) {
                Ok(v) => return Ok(v),
                Err(Interrupted) => on_interrupt(),
            }
        }
    };

    poll_current(&current, true)?;
    if current.termination_requested() {
        return Err(Unwind::Kill);
    }

    loop {
        let result = {
            let _sleeping = current.thread.as_ref().map(|t| t.enter_blocking_status());
            action.block(current.context.parker())
        };

        match result {
            Ok(v) => return Ok(v),
            Err(Interrupted) => {
                poll_current(&current, true)?;
                if current.termination_requested() {
                    return Err(Unwind::Kill);
                }
                on_interrupt();
            }
        }
    }
}

/// Restores `Run` when a blocking wait ends
pub(crate) struct BlockingStatus<'a> {
    status: &'a AtomicU8,
    changed: bool,
}

impl<'a> BlockingStatus<'a> {
    pub(crate) fn enter(status: &'a AtomicU8) -> Self {
        let changed = status
            .compare_exchange(
                ThreadStatus::Run as u8,
                ThreadStatus::Sleep as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        Self { status, changed }
    }
}

impl Drop for BlockingStatus<'_> {
    fn drop(&mut self) {
        if self.changed {
            let _ = self.status.compare_exchange(
                ThreadStatus::Sleep as u8,
                ThreadStatus::Run as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}
