//! Thread-local storage for the running context
//!
//! Each OS thread that runs guest code has one `Current` installed: its
//! native context, the logical thread and fiber it runs for, and the
//! owner-only safepoint state (deferred interrupts). Requesters never touch
//! this; they only see the context's mailbox.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use vmthread_core::{kprint, InterruptMode, ThreadStatus};

use crate::context::NativeContext;
use crate::coordinator::ThreadCoordinator;
use crate::fiber::FiberRecord;
use crate::safepoint::PendingAction;
use crate::thread::ThreadRecord;

pub(crate) struct Current {
    pub(crate) context: Arc<NativeContext>,
    pub(crate) thread: Option<Arc<ThreadRecord>>,
    pub(crate) fiber: Option<Arc<FiberRecord>>,
    pub(crate) coordinator: Option<Arc<ThreadCoordinator>>,
    deferred: RefCell<VecDeque<PendingAction>>,
}

impl Current {
    pub(crate) fn new(
        context: Arc<NativeContext>,
        thread: Option<Arc<ThreadRecord>>,
        fiber: Option<Arc<FiberRecord>>,
        coordinator: Option<Arc<ThreadCoordinator>>,
    ) -> Self {
        Self {
            context,
            thread,
            fiber,
            coordinator,
            deferred: RefCell::new(VecDeque::new()),
        }
    }

    pub(crate) fn interrupt_mode(&self) -> InterruptMode {
        self.thread
            .as_ref()
            .map(|t| t.interrupt_mode())
            .unwrap_or_default()
    }

    /// This context's thread, if this context runs its current fiber
    pub(crate) fn active_thread(&self) -> Option<&Arc<ThreadRecord>> {
        let thread = self.thread.as_ref()?;
        let fiber = self.fiber.as_ref()?;
        Arc::ptr_eq(&thread.fibers().current(), fiber).then_some(thread)
    }

    /// A kill has been applied to this context's thread
    pub(crate) fn termination_requested(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|t| t.status() == ThreadStatus::Aborting)
    }

    pub(crate) fn defer(&self, action: PendingAction) {
        self.deferred.borrow_mut().push_back(action);
    }

    pub(crate) fn pop_deferred(&self) -> Option<PendingAction> {
        self.deferred.borrow_mut().pop_front()
    }
}

impl Drop for Current {
    fn drop(&mut self) {
        // Deferred interrupts die with the context
        self.deferred.get_mut().clear();
        self.context.mark_exited();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Current>>> = const { RefCell::new(None) };
}

/// Install `current` for this OS thread
pub(crate) fn install(current: Current) {
    if let Some(thread) = &current.thread {
        kprint::set_thread_tag(thread.id().as_u64());
    }
    current.context.attach_native();
    CURRENT.with(|slot| *slot.borrow_mut() = Some(Rc::new(current)));
}

/// Remove and return this OS thread's `Current`
pub(crate) fn uninstall() -> Option<Rc<Current>> {
    kprint::clear_thread_tag();
    CURRENT
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}

#[inline]
pub(crate) fn current() -> Option<Rc<Current>> {
    CURRENT.try_with(|slot| slot.borrow().clone()).ok().flatten()
}

/// Check if this OS thread runs a runtime context
#[inline]
pub fn is_attached() -> bool {
    CURRENT
        .try_with(|slot| slot.borrow().is_some())
        .unwrap_or(false)
}

/// Native context of the calling OS thread
pub fn current_context() -> Option<Arc<NativeContext>> {
    current().map(|c| Arc::clone(&c.context))
}

/// Logical thread of the calling OS thread
pub fn current_thread() -> Option<Arc<ThreadRecord>> {
    current().and_then(|c| c.thread.clone())
}

/// Fiber running on the calling OS thread
pub fn current_fiber() -> Option<Arc<FiberRecord>> {
    current().and_then(|c| c.fiber.clone())
}

/// Coordinator that owns the calling OS thread
pub fn current_coordinator() -> Option<Arc<ThreadCoordinator>> {
    current().and_then(|c| c.coordinator.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safepoint::SafepointCounters;
    use vmthread_core::{FiberId, ThreadId};

    #[test]
    fn test_install_uninstall() {
        std::thread::spawn(|| {
            assert!(!is_attached());
            let ctx = Arc::new(NativeContext::new(
                ThreadId::next(),
                FiberId::next(),
                Arc::new(SafepointCounters::default()),
            ));
            install(Current::new(Arc::clone(&ctx), None, None, None));

            assert!(is_attached());
            assert!(ctx.native_id().is_some());
            assert!(Arc::ptr_eq(&current_context().unwrap(), &ctx));
            assert!(current_thread().is_none());

            drop(uninstall());
            assert!(!is_attached());
            assert!(ctx.is_exited());
        })
        .join()
        .unwrap();
    }
}
