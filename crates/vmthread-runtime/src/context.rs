//! Native execution contexts
//!
//! A `NativeContext` is the OS-level thread of control that runs one fiber.
//! Requesters reach it only through its mailbox: a lock-free FIFO of pending
//! safepoint actions that the owner drains at its polls. Nothing else about
//! a context is mutated from outside.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_queue::SegQueue;
use vmthread_core::{ktrace, ContextId, FiberId, ThreadId};

use crate::parking::Parker;
use crate::safepoint::{PendingAction, SafepointCounters, ARMED};

pub struct NativeContext {
    id: ContextId,
    thread: ThreadId,
    fiber: FiberId,
    /// OS thread identity, recorded when the context starts running
    native_id: OnceLock<u64>,
    parker: Arc<Parker>,
    mailbox: Mailbox,
    counters: Arc<SafepointCounters>,
}

impl NativeContext {
    pub(crate) fn new(thread: ThreadId, fiber: FiberId, counters: Arc<SafepointCounters>) -> Self {
        Self {
            id: ContextId::next(),
            thread,
            fiber,
            native_id: OnceLock::new(),
            parker: Arc::new(Parker::new()),
            mailbox: Mailbox::new(),
            counters,
        }
    }

    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Logical thread this context runs for
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    #[inline]
    pub fn fiber_id(&self) -> FiberId {
        self.fiber
    }

    /// OS thread identity (pthread id on unix), if the context has started
    pub fn native_id(&self) -> Option<u64> {
        self.native_id.get().copied()
    }

    #[inline]
    pub fn parker(&self) -> &Arc<Parker> {
        &self.parker
    }

    #[inline]
    pub fn is_exited(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Number of actions waiting in the mailbox
    #[inline]
    pub fn pending_actions(&self) -> usize {
        self.mailbox.len()
    }

    /// Record the calling OS thread as this context's native identity
    pub(crate) fn attach_native(&self) {
        let _ = self.native_id.set(current_native_id());
    }

    /// Queue an action and interrupt the owner
    ///
    /// If the context exits concurrently, whichever side observes the other
    /// drains the mailbox, so the action is either run or skipped, never lost.
    pub(crate) fn enqueue(&self, action: PendingAction) {
        self.mailbox.push(action, &self.counters);
        self.parker.interrupt();

        if self.is_exited() {
            self.mailbox.drain_skipped(&self.counters);
        }
    }

    /// Take the oldest pending action
    pub(crate) fn take_next(&self) -> Option<PendingAction> {
        self.mailbox.pop()
    }

    /// Mark the context terminated and drop everything still queued
    pub(crate) fn mark_exited(&self) {
        self.mailbox.close(&self.counters);
    }

    pub(crate) fn counters(&self) -> &Arc<SafepointCounters> {
        &self.counters
    }
}

/// FIFO of pending safepoint actions with a one-way close
///
/// Every queued action holds one count in `ARMED` until it is taken.
pub(crate) struct Mailbox {
    queue: SegQueue<PendingAction>,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn push(&self, action: PendingAction, counters: &SafepointCounters) {
        // Counted before the push so a concurrent pop never underflows
        self.pending.fetch_add(1, Ordering::AcqRel);
        ARMED.fetch_add(1, Ordering::Release);
        self.queue.push(action);
        counters.requested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pop(&self) -> Option<PendingAction> {
        let action = self.queue.pop()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        ARMED.fetch_sub(1, Ordering::Release);
        Some(action)
    }

    /// Refuse further work and skip what is queued
    pub(crate) fn close(&self, counters: &SafepointCounters) {
        self.closed.store(true, Ordering::SeqCst);
        self.drain_skipped(counters);
    }

    pub(crate) fn drain_skipped(&self, counters: &SafepointCounters) {
        while let Some(action) = self.pop() {
            ktrace!("skipping safepoint action queued after exit");
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            action.skip();
        }
    }
}

impl std::fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeContext")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .field("fiber", &self.fiber)
            .field("pending", &self.pending_actions())
            .field("exited", &self.is_exited())
            .finish()
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn current_native_id() -> u64 {
            nix::sys::pthread::pthread_self() as u64
        }
    } else {
        static NEXT_NATIVE_ID: std::sync::atomic::AtomicU64 =
            std::sync::atomic::AtomicU64::new(1);

        fn current_native_id() -> u64 {
            thread_local! {
                static ID: u64 = NEXT_NATIVE_ID.fetch_add(1, Ordering::Relaxed);
            }
            ID.with(|id| *id)
        }
    }
}
