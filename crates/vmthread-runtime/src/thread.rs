//! Logical thread records
//!
//! A `ThreadRecord` is the runtime's view of one guest thread. Status and
//! the result slots are written only by the thread's own context (or by a
//! safepoint action running on it); everything here is readable from any
//! thread.
//!
//! Asynchronous interrupts (kill, raise) are queued on the record rather than
//! on a native context, and are taken by whichever fiber is current when it
//! next polls. Control passing between fibers therefore never strands them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use vmthread_core::{
    GuestException, InterruptMode, Priority, ThreadId, ThreadStatus, Value,
};

use crate::blocking::BlockingStatus;
use crate::context::Mailbox;
use crate::fiber::FiberManager;
use crate::latch::Latch;
use crate::safepoint::{PendingAction, SafepointCounters};

/// Named thread group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadGroup {
    name: Arc<str>,
}

impl ThreadGroup {
    pub fn new(name: &str) -> Self {
        Self { name: Arc::from(name) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self::new("default")
    }
}

/// How a thread terminated
#[derive(Debug, Clone)]
pub enum ThreadOutcome {
    Value(Value),
    Exception(Arc<GuestException>),
}

/// Guest-visible status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReport {
    /// Still alive; "run", "sleep" or "aborting"
    Alive(ThreadStatus),
    /// Terminated normally
    Finished,
    /// Terminated with an exception (including a kill)
    FinishedWithException,
}

/// Options for a new thread
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    pub name: Option<String>,
    pub priority: Option<Priority>,
    pub abort_on_exception: Option<bool>,
    pub group: Option<ThreadGroup>,
}

impl ThreadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn abort_on_exception(mut self, enable: bool) -> Self {
        self.abort_on_exception = Some(enable);
        self
    }

    pub fn group(mut self, group: ThreadGroup) -> Self {
        self.group = Some(group);
        self
    }
}

pub struct ThreadRecord {
    id: ThreadId,
    is_main: bool,
    status: AtomicU8,
    interrupt_mode: AtomicU8,
    abort_on_exception: AtomicBool,
    outcome: OnceLock<ThreadOutcome>,
    wake_requested: AtomicBool,
    name: Mutex<Option<String>>,
    priority: AtomicU8,
    group: Mutex<ThreadGroup>,
    source_location: Option<String>,
    finished: Latch,
    fibers: FiberManager,
    interrupts: Mailbox,
    deferred: Mutex<VecDeque<PendingAction>>,
}

impl ThreadRecord {
    pub(crate) fn new(
        options: ThreadOptions,
        defaults: (Priority, bool, ThreadGroup),
        source_location: Option<String>,
        is_main: bool,
    ) -> Self {
        let id = ThreadId::next();
        let (default_priority, default_abort, default_group) = defaults;
        Self {
            id,
            is_main,
            status: AtomicU8::new(ThreadStatus::Run as u8),
            interrupt_mode: AtomicU8::new(InterruptMode::Immediate as u8),
            abort_on_exception: AtomicBool::new(options.abort_on_exception.unwrap_or(default_abort)),
            outcome: OnceLock::new(),
            wake_requested: AtomicBool::new(false),
            name: Mutex::new(options.name),
            priority: AtomicU8::new(options.priority.unwrap_or(default_priority) as u8),
            group: Mutex::new(options.group.unwrap_or(default_group)),
            source_location,
            finished: Latch::new(),
            fibers: FiberManager::new(id),
            interrupts: Mailbox::new(),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    // Status

    #[inline]
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from(self.status.load(Ordering::Acquire))
    }

    pub fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    /// Dead or sleeping
    pub fn is_stopped(&self) -> bool {
        self.status().is_stopped()
    }

    pub fn status_report(&self) -> StatusReport {
        match self.status() {
            ThreadStatus::Dead => match self.outcome.get() {
                Some(ThreadOutcome::Exception(_)) => StatusReport::FinishedWithException,
                _ => StatusReport::Finished,
            },
            alive => StatusReport::Alive(alive),
        }
    }

    /// Enter `Aborting` unless already dying
    ///
    /// Returns `false` if the thread was already aborting or dead.
    pub(crate) fn begin_abort(&self) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            match ThreadStatus::from(current) {
                ThreadStatus::Aborting | ThreadStatus::Dead => return false,
                _ => {}
            }
            match self.status.compare_exchange_weak(
                current,
                ThreadStatus::Aborting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn enter_blocking_status(&self) -> BlockingStatus<'_> {
        BlockingStatus::enter(&self.status)
    }

    /// Store the final outcome, mark `Dead` and release joiners
    ///
    /// # Panics
    ///
    /// If the thread was already finished.
    pub(crate) fn finish(&self, outcome: ThreadOutcome) {
        assert!(self.outcome.set(outcome).is_ok(), "{}: outcome stored twice", self.id);
        self.status.store(ThreadStatus::Dead as u8, Ordering::Release);
        assert!(self.finished.count_down(), "{}: finished latch fired twice", self.id);
    }

    pub fn finished_latch(&self) -> &Latch {
        &self.finished
    }

    // Result

    pub fn outcome(&self) -> Option<&ThreadOutcome> {
        self.outcome.get()
    }

    pub fn value(&self) -> Option<&Value> {
        match self.outcome.get() {
            Some(ThreadOutcome::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn exception(&self) -> Option<&Arc<GuestException>> {
        match self.outcome.get() {
            Some(ThreadOutcome::Exception(e)) => Some(e),
            _ => None,
        }
    }

    // Interrupt mode

    #[inline]
    pub fn interrupt_mode(&self) -> InterruptMode {
        InterruptMode::from(self.interrupt_mode.load(Ordering::Acquire))
    }

    /// Switch to `mode` until the returned guard drops
    ///
    /// Only the thread itself may call this.
    pub(crate) fn enter_interrupt_mode(&self, mode: InterruptMode) -> InterruptScope<'_> {
        let previous = self.interrupt_mode.swap(mode as u8, Ordering::AcqRel);
        InterruptScope {
            mode: &self.interrupt_mode,
            previous,
        }
    }

    // Thread-level interrupts

    pub(crate) fn interrupts(&self) -> &Mailbox {
        &self.interrupts
    }

    pub(crate) fn defer_interrupt(&self, action: PendingAction) {
        self.deferred.lock().push_back(action);
    }

    pub(crate) fn pop_deferred_interrupt(&self) -> Option<PendingAction> {
        self.deferred.lock().pop_front()
    }

    /// Interrupts queued or held back by the interrupt mode
    pub fn pending_interrupts(&self) -> usize {
        self.interrupts.len() + self.deferred.lock().len()
    }

    /// Skip everything pending; later requests are skipped on arrival
    pub(crate) fn close_interrupts(&self, counters: &SafepointCounters) {
        self.interrupts.close(counters);
        let deferred: Vec<_> = self.deferred.lock().drain(..).collect();
        for action in deferred {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            action.skip();
        }
    }

    // Wakeup

    pub(crate) fn request_wake(&self) {
        self.wake_requested.store(true, Ordering::SeqCst);
    }

    pub fn wake_requested(&self) -> bool {
        self.wake_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn take_wake(&self) -> bool {
        self.wake_requested.swap(false, Ordering::SeqCst)
    }

    // Administrative metadata

    pub fn abort_on_exception(&self) -> bool {
        self.abort_on_exception.load(Ordering::Relaxed)
    }

    pub fn set_abort_on_exception(&self, enable: bool) {
        self.abort_on_exception.store(enable, Ordering::Relaxed);
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.lock() = name;
    }

    pub fn priority(&self) -> Priority {
        Priority::from(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    pub fn group(&self) -> ThreadGroup {
        self.group.lock().clone()
    }

    pub fn set_group(&self, group: ThreadGroup) {
        *self.group.lock() = group;
    }

    /// `file:line` of the `create` call
    pub fn source_location(&self) -> Option<&str> {
        self.source_location.as_deref()
    }

    pub fn fibers(&self) -> &FiberManager {
        &self.fibers
    }

    /// Root fiber's native context has started
    pub fn is_initialized(&self) -> bool {
        self.fibers.root().initialized_latch().is_set()
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("name", &*self.name.lock())
            .field("status", &self.status())
            .field("interrupt_mode", &self.interrupt_mode())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.name.lock() {
            Some(name) => write!(f, "#<Thread:{}@{} {}>", self.id, name, self.status()),
            None => write!(f, "#<Thread:{} {}>", self.id, self.status()),
        }
    }
}

/// Restores the previous interrupt mode on drop
#[must_use = "the mode is restored when the scope is dropped"]
pub struct InterruptScope<'a> {
    mode: &'a AtomicU8,
    previous: u8,
}

impl InterruptScope<'_> {
    pub fn previous(&self) -> InterruptMode {
        InterruptMode::from(self.previous)
    }
}

impl Drop for InterruptScope<'_> {
    fn drop(&mut self) {
        self.mode.store(self.previous, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmthread_core::value;

    fn record() -> ThreadRecord {
        ThreadRecord::new(
            ThreadOptions::new().name("worker"),
            (Priority::Normal, false, ThreadGroup::default()),
            None,
            false,
        )
    }

    #[test]
    fn test_initial_state() {
        let t = record();
        assert_eq!(t.status(), ThreadStatus::Run);
        assert_eq!(t.interrupt_mode(), InterruptMode::Immediate);
        assert_eq!(t.name().as_deref(), Some("worker"));
        assert!(t.outcome().is_none());
        assert!(!t.finished_latch().is_set());
        assert_eq!(t.status_report(), StatusReport::Alive(ThreadStatus::Run));
    }

    #[test]
    fn test_finish_with_value() {
        let t = record();
        t.finish(ThreadOutcome::Value(value(5u32)));
        assert_eq!(t.status(), ThreadStatus::Dead);
        assert!(t.finished_latch().is_set());
        assert_eq!(t.value().unwrap().downcast_ref::<u32>(), Some(&5));
        assert!(t.exception().is_none());
        assert_eq!(t.status_report(), StatusReport::Finished);
    }

    #[test]
    fn test_finish_with_exception() {
        let t = record();
        t.finish(ThreadOutcome::Exception(Arc::new(GuestException::new("RuntimeError", "x"))));
        assert!(t.value().is_none());
        assert_eq!(t.status_report(), StatusReport::FinishedWithException);
    }

    #[test]
    #[should_panic(expected = "outcome stored twice")]
    fn test_double_finish_panics() {
        let t = record();
        t.finish(ThreadOutcome::Value(value(())));
        t.finish(ThreadOutcome::Value(value(())));
    }

    #[test]
    fn test_interrupt_scope_nesting() {
        let t = record();
        {
            let outer = t.enter_interrupt_mode(InterruptMode::OnBlocking);
            assert_eq!(outer.previous(), InterruptMode::Immediate);
            {
                let _inner = t.enter_interrupt_mode(InterruptMode::Never);
                assert_eq!(t.interrupt_mode(), InterruptMode::Never);
            }
            assert_eq!(t.interrupt_mode(), InterruptMode::OnBlocking);
        }
        assert_eq!(t.interrupt_mode(), InterruptMode::Immediate);
    }

    #[test]
    fn test_begin_abort_once() {
        let t = record();
        assert!(t.begin_abort());
        assert!(!t.begin_abort());
        assert_eq!(t.status_report(), StatusReport::Alive(ThreadStatus::Aborting));
    }

    #[test]
    fn test_wake_flag() {
        let t = record();
        t.request_wake();
        t.request_wake();
        assert!(t.take_wake());
        assert!(!t.take_wake());
    }

    #[test]
    fn test_display() {
        let t = record();
        assert!(t.to_string().contains("@worker run"));
        t.set_priority(Priority::High);
        assert_eq!(t.priority(), Priority::High);
    }

    #[test]
    fn test_close_interrupts_skips_pending() {
        use crate::safepoint::{ActionKind, Ticket};
        use vmthread_core::ContextId;

        let t = record();
        let counters = SafepointCounters::default();
        let queued = Arc::new(Ticket::new());
        let held = Arc::new(Ticket::new());
        let action = |ticket: &Arc<Ticket>| {
            PendingAction::new(
                ActionKind::Interrupt,
                ContextId::NONE,
                Box::new(|_| Ok(())),
                Some(Arc::clone(ticket)),
            )
        };

        t.interrupts().push(action(&queued), &counters);
        t.defer_interrupt(action(&held));
        assert_eq!(t.pending_interrupts(), 2);

        t.close_interrupts(&counters);
        assert_eq!(t.pending_interrupts(), 0);
        assert!(t.interrupts().is_closed());
        assert!(!queued.ran() && !held.ran());
        assert_eq!(counters.skipped.load(Ordering::Relaxed), 2);
    }
}
