//! Safepoint coordination
//!
//! Runs a requester's action *on* a target native context. The requester
//! queues the action in the target's mailbox and interrupts it; the target
//! runs the action at its next poll (or as soon as a blocking wait notices
//! the interrupt).
//!
//! ```text
//!  requester                         target
//!  ---------                         ------
//!  enqueue(action) --mailbox-->      ... guest code ...
//!  interrupt(parker)                 poll(): ARMED != 0
//!  wait(ticket) <----latch---        take_next() -> run(action)
//! ```
//!
//! Actions for one target run in request order. A target that has exited
//! never runs an action: anything still queued is completed as skipped.
//! Interrupts aimed at a whole thread (`interrupt_thread`) queue on its
//! `ThreadRecord` instead and run on whichever fiber is current.
//!
//! # Polling
//!
//! `poll()` is cheap when nothing is pending anywhere: one atomic load of the
//! process-wide `ARMED` count. Guest loops call it (or `safepoint!`) at back
//! edges.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use vmthread_core::{kdebug, should_deliver, ContextId, FiberId, GuestResult, ThreadId};

use crate::blocking::{run_until_result, Interrupted};
use crate::context::NativeContext;
use crate::latch::Latch;
use crate::parking::{Parker, WaitOutcome};
use crate::thread::ThreadRecord;
use crate::tls::{self, Current};

/// Actions queued anywhere in the process and not yet taken
pub(crate) static ARMED: AtomicUsize = AtomicUsize::new(0);

/// How a queued action interacts with the target's interrupt mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Runtime bookkeeping; runs at the next poll regardless of mode
    System,
    /// Asynchronous interrupt (raise, kill); gated by the interrupt mode
    Interrupt,
}

/// The context an action runs on, as seen by the action
pub struct PausedContext<'a> {
    pub context: &'a Arc<NativeContext>,
    pub thread: Option<&'a Arc<ThreadRecord>>,
    /// Context that requested the action (`ContextId::NONE` for host threads)
    pub requester: ContextId,
}

pub type SafepointAction = Box<dyn FnOnce(&PausedContext<'_>) -> GuestResult<()> + Send>;

/// Completion signal for a blocking request
pub(crate) struct Ticket {
    done: Latch,
    ran: AtomicBool,
}

impl Ticket {
    pub(crate) fn new() -> Self {
        Self {
            done: Latch::new(),
            ran: AtomicBool::new(false),
        }
    }

    fn finish(&self, ran: bool) {
        self.ran.store(ran, Ordering::SeqCst);
        self.done.count_down();
    }

    #[cfg(test)]
    pub(crate) fn is_done(&self) -> bool {
        self.done.is_set()
    }

    pub(crate) fn ran(&self) -> bool {
        self.ran.load(Ordering::SeqCst)
    }
}

pub(crate) struct PendingAction {
    kind: ActionKind,
    requester: ContextId,
    action: Option<SafepointAction>,
    ticket: Option<Arc<Ticket>>,
}

impl PendingAction {
    pub(crate) fn new(
        kind: ActionKind,
        requester: ContextId,
        action: SafepointAction,
        ticket: Option<Arc<Ticket>>,
    ) -> Self {
        Self {
            kind,
            requester,
            action: Some(action),
            ticket,
        }
    }

    fn run(mut self, current: &Current) -> GuestResult<()> {
        let paused = PausedContext {
            context: &current.context,
            thread: current.thread.as_ref(),
            requester: self.requester,
        };
        let result = match self.action.take() {
            Some(action) => action(&paused),
            None => Ok(()),
        };
        current.context.counters().executed.fetch_add(1, Ordering::Relaxed);
        if let Some(ticket) = self.ticket.take() {
            ticket.finish(true);
        }
        result
    }

    /// Complete without running
    pub(crate) fn skip(mut self) {
        self.action = None;
        if let Some(ticket) = self.ticket.take() {
            ticket.finish(false);
        }
    }
}

impl Drop for PendingAction {
    fn drop(&mut self) {
        // Never leave a requester waiting on an action that was dropped
        if let Some(ticket) = self.ticket.take() {
            ticket.finish(false);
        }
    }
}

/// Per-runtime safepoint counters
#[derive(Debug, Default)]
pub struct SafepointCounters {
    pub(crate) requested: AtomicU64,
    pub(crate) executed: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) deferred: AtomicU64,
    pub(crate) slow_polls: AtomicU64,
}

/// Snapshot of `SafepointCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafepointStats {
    pub requested: u64,
    pub executed: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub slow_polls: u64,
}

/// The pause/resume engine
pub struct SafepointCoordinator {
    counters: Arc<SafepointCounters>,
}

impl SafepointCoordinator {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(SafepointCounters::default()),
        }
    }

    /// Create a native context whose actions are counted here
    pub fn new_context(&self, thread: ThreadId, fiber: FiberId) -> Arc<NativeContext> {
        Arc::new(NativeContext::new(thread, fiber, Arc::clone(&self.counters)))
    }

    /// Run `action` on `target` and wait until it has run or been skipped
    ///
    /// Returns `Ok(true)` if the action ran and `Ok(false)` if the target had
    /// already exited. Targeting the caller's own context runs the action
    /// inline. While waiting, the caller keeps servicing its own safepoints,
    /// so two contexts pausing each other cannot deadlock.
    pub fn pause_and_execute<F>(&self, target: &Arc<NativeContext>, action: F) -> GuestResult<bool>
    where
        F: FnOnce(&PausedContext<'_>) -> GuestResult<()> + Send + 'static,
    {
        let current = tls::current();
        if let Some(current) = current.as_ref().filter(|c| Arc::ptr_eq(&c.context, target)) {
            PendingAction::new(ActionKind::System, current.context.id(), Box::new(action), None)
                .run(current)?;
            return Ok(true);
        }

        if target.is_exited() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let requester = current.as_ref().map_or(ContextId::NONE, |c| c.context.id());
        let ticket = Arc::new(Ticket::new());
        target.enqueue(PendingAction::new(
            ActionKind::System,
            requester,
            Box::new(action),
            Some(Arc::clone(&ticket)),
        ));
        drop(current);

        run_until_result(|parker: &Arc<Parker>| match ticket.done.await_on(parker, None) {
            WaitOutcome::Ready => Ok(()),
            _ => Err(Interrupted),
        })?;
        Ok(ticket.ran())
    }

    /// Queue `action` on `target` without waiting
    ///
    /// A dead target drops the action. Targeting the caller's own context
    /// runs the action inline and returns its result.
    pub fn pause_and_execute_later<F>(
        &self,
        target: &Arc<NativeContext>,
        kind: ActionKind,
        action: F,
    ) -> GuestResult<()>
    where
        F: FnOnce(&PausedContext<'_>) -> GuestResult<()> + Send + 'static,
    {
        let current = tls::current();
        if let Some(current) = current.as_ref().filter(|c| Arc::ptr_eq(&c.context, target)) {
            return PendingAction::new(kind, current.context.id(), Box::new(action), None).run(current);
        }

        if target.is_exited() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let requester = current.as_ref().map_or(ContextId::NONE, |c| c.context.id());
        target.enqueue(PendingAction::new(kind, requester, Box::new(action), None));
        Ok(())
    }

    /// Queue an interrupt for `thread`, whichever fiber is running it
    ///
    /// The action waits on the thread record and runs on the context of the
    /// thread's current fiber at its next poll, subject to the interrupt
    /// mode. A dead thread drops it. When the caller is the thread itself the
    /// action runs inline.
    pub fn interrupt_thread<F>(&self, thread: &Arc<ThreadRecord>, action: F) -> GuestResult<()>
    where
        F: FnOnce(&PausedContext<'_>) -> GuestResult<()> + Send + 'static,
    {
        let current = tls::current();
        if let Some(current) = current
            .as_ref()
            .filter(|c| c.active_thread().is_some_and(|t| Arc::ptr_eq(t, thread)))
        {
            return PendingAction::new(ActionKind::Interrupt, current.context.id(), Box::new(action), None)
                .run(current);
        }

        let mailbox = thread.interrupts();
        if mailbox.is_closed() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let requester = current.as_ref().map_or(ContextId::NONE, |c| c.context.id());
        mailbox.push(
            PendingAction::new(ActionKind::Interrupt, requester, Box::new(action), None),
            &self.counters,
        );
        if let Some(context) = thread.fibers().current_context() {
            context.parker().interrupt();
        }

        if mailbox.is_closed() {
            mailbox.drain_skipped(&self.counters);
        }
        Ok(())
    }

    pub(crate) fn counters(&self) -> &SafepointCounters {
        &self.counters
    }

    pub fn stats(&self) -> SafepointStats {
        SafepointStats {
            requested: self.counters.requested.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            slow_polls: self.counters.slow_polls.load(Ordering::Relaxed),
        }
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Safepoint poll for guest code
///
/// Runs every action pending for the calling context. Returns the unwind of
/// an action that raised or killed.
#[inline]
pub fn poll() -> GuestResult<()> {
    if ARMED.load(Ordering::Acquire) == 0 {
        return Ok(());
    }
    match tls::current() {
        Some(current) => poll_current(&current, false),
        None => Ok(()),
    }
}

/// Re-evaluate deferred interrupts and drain the mailboxes
///
/// `in_blocking` is true when called from a blocking region, which is what
/// `InterruptMode::OnBlocking` waits for. Thread-level interrupts are only
/// taken by the context running the thread's current fiber.
pub(crate) fn poll_current(current: &Current, in_blocking: bool) -> GuestResult<()> {
    let counters = current.context.counters();
    counters.slow_polls.fetch_add(1, Ordering::Relaxed);
    // Everything the interrupt was raised for is handled below
    current.context.parker().take_interrupt();
    let deliver = should_deliver(current.interrupt_mode(), in_blocking);
    let thread = current.active_thread();

    if deliver {
        if let Some(thread) = thread {
            while let Some(action) = thread.pop_deferred_interrupt() {
                action.run(current)?;
            }
        }
        while let Some(action) = current.pop_deferred() {
            action.run(current)?;
        }
    }

    if let Some(thread) = thread {
        while let Some(action) = thread.interrupts().pop() {
            if deliver {
                action.run(current)?;
            } else {
                kdebug!("{}: deferring interrupt ({})", thread.id(), current.interrupt_mode());
                counters.deferred.fetch_add(1, Ordering::Relaxed);
                thread.defer_interrupt(action);
            }
        }
    }

    while let Some(action) = current.context.take_next() {
        match action.kind {
            ActionKind::Interrupt if !deliver => {
                kdebug!("{}: deferring interrupt ({})", current.context.id(), current.interrupt_mode());
                counters.deferred.fetch_add(1, Ordering::Relaxed);
                current.defer(action);
            }
            _ => action.run(current)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;
    use vmthread_core::{GuestException, Unwind};

    fn attach(sp: &SafepointCoordinator) -> Arc<NativeContext> {
        let ctx = sp.new_context(ThreadId::next(), FiberId::next());
        tls::install(Current::new(Arc::clone(&ctx), None, None, None));
        ctx
    }

    #[test]
    fn test_poll_fast_path_without_context() {
        assert!(poll().is_ok());
    }

    #[test]
    fn test_self_target_runs_inline() {
        let sp = Arc::new(SafepointCoordinator::new());
        let sp2 = Arc::clone(&sp);
        thread::spawn(move || {
            let ctx = attach(&sp2);
            let hits = Arc::new(AtomicUsize::new(0));
            let h = Arc::clone(&hits);
            let ran = sp2
                .pause_and_execute(&ctx, move |paused| {
                    assert_eq!(paused.requester, paused.context.id());
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            assert!(ran);
            assert_eq!(hits.load(Ordering::SeqCst), 1);
            drop(tls::uninstall());
        })
        .join()
        .unwrap();
        assert_eq!(sp.stats().executed, 1);
    }

    #[test]
    fn test_pause_busy_target() {
        let sp = Arc::new(SafepointCoordinator::new());
        let (tx, rx) = std::sync::mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicUsize::new(0));

        let target = {
            let (sp, stop) = (Arc::clone(&sp), Arc::clone(&stop));
            thread::spawn(move || {
                let ctx = attach(&sp);
                tx.send(ctx).unwrap();
                let mut iterations = 0u64;
                while !stop.load(Ordering::SeqCst) {
                    poll().unwrap();
                    iterations += 1;
                }
                drop(tls::uninstall());
                iterations
            })
        };

        let ctx = rx.recv().unwrap();
        let h = Arc::clone(&hits);
        let target_id = ctx.id();
        let ran = sp
            .pause_and_execute(&ctx, move |paused| {
                assert_eq!(paused.context.id(), target_id);
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(ran);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        stop.store(true, Ordering::SeqCst);
        assert!(target.join().unwrap() > 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dead_target_is_skipped() {
        let sp = SafepointCoordinator::new();
        let ctx = sp.new_context(ThreadId::next(), FiberId::next());
        ctx.mark_exited();

        let ran = sp.pause_and_execute(&ctx, |_| panic!("must not run")).unwrap();
        assert!(!ran);
        sp.pause_and_execute_later(&ctx, ActionKind::Interrupt, |_| panic!("must not run"))
            .unwrap();
        assert_eq!(sp.stats().skipped, 2);
    }

    #[test]
    fn test_actions_run_in_request_order() {
        let sp = Arc::new(SafepointCoordinator::new());
        let ctx = sp.new_context(ThreadId::next(), FiberId::next());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            sp.pause_and_execute_later(&ctx, ActionKind::System, move |_| {
                order.lock().push(i);
                Ok(())
            })
            .unwrap();
        }

        let ctx2 = Arc::clone(&ctx);
        thread::spawn(move || {
            tls::install(Current::new(ctx2, None, None, None));
            poll().unwrap();
            drop(tls::uninstall());
        })
        .join()
        .unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_raising_action_unwinds_target() {
        let sp = SafepointCoordinator::new();
        let ctx = sp.new_context(ThreadId::next(), FiberId::next());
        sp.pause_and_execute_later(&ctx, ActionKind::Interrupt, |_| {
            Err(Unwind::raise(GuestException::new("RuntimeError", "injected")))
        })
        .unwrap();

        let ctx2 = Arc::clone(&ctx);
        let err = thread::spawn(move || {
            tls::install(Current::new(ctx2, None, None, None));
            let result = poll();
            drop(tls::uninstall());
            result
        })
        .join()
        .unwrap()
        .unwrap_err();

        assert_eq!(err.exception().unwrap().message(), "injected");
    }

    #[test]
    fn test_target_exit_releases_waiting_requester() {
        let sp = Arc::new(SafepointCoordinator::new());
        let ctx = sp.new_context(ThreadId::next(), FiberId::next());

        let exiter = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ctx.mark_exited();
            })
        };

        let ran = sp.pause_and_execute(&ctx, |_| Ok(())).unwrap();
        assert!(!ran);
        exiter.join().unwrap();
    }

    #[test]
    fn test_poll_consumes_interrupt_flag() {
        let sp = SafepointCoordinator::new();
        let ctx = sp.new_context(ThreadId::next(), FiberId::next());
        sp.pause_and_execute_later(&ctx, ActionKind::System, |_| Ok(())).unwrap();
        assert!(ctx.parker().is_interrupted());

        let ctx2 = Arc::clone(&ctx);
        let hooks = thread::spawn(move || {
            tls::install(Current::new(Arc::clone(&ctx2), None, None, None));
            poll().unwrap();
            assert!(!ctx2.parker().is_interrupted());

            // A later wait is not cut short by the already-handled request
            let mut hooks = 0;
            let deadline = std::time::Instant::now() + Duration::from_millis(20);
            crate::blocking::run_until_result_with(
                |parker: &Arc<Parker>| match parker.wait_until(Some(deadline), || false) {
                    WaitOutcome::Interrupted => Err(Interrupted),
                    _ => Ok(()),
                },
                || hooks += 1,
            )
            .unwrap();
            drop(tls::uninstall());
            hooks
        })
        .join()
        .unwrap();

        assert_eq!(hooks, 0);
        assert_eq!(sp.stats().executed, 1);
    }
}
