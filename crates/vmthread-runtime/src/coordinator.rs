//! Thread coordinator
//!
//! Owns the thread registry and the safepoint engine of one runtime and
//! implements the guest-visible thread operations on top of them.
//!
//! # Lifecycle
//!
//! ```text
//!  create() -> RUN <-> SLEEP -> (ABORTING) -> DEAD
//! ```
//!
//! A spawned thread runs, in order: TLS setup, `initialized` latch, a poll
//! (requests issued before it started), the body, outcome capture, retire
//! (context exit, `finish`). Every exit path of the body goes through the
//! same capture, so `create` never fails once the native thread exists.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use vmthread_core::kprint::{self, LogLevel};
use vmthread_core::{
    classes, kdebug, kwarn, value, Backtrace, GuestException, GuestResult, InterruptMode,
    Priority, Services, ThreadStatus, Unwind, Value, VmError, VmResult,
};

use crate::blocking::{run_until_result, run_until_result_with, BlockingAction, Interrupted};
use crate::config::RuntimeConfig;
use crate::context::NativeContext;
use crate::fiber::{FiberRecord, Transfer};
use crate::parking::{Parker, WaitOutcome};
use crate::registry::ThreadRegistry;
use crate::safepoint::{self, poll_current, SafepointCoordinator};
use crate::thread::{ThreadGroup, ThreadOptions, ThreadOutcome, ThreadRecord};
use crate::tls::{self, Current};

pub struct ThreadCoordinator {
    config: RuntimeConfig,
    services: Services,
    safepoint: SafepointCoordinator,
    registry: ThreadRegistry,
    shutting_down: AtomicBool,
}

impl ThreadCoordinator {
    pub fn new(config: RuntimeConfig, services: Services) -> VmResult<Arc<Self>> {
        config.validate()?;
        if config.debug_logging {
            if kprint::log_level() < LogLevel::Debug {
                kprint::set_log_level(LogLevel::Debug);
            }
            config.print();
        }
        Ok(Arc::new(Self {
            config,
            services,
            safepoint: SafepointCoordinator::new(),
            registry: ThreadRegistry::new(),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn safepoint(&self) -> &SafepointCoordinator {
        &self.safepoint
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn new_thread_defaults(&self) -> (Priority, bool, ThreadGroup) {
        let group = tls::current_thread().map(|t| t.group()).unwrap_or_default();
        (self.config.default_priority, self.config.abort_on_exception, group)
    }

    // ------------------------------------------------------------------
    // Main thread
    // ------------------------------------------------------------------

    /// Register the calling OS thread as the runtime's main thread
    pub fn attach_main(self: &Arc<Self>) -> VmResult<Arc<ThreadRecord>> {
        if tls::is_attached() {
            return Err(VmError::AlreadyInitialized);
        }

        let thread = Arc::new(ThreadRecord::new(
            ThreadOptions::new().name("main"),
            (self.config.default_priority, self.config.abort_on_exception, ThreadGroup::default()),
            None,
            true,
        ));
        self.registry.set_main(&thread)?;

        let root = Arc::clone(thread.fibers().root());
        let context = self.safepoint.new_context(thread.id(), root.id());
        root.bind(Arc::clone(&context));
        tls::install(Current::new(
            context,
            Some(Arc::clone(&thread)),
            Some(Arc::clone(&root)),
            Some(Arc::clone(self)),
        ));
        root.initialized_latch().count_down();

        kdebug!("{} attached as main thread", thread.id());
        Ok(thread)
    }

    /// Finish the main thread and detach it from the calling OS thread
    pub fn detach_main(&self) -> VmResult<()> {
        let main = self.registry.main().ok_or(VmError::NotInitialized)?;
        match tls::current_thread() {
            Some(current) if Arc::ptr_eq(&current, &main) => {}
            _ => return Err(VmError::Lifecycle("main thread must be detached by itself")),
        }
        main.fibers().terminate_suspended();
        self.retire(&main, ThreadOutcome::Value(value(())));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Start a new thread running `body`
    ///
    /// Returns as soon as the native thread is spawned; the record's
    /// `is_initialized()` turns true once it runs.
    #[track_caller]
    pub fn create<F>(self: &Arc<Self>, options: ThreadOptions, body: F) -> VmResult<Arc<ThreadRecord>>
    where
        F: FnOnce() -> GuestResult<Value> + Send + 'static,
    {
        let caller = std::panic::Location::caller();
        if options.name.as_deref().is_some_and(|n| n.contains('\0')) {
            return Err(VmError::Configuration("thread name contains a NUL byte".into()));
        }
        if self.is_shutting_down() {
            return Err(VmError::Lifecycle("runtime is shutting down"));
        }

        let thread = Arc::new(ThreadRecord::new(
            options,
            self.new_thread_defaults(),
            Some(format!("{}:{}", caller.file(), caller.line())),
            false,
        ));
        let root = Arc::clone(thread.fibers().root());
        let context = self.safepoint.new_context(thread.id(), root.id());
        root.bind(Arc::clone(&context));
        self.registry.register(&thread);

        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name_prefix, thread.id().as_u64()))
            .stack_size(self.config.thread_stack_size)
            .spawn({
                let coordinator = Arc::clone(self);
                let thread = Arc::clone(&thread);
                move || coordinator.run_thread(thread, context, body)
            });

        match spawned {
            Ok(_) => {
                kdebug!("{} created at {}:{}", thread.id(), caller.file(), caller.line());
                Ok(thread)
            }
            Err(e) => {
                self.registry.remove(thread.id());
                root.clear_native();
                Err(VmError::PlatformError(e.raw_os_error().unwrap_or(0)))
            }
        }
    }

    fn run_thread<F>(self: Arc<Self>, thread: Arc<ThreadRecord>, context: Arc<NativeContext>, body: F)
    where
        F: FnOnce() -> GuestResult<Value>,
    {
        let root = Arc::clone(thread.fibers().root());
        tls::install(Current::new(
            context,
            Some(Arc::clone(&thread)),
            Some(root.clone()),
            Some(Arc::clone(&self)),
        ));
        root.initialized_latch().count_down();
        kdebug!("{} started", thread.id());

        // Requests issued before the thread started (an early kill) apply first
        let result = safepoint::poll().and_then(|()| {
            catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|panic| Err(panic_to_unwind(panic)))
        });

        let outcome = self.capture_outcome(&thread, result);
        thread.fibers().terminate_suspended();
        self.retire(&thread, outcome);
        kdebug!("{} finished", thread.id());
    }

    fn capture_outcome(&self, thread: &ThreadRecord, result: GuestResult<Value>) -> ThreadOutcome {
        match result {
            Ok(v) => ThreadOutcome::Value(v),
            Err(Unwind::Kill) => {
                kdebug!("{} killed", thread.id());
                ThreadOutcome::Exception(Arc::new(GuestException::killed()))
            }
            Err(Unwind::Raise(exc)) => {
                // Still on the failing context, so this is its own stack
                if !exc.has_backtrace() {
                    exc.set_backtrace(self.services.backtrace.capture());
                }
                if !exc.is_kill() {
                    if thread.abort_on_exception() {
                        self.services.reporter.report_uncaught(thread.id(), &exc);
                    } else if self.config.report_on_exception {
                        kwarn!("{} terminated with exception: {}", thread.id(), exc);
                    }
                }
                ThreadOutcome::Exception(exc)
            }
        }
    }

    /// Exit the calling thread's root context and publish its outcome
    fn retire(&self, thread: &Arc<ThreadRecord>, outcome: ThreadOutcome) {
        thread.close_interrupts(self.safepoint.counters());
        self.registry.remove(thread.id());
        let current = tls::uninstall();
        if let Some(current) = &current {
            current.context.mark_exited();
        }
        let root = thread.fibers().root();
        root.clear_native();
        root.finished_latch().count_down();
        thread.finish(outcome);
        drop(current);
    }

    // ------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------

    /// Wait for `target` to terminate
    ///
    /// Returns `Ok(false)` if `timeout` elapsed first. If the target died
    /// with an exception (including a kill), it is re-raised here.
    pub fn join(&self, target: &Arc<ThreadRecord>, timeout: Option<Duration>) -> GuestResult<bool> {
        if let Some(current) = tls::current_thread() {
            if Arc::ptr_eq(&current, target) && target.is_alive() {
                return Err(VmError::Lifecycle("target thread must not be current thread").into());
            }
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let finished = target.finished_latch();
        let joined = run_until_result(|parker: &Arc<Parker>| {
            match finished.await_on(parker, deadline) {
                WaitOutcome::Ready => Ok(true),
                WaitOutcome::TimedOut => Ok(false),
                WaitOutcome::Interrupted => Err(Interrupted),
            }
        })?;

        if joined {
            if let Some(exc) = target.exception() {
                return Err(Unwind::Raise(Arc::clone(exc)));
            }
        }
        Ok(joined)
    }

    /// Join without a bound and return the thread's value
    pub fn value_of(&self, target: &Arc<ThreadRecord>) -> GuestResult<Value> {
        self.join(target, None)?;
        debug_assert!(target.value().is_some(), "{} joined without a value", target.id());
        target
            .value()
            .cloned()
            .ok_or_else(|| VmError::Lifecycle("thread terminated without a value").into())
    }

    // ------------------------------------------------------------------
    // Asynchronous requests
    // ------------------------------------------------------------------

    /// Request termination of `target`
    ///
    /// A no-op if the target is dead or already dying. Otherwise the kill is
    /// applied at the target's next safepoint, subject to its interrupt mode.
    pub fn kill(&self, target: &Arc<ThreadRecord>) -> GuestResult<()> {
        if matches!(target.status(), ThreadStatus::Dead | ThreadStatus::Aborting) {
            return Ok(());
        }

        kdebug!("kill requested for {}", target.id());
        let victim = Arc::clone(target);
        self.safepoint.interrupt_thread(target, move |_| {
            if victim.begin_abort() {
                Err(Unwind::Kill)
            } else {
                Ok(())
            }
        })
    }

    /// Cut short `target`'s current or next sleep
    pub fn wakeup(&self, target: &Arc<ThreadRecord>) -> VmResult<()> {
        let context = target
            .fibers()
            .current_context()
            .filter(|c| !c.is_exited() && target.is_alive())
            .ok_or(VmError::Lifecycle("killed thread"))?;

        kdebug!("wakeup requested for {}", target.id());
        target.request_wake();
        context.parker().interrupt();
        Ok(())
    }

    /// Raise `exc` inside `target` at its next safepoint
    pub fn interrupt_for_raise(&self, target: &Arc<ThreadRecord>, exc: Arc<GuestException>) -> GuestResult<()> {
        self.services.sharing.write_barrier(&exc);
        if !target.is_alive() {
            return Ok(());
        }

        kdebug!("raise of {} requested for {}", exc, target.id());
        let backtraces = Arc::clone(&self.services.backtrace);
        self.safepoint.interrupt_thread(target, move |_| {
            if !exc.has_backtrace() {
                exc.set_backtrace(backtraces.capture());
            }
            Err(Unwind::Raise(exc))
        })
    }

    /// Capture `target`'s backtrace on the target itself
    ///
    /// `None` if the target is dead. If the fiber it was running exits
    /// before the capture, the request follows the thread's next fiber.
    pub fn backtrace(&self, target: &Arc<ThreadRecord>) -> GuestResult<Option<Backtrace>> {
        loop {
            let Some(context) = target.fibers().current_context() else {
                return Ok(None);
            };

            let slot = Arc::new(OnceLock::new());
            let service = Arc::clone(&self.services.backtrace);
            let ran = self.safepoint.pause_and_execute(&context, {
                let slot = Arc::clone(&slot);
                move |_| {
                    let _ = slot.set(service.capture());
                    Ok(())
                }
            })?;

            if ran {
                return Ok(slot.get().cloned());
            }
            if !target.is_alive() {
                return Ok(None);
            }
            std::thread::yield_now();
        }
    }

    // ------------------------------------------------------------------
    // Calls made by the current thread
    // ------------------------------------------------------------------

    /// Run `body` with `timing` as the interrupt mode
    ///
    /// The previous mode is restored on every exit path. Interrupts
    /// deferred under the old mode are re-evaluated on entry and exit.
    pub fn handle_interrupt<T, F>(&self, exception_class: &str, timing: &str, body: F) -> GuestResult<T>
    where
        F: FnOnce() -> GuestResult<T>,
    {
        let mode: InterruptMode = timing.parse()?;
        let current = tls::current().ok_or(VmError::NotInitialized)?;
        let thread = current.thread.clone().ok_or(VmError::NotInitialized)?;
        kdebug!("{}: handle_interrupt({}, {})", thread.id(), exception_class, mode);

        let result = {
            let _scope = thread.enter_interrupt_mode(mode);
            poll_current(&current, false).and_then(|()| body())
        };

        let v = result?;
        poll_current(&current, false)?;
        Ok(v)
    }

    /// Sleep for `duration` (forever if `None`) or until woken
    ///
    /// Returns the time actually slept.
    pub fn sleep(&self, duration: Option<Duration>) -> GuestResult<Duration> {
        let thread = tls::current_thread().ok_or(VmError::NotInitialized)?;
        let start = Instant::now();
        let deadline = duration.and_then(|d| start.checked_add(d));

        run_until_result(|parker: &Arc<Parker>| {
            if thread.take_wake() {
                return Ok(());
            }
            match parker.wait_until(deadline, || thread.wake_requested()) {
                WaitOutcome::Ready => {
                    thread.take_wake();
                    Ok(())
                }
                WaitOutcome::TimedOut => Ok(()),
                WaitOutcome::Interrupted => Err(Interrupted),
            }
        })?;

        Ok(start.elapsed())
    }

    /// Voluntary yield: a safepoint followed by an OS-level yield
    pub fn pass(&self) -> GuestResult<()> {
        safepoint::poll()?;
        std::thread::yield_now();
        Ok(())
    }

    /// Run `runner` as a blocking action with `unblocker` as its interrupt hook
    pub fn unblock<T, R, U>(&self, runner: R, unblocker: U) -> GuestResult<T>
    where
        R: BlockingAction<T>,
        U: FnMut(),
    {
        run_until_result_with(runner, unblocker)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Snapshot of live threads in creation order
    pub fn list(&self) -> Vec<Arc<ThreadRecord>> {
        self.registry.list()
    }

    pub fn main(&self) -> Option<Arc<ThreadRecord>> {
        self.registry.main()
    }

    pub fn current(&self) -> Option<Arc<ThreadRecord>> {
        tls::current_thread()
    }

    // ------------------------------------------------------------------
    // Fibers
    // ------------------------------------------------------------------

    /// Create a suspended fiber of the current thread
    ///
    /// The fiber starts running `body` on its first `resume`.
    pub fn create_fiber<F>(self: &Arc<Self>, body: F) -> VmResult<Arc<FiberRecord>>
    where
        F: FnOnce(Value) -> GuestResult<Value> + Send + 'static,
    {
        let thread = tls::current_thread().ok_or(VmError::NotInitialized)?;
        let fiber = Arc::new(FiberRecord::new(thread.id(), false));
        let context = self.safepoint.new_context(thread.id(), fiber.id());
        fiber.bind(Arc::clone(&context));
        thread.fibers().register(&fiber)?;

        let spawned = std::thread::Builder::new()
            .name(format!(
                "{}-{}f{}",
                self.config.thread_name_prefix,
                thread.id().as_u64(),
                fiber.id().as_u64()
            ))
            .stack_size(self.config.thread_stack_size)
            .spawn({
                let coordinator = Arc::clone(self);
                let (thread, fiber) = (Arc::clone(&thread), Arc::clone(&fiber));
                move || coordinator.run_fiber(thread, fiber, context, body)
            });

        match spawned {
            Ok(_) => {
                kdebug!("{} created {}", thread.id(), fiber.id());
                Ok(fiber)
            }
            Err(e) => {
                thread.fibers().remove(&fiber);
                fiber.clear_native();
                Err(VmError::PlatformError(e.raw_os_error().unwrap_or(0)))
            }
        }
    }

    fn run_fiber<F>(
        self: Arc<Self>,
        thread: Arc<ThreadRecord>,
        fiber: Arc<FiberRecord>,
        context: Arc<NativeContext>,
        body: F,
    ) where
        F: FnOnce(Value) -> GuestResult<Value>,
    {
        tls::install(Current::new(
            context,
            Some(Arc::clone(&thread)),
            Some(Arc::clone(&fiber)),
            Some(Arc::clone(&self)),
        ));
        fiber.initialized_latch().count_down();

        let result = match fiber.receive() {
            Ok(Transfer::Resume(v)) => catch_unwind(AssertUnwindSafe(|| body(v)))
                .unwrap_or_else(|panic| Err(panic_to_unwind(panic))),
            Ok(Transfer::Terminate) => Err(Unwind::Kill),
            Ok(_) => Err(VmError::Lifecycle("fiber started without resume").into()),
            Err(unwind) => Err(unwind),
        };

        let resumer = fiber.take_resumer();
        thread.fibers().remove(&fiber);
        let current = tls::uninstall();
        if let Some(current) = &current {
            current.context.mark_exited();
        }
        fiber.clear_native();
        fiber.finished_latch().count_down();
        if let Some(resumer) = resumer {
            thread.fibers().set_current(&resumer);
            resumer.deliver(Transfer::Finish(result));
        }
        drop(current);
    }

    /// Transfer control to `fiber`, returning what it yields or returns
    pub fn resume(&self, fiber: &Arc<FiberRecord>, v: Value) -> GuestResult<Value> {
        let current = tls::current().ok_or(VmError::NotInitialized)?;
        let (thread, me) = match (&current.thread, &current.fiber) {
            (Some(t), Some(f)) => (Arc::clone(t), Arc::clone(f)),
            _ => return Err(VmError::NotInitialized.into()),
        };
        drop(current);

        if fiber.thread_id() != thread.id() {
            return Err(VmError::Lifecycle("fiber called across threads").into());
        }
        if !fiber.is_alive() {
            return Err(VmError::Lifecycle("dead fiber called").into());
        }
        if fiber.is_root() || Arc::ptr_eq(fiber, &me) || fiber.has_resumer() {
            return Err(VmError::Lifecycle("attempt to resume a resumed fiber").into());
        }

        fiber.set_resumer(Some(Arc::clone(&me)));
        thread.fibers().set_current(fiber);
        fiber.deliver(Transfer::Resume(v));

        let transfer = me.receive();
        thread.fibers().set_current(&me);
        match transfer? {
            Transfer::Yield(v) => Ok(v),
            Transfer::Finish(result) => result,
            Transfer::Terminate => Err(Unwind::Kill),
            Transfer::Resume(_) => Err(VmError::Lifecycle("unexpected resume of a resuming fiber").into()),
        }
    }

    /// Transfer control back to the fiber that resumed the current one
    pub fn fiber_yield(&self, v: Value) -> GuestResult<Value> {
        let current = tls::current().ok_or(VmError::NotInitialized)?;
        let (thread, me) = match (&current.thread, &current.fiber) {
            (Some(t), Some(f)) => (Arc::clone(t), Arc::clone(f)),
            _ => return Err(VmError::NotInitialized.into()),
        };
        drop(current);

        if me.is_root() {
            return Err(VmError::Lifecycle("can't yield from root fiber").into());
        }
        let resumer = me
            .take_resumer()
            .ok_or(VmError::Lifecycle("attempt to yield on a not resumed fiber"))?;

        thread.fibers().set_current(&resumer);
        resumer.deliver(Transfer::Yield(v));

        match me.receive()? {
            Transfer::Resume(v) => Ok(v),
            Transfer::Terminate => Err(Unwind::Kill),
            _ => Err(VmError::Lifecycle("unexpected transfer to a suspended fiber").into()),
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Kill every thread except the caller and main, then wait for them
    ///
    /// Waiting is bounded by `config.shutdown_timeout`; threads still alive
    /// after that (e.g. stuck under `InterruptMode::Never`) are abandoned.
    pub fn shutdown(&self) -> GuestResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let me = tls::current_thread();
        let others: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .filter(|t| !t.is_main() && !me.as_ref().is_some_and(|m| Arc::ptr_eq(m, t)))
            .collect();
        kdebug!("shutdown: stopping {} thread(s)", others.len());

        for thread in &others {
            self.kill(thread)?;
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for thread in &others {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.join(thread, Some(remaining)) {
                Ok(true) | Err(Unwind::Raise(_)) => {}
                Ok(false) => kwarn!("shutdown: {} did not terminate in time", thread.id()),
                Err(Unwind::Kill) => return Err(Unwind::Kill),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ThreadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCoordinator")
            .field("threads", &self.registry.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

fn panic_to_unwind(panic: Box<dyn Any + Send>) -> Unwind {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Unwind::raise(GuestException::new(classes::RUNTIME_ERROR, format!("panic: {}", message)))
}
