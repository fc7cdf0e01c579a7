//! # vmthread - Safepoint-coordinated threads and fibers
//!
//! Thread model for the implementation of a managed language: every guest
//! thread runs on its own native thread, and threads only ever act on each
//! other by queueing work that the target runs itself at a safepoint.
//!
//! ## Features
//!
//! - **Safepoints**: `safepoint!()` is a single atomic load unless work is pending
//! - **Asynchronous interrupts**: `kill` and `raise` delivered at safepoints,
//!   gated by a per-thread interrupt mode (`handle_interrupt`)
//! - **Interruptible blocking**: join, sleep and fiber hand-off retry after
//!   servicing interrupts, so a blocked thread is never unresponsive
//! - **Fibers**: cooperative coroutines, one running per thread at a time
//!
//! ## Quick Start
//!
//! ```ignore
//! use vmthread::{safepoint, value, Runtime, RuntimeConfig};
//!
//! fn main() -> vmthread::VmResult<()> {
//!     let runtime = Runtime::new(RuntimeConfig::from_env(), Default::default())?;
//!
//!     let worker = vmthread::spawn(|| {
//!         let mut n = 0u64;
//!         loop {
//!             safepoint!();
//!             n += 1;
//!         }
//!     })?;
//!
//!     vmthread::sleep(Some(std::time::Duration::from_millis(10)))?;
//!     worker.kill()?;
//!     assert!(worker.join(None).is_err());
//!     runtime.shutdown()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Guest code                             │
//! │       spawn(), join(), kill(), raise(), safepoint!()        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ThreadCoordinator                         │
//! │        registry, lifecycle, fibers, interrupt policy        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SafepointCoordinator                       │
//! │    per-context mailbox, poll, blocking pause_and_execute    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Context  │      │  Context  │      │  Context  │
//!    │  (parker) │      │  (parker) │      │  (parker) │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

// Re-export core types
pub use vmthread_core::{
    classes, value, Backtrace, ContextId, FiberId, GuestException, GuestResult, InterruptMode,
    Priority, Services, ThreadId, ThreadStatus, Unwind, Value, VmError, VmResult,
};
pub use vmthread_core::traits::{
    BacktraceService, ErrorReporter, LogReporter, NativeBacktrace, NoSharing, SharingService,
};

// Re-export kprint macros for debug logging
pub use vmthread_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use vmthread_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use vmthread_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use vmthread_runtime::{
    poll, BlockingAction, Interrupted, Parker, RuntimeConfig, SafepointStats, StatusReport,
    ThreadCoordinator, ThreadGroup, ThreadOptions, WaitOutcome,
};

use vmthread_runtime::{tls, FiberRecord, ThreadRecord};

/// Runtime handle
///
/// Creating it attaches the calling OS thread as the main guest thread.
/// Dropping it (or calling `shutdown`) kills the remaining threads and
/// detaches main. Must stay on the thread that created it.
pub struct Runtime {
    coordinator: Arc<ThreadCoordinator>,
    main: Thread,
    detached: bool,
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// Create a runtime and attach the calling thread as main
    pub fn new(config: RuntimeConfig, services: Services) -> VmResult<Self> {
        init_logging();
        let coordinator = ThreadCoordinator::new(config, services)?;
        let record = coordinator.attach_main()?;
        Ok(Self {
            main: Thread::from_parts(record, Arc::clone(&coordinator)),
            coordinator,
            detached: false,
            _not_send: PhantomData,
        })
    }

    /// Runtime configured from `VMT_*` environment variables
    pub fn from_env() -> VmResult<Self> {
        Self::new(RuntimeConfig::from_env(), Services::default())
    }

    pub fn coordinator(&self) -> &Arc<ThreadCoordinator> {
        &self.coordinator
    }

    pub fn main_thread(&self) -> &Thread {
        &self.main
    }

    pub fn stats(&self) -> SafepointStats {
        self.coordinator.safepoint().stats()
    }

    /// Kill every other thread, wait for them, then detach main
    pub fn shutdown(mut self) -> VmResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> VmResult<()> {
        if std::mem::replace(&mut self.detached, true) {
            return Ok(());
        }
        let stopped = self.coordinator.shutdown().map_err(VmError::from);
        self.coordinator.detach_main()?;
        stopped
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            kwarn!("runtime shutdown: {}", e);
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("main", &self.main.id())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

/// Handle to a guest thread
#[derive(Clone)]
pub struct Thread {
    record: Arc<ThreadRecord>,
    coordinator: Arc<ThreadCoordinator>,
}

impl Thread {
    fn from_parts(record: Arc<ThreadRecord>, coordinator: Arc<ThreadCoordinator>) -> Self {
        Self { record, coordinator }
    }

    pub fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.record.id()
    }

    pub fn is_main(&self) -> bool {
        self.record.is_main()
    }

    pub fn name(&self) -> Option<String> {
        self.record.name()
    }

    pub fn set_name(&self, name: Option<String>) -> VmResult<()> {
        if name.as_deref().is_some_and(|n| n.contains('\0')) {
            return Err(VmError::Configuration("thread name contains a NUL byte".into()));
        }
        self.record.set_name(name);
        Ok(())
    }

    pub fn status(&self) -> ThreadStatus {
        self.record.status()
    }

    /// `run`/`sleep`/`aborting` while alive, else how the thread ended
    pub fn status_report(&self) -> StatusReport {
        self.record.status_report()
    }

    pub fn is_alive(&self) -> bool {
        self.record.is_alive()
    }

    pub fn is_stopped(&self) -> bool {
        self.record.is_stopped()
    }

    pub fn is_initialized(&self) -> bool {
        self.record.is_initialized()
    }

    pub fn priority(&self) -> Priority {
        self.record.priority()
    }

    pub fn set_priority(&self, priority: Priority) {
        self.record.set_priority(priority)
    }

    pub fn group(&self) -> ThreadGroup {
        self.record.group()
    }

    pub fn set_group(&self, group: ThreadGroup) {
        self.record.set_group(group)
    }

    pub fn abort_on_exception(&self) -> bool {
        self.record.abort_on_exception()
    }

    pub fn set_abort_on_exception(&self, enable: bool) {
        self.record.set_abort_on_exception(enable)
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        self.record.interrupt_mode()
    }

    pub fn source_location(&self) -> Option<&str> {
        self.record.source_location()
    }

    /// Wait for the thread to finish, re-raising its exception
    ///
    /// `Ok(false)` if `timeout` elapsed first.
    pub fn join(&self, timeout: Option<Duration>) -> GuestResult<bool> {
        self.coordinator.join(&self.record, timeout)
    }

    /// Join and return the thread's value
    pub fn value(&self) -> GuestResult<Value> {
        self.coordinator.value_of(&self.record)
    }

    /// Exception the thread terminated with, if any
    pub fn exception(&self) -> Option<Arc<GuestException>> {
        self.record.exception().cloned()
    }

    pub fn kill(&self) -> GuestResult<()> {
        self.coordinator.kill(&self.record)
    }

    pub fn wakeup(&self) -> VmResult<()> {
        self.coordinator.wakeup(&self.record)
    }

    /// Raise `exc` in this thread at its next safepoint
    pub fn raise(&self, exc: GuestException) -> GuestResult<()> {
        self.coordinator.interrupt_for_raise(&self.record, Arc::new(exc))
    }

    /// Backtrace captured on the thread itself; `None` once it is dead
    pub fn backtrace(&self) -> GuestResult<Option<Backtrace>> {
        self.coordinator.backtrace(&self.record)
    }

    /// Fiber currently running for this thread, owner of the fiber locals
    pub fn current_fiber(&self) -> Arc<FiberRecord> {
        self.record.fibers().current()
    }

    pub fn fiber_local(&self, key: &str) -> Option<Value> {
        self.current_fiber().local(key)
    }

    pub fn set_fiber_local(&self, key: impl Into<String>, v: Value) -> Option<Value> {
        self.current_fiber().set_local(key, v)
    }

    pub fn fiber_local_keys(&self) -> Vec<String> {
        self.current_fiber().local_keys()
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.record, f)
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.record, f)
    }
}

/// A suspended computation owned by the thread that created it
#[derive(Clone)]
pub struct Fiber {
    record: Arc<FiberRecord>,
    coordinator: Arc<ThreadCoordinator>,
}

impl Fiber {
    /// Create a fiber of the current thread; it starts on the first `resume`
    pub fn new<F>(body: F) -> VmResult<Self>
    where
        F: FnOnce(Value) -> GuestResult<Value> + Send + 'static,
    {
        let coordinator = coordinator()?;
        let record = coordinator.create_fiber(body)?;
        Ok(Self { record, coordinator })
    }

    pub fn id(&self) -> FiberId {
        self.record.id()
    }

    pub fn record(&self) -> &Arc<FiberRecord> {
        &self.record
    }

    pub fn is_alive(&self) -> bool {
        self.record.is_alive()
    }

    /// Run the fiber until it yields or returns
    pub fn resume(&self, v: Value) -> GuestResult<Value> {
        self.coordinator.resume(&self.record, v)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.record, f)
    }
}

/// Coordinator of the runtime the calling thread is attached to
pub fn coordinator() -> VmResult<Arc<ThreadCoordinator>> {
    tls::current_coordinator().ok_or(VmError::NotInitialized)
}

/// Spawn a guest thread with default options
///
/// # Example
///
/// ```ignore
/// let t = vmthread::spawn(|| Ok(vmthread::value(6 * 7)))?;
/// assert_eq!(t.value()?.downcast_ref::<i32>(), Some(&42));
/// ```
#[track_caller]
pub fn spawn<F>(body: F) -> VmResult<Thread>
where
    F: FnOnce() -> GuestResult<Value> + Send + 'static,
{
    spawn_with(ThreadOptions::new(), body)
}

/// Spawn a guest thread with explicit options
#[track_caller]
pub fn spawn_with<F>(options: ThreadOptions, body: F) -> VmResult<Thread>
where
    F: FnOnce() -> GuestResult<Value> + Send + 'static,
{
    let coordinator = coordinator()?;
    let record = coordinator.create(options, body)?;
    Ok(Thread::from_parts(record, coordinator))
}

/// The calling guest thread
pub fn current() -> Option<Thread> {
    let coordinator = tls::current_coordinator()?;
    let record = tls::current_thread()?;
    Some(Thread::from_parts(record, coordinator))
}

pub fn main() -> Option<Thread> {
    let coordinator = tls::current_coordinator()?;
    let record = coordinator.main()?;
    Some(Thread::from_parts(record, coordinator))
}

/// Live threads in creation order
pub fn list() -> Vec<Thread> {
    let Some(coordinator) = tls::current_coordinator() else {
        return Vec::new();
    };
    coordinator
        .list()
        .into_iter()
        .map(|record| Thread::from_parts(record, Arc::clone(&coordinator)))
        .collect()
}

/// Safepoint followed by an OS-level yield
pub fn pass() -> GuestResult<()> {
    coordinator()?.pass()
}

/// Sleep until `duration` elapses or the thread is woken
pub fn sleep(duration: Option<Duration>) -> GuestResult<Duration> {
    coordinator()?.sleep(duration)
}

/// Run `body` with asynchronous interrupts timed by `timing`
/// (`":immediate"`, `":on_blocking"` or `":never"`)
pub fn handle_interrupt<T, F>(exception_class: &str, timing: &str, body: F) -> GuestResult<T>
where
    F: FnOnce() -> GuestResult<T>,
{
    coordinator()?.handle_interrupt(exception_class, timing, body)
}

/// Run an interruptible blocking action, calling `unblocker` on interrupts
pub fn unblock<T, R, U>(runner: R, unblocker: U) -> GuestResult<T>
where
    R: BlockingAction<T>,
    U: FnMut(),
{
    coordinator()?.unblock(runner, unblocker)
}

/// Hand control back to the fiber that resumed the current one
pub fn fiber_yield(v: Value) -> GuestResult<Value> {
    coordinator()?.fiber_yield(v)
}

/// Check if the calling OS thread runs guest code
#[inline]
pub fn is_attached() -> bool {
    tls::is_attached()
}

/// Safepoint for guest loops
///
/// Expands to `poll()?`, so the enclosing function must return a
/// `GuestResult`. Pending kills and raises unwind from here.
///
/// # Example
///
/// ```ignore
/// use vmthread::safepoint;
///
/// for i in 0..1_000_000 {
///     safepoint!();
///     // Do work...
/// }
/// ```
#[macro_export]
macro_rules! safepoint {
    () => {
        $crate::poll()?
    };
}
