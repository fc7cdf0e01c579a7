//! Fibers
//!
//! Every fiber is bound to its own native context. Fibers of one thread
//! hand control to each other explicitly through a one-slot inbox, so at
//! most one of them runs at a time:
//!
//! ```text
//!  resumer                              fiber
//!  -------                              -----
//!  fiber.deliver(Resume(v))  ------>    receive() -> Resume(v)
//!  receive() ... blocked                 ... body ...
//!                            <------    resumer.deliver(Yield(w) | Finish(r))
//! ```
//!
//! Waiting in `receive` goes through `run_until_result`, so a suspended
//! fiber still services safepoints.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use vmthread_core::{FiberId, GuestResult, ThreadId, Value, VmError};

use crate::blocking::{run_until_result, Interrupted};
use crate::context::NativeContext;
use crate::latch::Latch;
use crate::parking::Parker;

/// Control transfer between fibers of one thread
pub(crate) enum Transfer {
    Resume(Value),
    Yield(Value),
    Finish(GuestResult<Value>),
    /// The owning thread is terminating
    Terminate,
}

pub struct FiberRecord {
    id: FiberId,
    thread: ThreadId,
    is_root: bool,
    initialized: Latch,
    finished: Latch,
    locals: Mutex<HashMap<String, Value>>,
    native: Mutex<Option<Arc<NativeContext>>>,
    inbox: Mutex<Option<Transfer>>,
    resumer: Mutex<Option<Arc<FiberRecord>>>,
}

impl FiberRecord {
    pub(crate) fn new(thread: ThreadId, is_root: bool) -> Self {
        Self {
            id: FiberId::next(),
            thread,
            is_root,
            initialized: Latch::new(),
            finished: Latch::new(),
            locals: Mutex::new(HashMap::new()),
            native: Mutex::new(None),
            inbox: Mutex::new(None),
            resumer: Mutex::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn initialized_latch(&self) -> &Latch {
        &self.initialized
    }

    pub fn finished_latch(&self) -> &Latch {
        &self.finished
    }

    pub fn is_alive(&self) -> bool {
        !self.finished.is_set()
    }

    /// Native context running this fiber; `None` once the fiber has exited
    pub fn native_context(&self) -> Option<Arc<NativeContext>> {
        self.native.lock().clone()
    }

    pub(crate) fn bind(&self, context: Arc<NativeContext>) {
        *self.native.lock() = Some(context);
    }

    pub(crate) fn clear_native(&self) {
        self.native.lock().take();
    }

    // Fiber-local storage

    pub fn local(&self, key: &str) -> Option<Value> {
        self.locals.lock().get(key).cloned()
    }

    pub fn set_local(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.locals.lock().insert(key.into(), value)
    }

    pub fn remove_local(&self, key: &str) -> Option<Value> {
        self.locals.lock().remove(key)
    }

    pub fn local_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.locals.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    // Hand-off

    pub(crate) fn set_resumer(&self, resumer: Option<Arc<FiberRecord>>) {
        *self.resumer.lock() = resumer;
    }

    pub(crate) fn take_resumer(&self) -> Option<Arc<FiberRecord>> {
        self.resumer.lock().take()
    }

    pub(crate) fn has_resumer(&self) -> bool {
        self.resumer.lock().is_some()
    }

    /// Put `transfer` in this fiber's inbox and wake it
    pub(crate) fn deliver(&self, transfer: Transfer) {
        *self.inbox.lock() = Some(transfer);
        if let Some(context) = self.native_context() {
            context.parker().unpark();
        }
    }

    /// Wait on the calling context until something arrives in the inbox
    pub(crate) fn receive(&self) -> GuestResult<Transfer> {
        run_until_result(|parker: &Arc<Parker>| {
            let mut taken = None;
            parker.wait_until(None, || {
                taken = self.inbox.lock().take();
                taken.is_some()
            });
            taken.ok_or(Interrupted)
        })
    }
}

impl fmt::Debug for FiberRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRecord")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .field("root", &self.is_root)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// The fibers of one thread
pub struct FiberManager {
    root: Arc<FiberRecord>,
    current: Mutex<Arc<FiberRecord>>,
    fibers: Mutex<Vec<Arc<FiberRecord>>>,
}

impl FiberManager {
    pub(crate) fn new(thread: ThreadId) -> Self {
        let root = Arc::new(FiberRecord::new(thread, true));
        Self {
            current: Mutex::new(Arc::clone(&root)),
            fibers: Mutex::new(vec![Arc::clone(&root)]),
            root,
        }
    }

    pub fn root(&self) -> &Arc<FiberRecord> {
        &self.root
    }

    /// Fiber currently running as the thread's activity
    pub fn current(&self) -> Arc<FiberRecord> {
        Arc::clone(&self.current.lock())
    }

    pub(crate) fn set_current(&self, fiber: &Arc<FiberRecord>) {
        *self.current.lock() = Arc::clone(fiber);
    }

    /// Native context of the current fiber, the target for interrupts
    pub fn current_context(&self) -> Option<Arc<NativeContext>> {
        self.current().native_context()
    }

    /// Snapshot of live fibers in creation order
    pub fn fibers(&self) -> Vec<Arc<FiberRecord>> {
        self.fibers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.fibers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.lock().is_empty()
    }

    pub(crate) fn register(&self, fiber: &Arc<FiberRecord>) -> Result<(), VmError> {
        if fiber.thread_id() != self.root.thread_id() {
            return Err(VmError::Lifecycle("fiber belongs to another thread"));
        }
        self.fibers.lock().push(Arc::clone(fiber));
        Ok(())
    }

    pub(crate) fn remove(&self, fiber: &Arc<FiberRecord>) {
        self.fibers.lock().retain(|f| !Arc::ptr_eq(f, fiber));
    }

    /// Tell every suspended non-root fiber to unwind
    pub(crate) fn terminate_suspended(&self) {
        for fiber in self.fibers() {
            if !fiber.is_root() && fiber.is_alive() {
                fiber.deliver(Transfer::Terminate);
            }
        }
    }
}

impl fmt::Debug for FiberManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberManager")
            .field("root", &self.root.id())
            .field("current", &self.current().id())
            .field("fibers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmthread_core::value;

    #[test]
    fn test_root_is_current() {
        let thread = ThreadId::next();
        let manager = FiberManager::new(thread);
        assert!(manager.root().is_root());
        assert!(Arc::ptr_eq(&manager.current(), manager.root()));
        assert_eq!(manager.len(), 1);
        assert!(manager.current_context().is_none());
    }

    #[test]
    fn test_register_rejects_foreign_fiber() {
        let manager = FiberManager::new(ThreadId::next());
        let foreign = Arc::new(FiberRecord::new(ThreadId::next(), false));
        assert!(manager.register(&foreign).is_err());

        let own = Arc::new(FiberRecord::new(manager.root().thread_id(), false));
        manager.register(&own).unwrap();
        assert_eq!(manager.len(), 2);
        manager.remove(&own);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_locals() {
        let fiber = FiberRecord::new(ThreadId::next(), true);
        assert!(fiber.set_local("b", value(2i64)).is_none());
        fiber.set_local("a", value(1i64));
        assert_eq!(fiber.local_keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(fiber.local("a").unwrap().downcast_ref::<i64>(), Some(&1));
        assert!(fiber.remove_local("a").is_some());
        assert!(fiber.local("a").is_none());
    }

    #[test]
    fn test_deliver_then_receive() {
        let fiber = FiberRecord::new(ThreadId::next(), false);
        fiber.deliver(Transfer::Yield(value(9u8)));
        match fiber.receive().unwrap() {
            Transfer::Yield(v) => assert_eq!(v.downcast_ref::<u8>(), Some(&9)),
            _ => panic!("unexpected transfer"),
        }
    }
}
