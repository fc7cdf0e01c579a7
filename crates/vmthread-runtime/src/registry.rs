//! Registry of live threads
//!
//! Owned by a `ThreadCoordinator`. Threads are registered before their
//! native context starts and removed when they terminate; `list` returns a
//! snapshot without touching any thread's own state.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use vmthread_core::{ThreadId, VmError, VmResult};

use crate::thread::ThreadRecord;

pub struct ThreadRegistry {
    threads: RwLock<BTreeMap<ThreadId, Arc<ThreadRecord>>>,
    main: OnceLock<Arc<ThreadRecord>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(BTreeMap::new()),
            main: OnceLock::new(),
        }
    }

    pub(crate) fn register(&self, thread: &Arc<ThreadRecord>) {
        self.threads.write().insert(thread.id(), Arc::clone(thread));
    }

    pub(crate) fn set_main(&self, thread: &Arc<ThreadRecord>) -> VmResult<()> {
        self.main
            .set(Arc::clone(thread))
            .map_err(|_| VmError::AlreadyInitialized)?;
        self.register(thread);
        Ok(())
    }

    pub(crate) fn remove(&self, id: ThreadId) -> Option<Arc<ThreadRecord>> {
        self.threads.write().remove(&id)
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<ThreadRecord>> {
        self.threads.read().get(&id).cloned()
    }

    pub fn main(&self) -> Option<Arc<ThreadRecord>> {
        self.main.get().cloned()
    }

    /// Live threads in creation order
    pub fn list(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{ThreadGroup, ThreadOptions};
    use vmthread_core::Priority;

    fn record() -> Arc<ThreadRecord> {
        Arc::new(ThreadRecord::new(
            ThreadOptions::new(),
            (Priority::Normal, false, ThreadGroup::default()),
            None,
            false,
        ))
    }

    #[test]
    fn test_list_is_ordered_snapshot() {
        let registry = ThreadRegistry::new();
        let (a, b, c) = (record(), record(), record());
        registry.register(&c);
        registry.register(&a);
        registry.register(&b);

        let ids: Vec<_> = registry.list().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id(), c.id()]);

        let snapshot = registry.list();
        registry.remove(b.id());
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(b.id()).is_none());
    }

    #[test]
    fn test_main_set_once() {
        let registry = ThreadRegistry::new();
        let main = record();
        registry.set_main(&main).unwrap();
        assert!(matches!(registry.set_main(&record()), Err(VmError::AlreadyInitialized)));
        assert_eq!(registry.main().unwrap().id(), main.id());
        assert_eq!(registry.len(), 1);
    }
}
