//! Collaborator service traits
//!
//! These traits define the interface between the runtime and the parts of
//! the language implementation it calls into but does not own: backtrace
//! capture, the process-wide uncaught-error reporter, and the object sharing
//! layer. Record allocation is plain `Arc` construction and has no trait.

use std::sync::Arc;

use crate::exception::{Backtrace, GuestException};
use crate::id::ThreadId;

/// Captures the call stack of the calling context
pub trait BacktraceService: Send + Sync {
    /// Capture the current context's backtrace
    ///
    /// Must be called on the context whose stack is wanted; the runtime
    /// guarantees this by calling it from inside safepoint actions.
    fn capture(&self) -> Backtrace;
}

/// Process-wide sink for failures that escaped a thread
pub trait ErrorReporter: Send + Sync {
    /// Called when a thread with `abort_on_exception` terminates with `exc`
    fn report_uncaught(&self, thread: ThreadId, exc: &Arc<GuestException>);
}

/// Makes objects safe to hand to another thread
pub trait SharingService: Send + Sync {
    /// Write barrier applied before an exception is shared across threads
    fn write_barrier(&self, exc: &Arc<GuestException>);
}

/// Backtraces from `std::backtrace`, one frame per rendered line
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBacktrace;

impl BacktraceService for NativeBacktrace {
    fn capture(&self) -> Backtrace {
        let rendered = std::backtrace::Backtrace::force_capture().to_string();
        let frames = rendered
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("at "))
            .map(str::to_string)
            .collect();
        Backtrace::new(frames)
    }
}

/// Reporter that logs uncaught failures at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report_uncaught(&self, thread: ThreadId, exc: &Arc<GuestException>) {
        crate::kerror!("{} terminated with exception (abort_on_exception): {}", thread, exc);
    }
}

/// Sharing layer for runtimes without a shared-object model
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSharing;

impl SharingService for NoSharing {
    fn write_barrier(&self, _exc: &Arc<GuestException>) {}
}

/// Bundle of collaborator services handed to the runtime at construction
#[derive(Clone)]
pub struct Services {
    pub backtrace: Arc<dyn BacktraceService>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub sharing: Arc<dyn SharingService>,
}

impl Services {
    /// Replace the error reporter
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replace the backtrace service
    pub fn backtrace(mut self, backtrace: Arc<dyn BacktraceService>) -> Self {
        self.backtrace = backtrace;
        self
    }

    /// Replace the sharing service
    pub fn sharing(mut self, sharing: Arc<dyn SharingService>) -> Self {
        self.sharing = sharing;
        self
    }
}

impl Default for Services {
    fn default() -> Self {
        Self {
            backtrace: Arc::new(NativeBacktrace),
            reporter: Arc::new(LogReporter),
            sharing: Arc::new(NoSharing),
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<ThreadId>>);

    impl ErrorReporter for Recording {
        fn report_uncaught(&self, thread: ThreadId, _exc: &Arc<GuestException>) {
            self.0.lock().unwrap().push(thread);
        }
    }

    #[test]
    fn test_native_backtrace_has_frames() {
        let bt = NativeBacktrace.capture();
        assert!(!bt.is_empty());
    }

    #[test]
    fn test_replace_reporter() {
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let services = Services::default().reporter(recording.clone());
        let exc = Arc::new(GuestException::new("RuntimeError", "x"));
        services.reporter.report_uncaught(ThreadId::from_raw(9), &exc);
        assert_eq!(*recording.0.lock().unwrap(), vec![ThreadId::from_raw(9)]);
    }
}
