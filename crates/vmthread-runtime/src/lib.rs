//! # vmthread-runtime
//!
//! Runtime implementation of the VMThread thread and fiber model.
//!
//! This crate provides:
//! - Per-context parking (futex on Linux, condvar elsewhere)
//! - The safepoint engine: mailboxes, polls, blocking requests
//! - Interruptible blocking actions and the retry loop
//! - Thread and fiber records, the thread registry
//! - The thread coordinator (create, join, kill, wakeup, raise, fibers)
//!
//! Every guest thread and every fiber runs on its own native thread. The
//! only way to act on another context is to queue work for it and let it
//! run that work itself at its next safepoint.

pub mod blocking;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod fiber;
pub mod latch;
pub mod parking;
pub mod registry;
pub mod safepoint;
pub mod thread;
pub mod tls;

// Re-exports
pub use blocking::{run_until_result, run_until_result_with, BlockingAction, Interrupted};
pub use config::RuntimeConfig;
pub use context::NativeContext;
pub use coordinator::ThreadCoordinator;
pub use fiber::{FiberManager, FiberRecord};
pub use latch::Latch;
pub use parking::{Parker, WaitOutcome};
pub use registry::ThreadRegistry;
pub use safepoint::{poll, ActionKind, PausedContext, SafepointCoordinator, SafepointStats};
pub use thread::{StatusReport, ThreadGroup, ThreadOptions, ThreadOutcome, ThreadRecord};
pub use tls::{current_context, current_coordinator, current_fiber, current_thread, is_attached};
