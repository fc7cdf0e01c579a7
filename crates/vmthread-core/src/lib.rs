//! # vmthread-core
//!
//! Core types for the VMThread (managed-language thread & fiber) runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The safepoint engine, parking and thread lifecycle live in `vmthread-runtime`.
//!
//! ## Modules
//!
//! - `id` - Thread, fiber and native-context identifiers
//! - `state` - Thread status and priority enums
//! - `interrupt` - Interrupt timing modes and the delivery decision
//! - `exception` - Guest values, guest exceptions and the `Unwind` carrier
//! - `error` - Error taxonomy (`VmError`)
//! - `traits` - Collaborator services (backtraces, error reporting, sharing)
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod interrupt;
pub mod exception;
pub mod error;
pub mod traits;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{ContextId, FiberId, ThreadId};
pub use state::{Priority, ThreadStatus};
pub use interrupt::{should_deliver, InterruptMode};
pub use exception::{value, Backtrace, GuestException, GuestResult, Unwind, Value};
pub use error::{VmError, VmResult};
pub use traits::{BacktraceService, ErrorReporter, Services, SharingService};
pub use env::{env_get, env_get_bool, env_get_checked, env_get_ms, env_get_opt, env_get_str, env_is_set};

/// Well-known guest exception class names raised by the runtime itself
pub mod classes {
    /// Raised for invalid arguments (e.g. an unknown interrupt timing symbol)
    pub const ARGUMENT_ERROR: &str = "ArgumentError";

    /// Raised for operations invalid in the target thread's state
    pub const THREAD_ERROR: &str = "ThreadError";

    /// Recorded as a thread's exception when it was terminated by `kill`
    pub const THREAD_KILLED: &str = "ThreadKilled";

    /// Generic runtime failure
    pub const RUNTIME_ERROR: &str = "RuntimeError";
}
