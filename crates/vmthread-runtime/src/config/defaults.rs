//! Library defaults for `RuntimeConfig`
//!
//! Every value here can be overridden at runtime through the matching
//! `VMT_*` environment variable (see `RuntimeConfig::from_env`).

/// Default priority index for new threads (0 = Critical .. 3 = Low)
pub const DEFAULT_PRIORITY: u8 = 2;

/// Whether new threads forward uncaught failures to the reporter
pub const ABORT_ON_EXCEPTION: bool = false;

/// Whether uncaught thread failures are logged at warn level
pub const REPORT_ON_EXCEPTION: bool = true;

/// Native stack size for spawned threads (2 MiB)
pub const THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Smallest accepted native stack size (64 KiB)
pub const MIN_THREAD_STACK_SIZE: usize = 64 * 1024;

/// Prefix for native thread names ("vmt-3", fibers "vmt-3f7")
pub const THREAD_NAME_PREFIX: &str = "vmt";

/// Upper bound on waiting for killed threads during runtime shutdown
pub const SHUTDOWN_TIMEOUT_MS: u64 = 2000;

/// Lifecycle debug logging; on by default with the `debug-logging` feature
pub const DEBUG_LOGGING: bool = cfg!(feature = "debug-logging");
