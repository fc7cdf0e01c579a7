//! Runtime configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use vmthread_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .abort_on_exception(true)
//!     .thread_stack_size(512 * 1024);
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use vmthread_core::env::{env_get, env_get_bool, env_get_ms, env_get_str};
use vmthread_core::{kprintln, Priority, VmError, VmResult};

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Priority assigned to threads created without an explicit one
    pub default_priority: Priority,
    /// Default `abort_on_exception` for new threads
    pub abort_on_exception: bool,
    /// Log uncaught thread failures at warn level
    pub report_on_exception: bool,
    /// Native stack size for spawned threads
    pub thread_stack_size: usize,
    /// Native thread name prefix
    pub thread_name_prefix: String,
    /// How long runtime shutdown waits for killed threads
    pub shutdown_timeout: Duration,
    /// Enable lifecycle debug logging
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `VMT_DEFAULT_PRIORITY` - Priority index 0..=3 (0 = Critical)
    /// - `VMT_ABORT_ON_EXCEPTION` - Forward uncaught failures to the reporter (0/1)
    /// - `VMT_REPORT_ON_EXCEPTION` - Log uncaught failures (0/1)
    /// - `VMT_THREAD_STACK_SIZE` - Native stack size in bytes
    /// - `VMT_THREAD_NAME_PREFIX` - Native thread name prefix
    /// - `VMT_SHUTDOWN_TIMEOUT_MS` - Shutdown join bound in milliseconds
    /// - `VMT_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        Self {
            default_priority: Priority::from(env_get(
                "VMT_DEFAULT_PRIORITY",
                defaults::DEFAULT_PRIORITY,
            )),
            abort_on_exception: env_get_bool(
                "VMT_ABORT_ON_EXCEPTION",
                defaults::ABORT_ON_EXCEPTION,
            ),
            report_on_exception: env_get_bool(
                "VMT_REPORT_ON_EXCEPTION",
                defaults::REPORT_ON_EXCEPTION,
            ),
            thread_stack_size: env_get("VMT_THREAD_STACK_SIZE", defaults::THREAD_STACK_SIZE),
            thread_name_prefix: env_get_str("VMT_THREAD_NAME_PREFIX", defaults::THREAD_NAME_PREFIX),
            shutdown_timeout: env_get_ms("VMT_SHUTDOWN_TIMEOUT_MS", defaults::SHUTDOWN_TIMEOUT_MS),
            debug_logging: env_get_bool("VMT_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            default_priority: Priority::from(defaults::DEFAULT_PRIORITY),
            abort_on_exception: defaults::ABORT_ON_EXCEPTION,
            report_on_exception: defaults::REPORT_ON_EXCEPTION,
            thread_stack_size: defaults::THREAD_STACK_SIZE,
            thread_name_prefix: defaults::THREAD_NAME_PREFIX.to_string(),
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn abort_on_exception(mut self, enable: bool) -> Self {
        self.abort_on_exception = enable;
        self
    }

    pub fn report_on_exception(mut self, enable: bool) -> Self {
        self.report_on_exception = enable;
        self
    }

    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> VmResult<()> {
        if self.thread_stack_size == 0 {
            return Err(VmError::Configuration("thread_stack_size must be > 0".into()));
        }
        if self.thread_stack_size < defaults::MIN_THREAD_STACK_SIZE {
            return Err(VmError::Configuration(format!(
                "thread_stack_size must be >= {} bytes",
                defaults::MIN_THREAD_STACK_SIZE
            )));
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err(VmError::Configuration("thread_name_prefix must not be empty".into()));
        }
        if self.thread_name_prefix.contains('\0') {
            return Err(VmError::Configuration("thread_name_prefix contains a NUL byte".into()));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        kprintln!("VMThread Configuration:");
        kprintln!("  default_priority:     {}", self.default_priority);
        kprintln!("  abort_on_exception:   {}", self.abort_on_exception);
        kprintln!("  report_on_exception:  {}", self.report_on_exception);
        kprintln!("  thread_stack_size:    {}", self.thread_stack_size);
        kprintln!("  thread_name_prefix:   {}", self.thread_name_prefix);
        kprintln!("  shutdown_timeout:     {:?}", self.shutdown_timeout);
        kprintln!("  debug_logging:        {}", self.debug_logging);
    }
}
