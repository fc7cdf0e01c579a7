//! Error types for the VMThread runtime

use std::sync::Arc;

use thiserror::Error;

use crate::classes;
use crate::exception::{GuestException, Unwind};

/// Result type for runtime operations
pub type VmResult<T> = Result<T, VmError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, Error)]
pub enum VmError {
    /// Invalid construction arguments or configuration values
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unknown interrupt timing symbol
    #[error("invalid timing symbol: {0}")]
    InvalidTiming(String),

    /// Operation invalid for the target's current state
    #[error("lifecycle error: {0}")]
    Lifecycle(&'static str),

    /// A failure captured inside another thread, surfaced to a joiner
    #[error("propagated failure: {0}")]
    Propagated(Arc<GuestException>),

    /// The current thread was killed while the operation was in progress
    #[error("thread killed")]
    Cancelled,

    /// No runtime is attached to the current thread
    #[error("runtime not initialized")]
    NotInitialized,

    /// The runtime was already started on this thread
    #[error("runtime already initialized")]
    AlreadyInitialized,

    /// Platform-specific error (errno)
    #[error("platform error: {0}")]
    PlatformError(i32),
}

impl VmError {
    /// Check if this error belongs to the configuration class
    pub fn is_configuration(&self) -> bool {
        matches!(self, VmError::Configuration(_) | VmError::InvalidTiming(_))
    }

    /// Convert into the guest exception that surfaces this error
    pub fn to_guest_exception(&self) -> Arc<GuestException> {
        match self {
            VmError::Propagated(exc) => Arc::clone(exc),
            VmError::Configuration(_) | VmError::InvalidTiming(_) => {
                Arc::new(GuestException::new(classes::ARGUMENT_ERROR, self.to_string()))
            }
            VmError::Lifecycle(_) => {
                Arc::new(GuestException::new(classes::THREAD_ERROR, self.to_string()))
            }
            VmError::Cancelled => Arc::new(GuestException::killed()),
            _ => Arc::new(GuestException::new(classes::RUNTIME_ERROR, self.to_string())),
        }
    }
}

impl From<Unwind> for VmError {
    fn from(unwind: Unwind) -> Self {
        match unwind {
            Unwind::Raise(exc) => VmError::Propagated(exc),
            Unwind::Kill => VmError::Cancelled,
        }
    }
}

impl From<VmError> for Unwind {
    fn from(err: VmError) -> Self {
        match err {
            VmError::Cancelled => Unwind::Kill,
            other => Unwind::Raise(other.to_guest_exception()),
        }
    }
}
