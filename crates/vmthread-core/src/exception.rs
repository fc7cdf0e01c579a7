//! Guest values, guest exceptions and unwinding
//!
//! The object model of the guest language is not owned by this runtime.
//! Values cross it as opaque `Arc<dyn Any>` handles and failures as
//! `GuestException`s. Unwinding through guest code is a plain `Result`:
//! every poll and every blocking call returns `GuestResult<T>`, so `?`
//! carries injected exceptions and kills out to the thread's entry point.

use core::any::Any;
use core::fmt;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::classes;

/// Opaque guest value
pub type Value = Arc<dyn Any + Send + Sync>;

/// Wrap a Rust value as a guest value
#[inline]
pub fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

/// Captured call stack, innermost frame first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    frames: Vec<String>,
}

impl Backtrace {
    pub fn new(frames: Vec<String>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "\t{}", frame)?;
        }
        Ok(())
    }
}

/// A guest-level exception
///
/// The backtrace slot is write-once. It is filled by whichever context raises
/// the exception first, so an exception injected into another thread records
/// that thread's stack, never the requester's.
pub struct GuestException {
    class: String,
    message: String,
    payload: Option<Value>,
    backtrace: OnceLock<Backtrace>,
}

impl GuestException {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            payload: None,
            backtrace: OnceLock::new(),
        }
    }

    /// Attach an arbitrary guest payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Exception recorded for a thread terminated by `kill`
    pub fn killed() -> Self {
        Self::new(classes::THREAD_KILLED, "thread killed")
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Downcast the payload to a concrete type
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Check if this records a kill rather than a raised failure
    pub fn is_kill(&self) -> bool {
        self.class == classes::THREAD_KILLED
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.get()
    }

    pub fn has_backtrace(&self) -> bool {
        self.backtrace.get().is_some()
    }

    /// Set the backtrace if none was captured yet
    ///
    /// Returns `false` if a backtrace was already present.
    pub fn set_backtrace(&self, backtrace: Backtrace) -> bool {
        self.backtrace.set(backtrace).is_ok()
    }
}

impl fmt::Debug for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestException")
            .field("class", &self.class)
            .field("message", &self.message)
            .field("has_payload", &self.payload.is_some())
            .field("has_backtrace", &self.has_backtrace())
            .finish()
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Why guest code is unwinding
#[derive(Debug, Clone, Error)]
pub enum Unwind {
    /// A guest exception is propagating
    #[error("raise {0}")]
    Raise(Arc<GuestException>),

    /// The thread was killed; unwinds to the thread's entry point
    #[error("kill")]
    Kill,
}

impl Unwind {
    /// Build a raise from a fresh exception
    pub fn raise(exc: GuestException) -> Self {
        Unwind::Raise(Arc::new(exc))
    }

    pub fn is_kill(&self) -> bool {
        matches!(self, Unwind::Kill)
    }

    /// The exception being raised, if this is not a kill
    pub fn exception(&self) -> Option<&Arc<GuestException>> {
        match self {
            Unwind::Raise(exc) => Some(exc),
            Unwind::Kill => None,
        }
    }
}

/// Result type of guest-visible operations
pub type GuestResult<T> = Result<T, Unwind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtrace_is_write_once() {
        let exc = GuestException::new("RuntimeError", "boom");
        assert!(!exc.has_backtrace());
        assert!(exc.set_backtrace(Backtrace::new(vec!["inner".into()])));
        assert!(!exc.set_backtrace(Backtrace::new(vec!["other".into()])));
        assert_eq!(exc.backtrace().unwrap().frames(), ["inner".to_string()]);
    }

    #[test]
    fn test_payload_downcast() {
        let exc = GuestException::new("RuntimeError", "boom").with_payload(value(42i64));
        assert_eq!(exc.payload_as::<i64>(), Some(&42));
        assert_eq!(exc.payload_as::<String>(), None);
    }

    #[test]
    fn test_killed_exception() {
        let exc = GuestException::killed();
        assert!(exc.is_kill());
        assert_eq!(exc.class(), classes::THREAD_KILLED);
        assert!(!GuestException::new("RuntimeError", "x").is_kill());
    }

    #[test]
    fn test_unwind_accessors() {
        let unwind = Unwind::raise(GuestException::new("IOError", "closed"));
        assert!(!unwind.is_kill());
        assert_eq!(unwind.exception().unwrap().class(), "IOError");
        assert!(Unwind::Kill.exception().is_none());
        assert_eq!(format!("{}", unwind), "raise IOError: closed");
    }

    #[test]
    fn test_unwind_boxes_as_std_error() {
        fn host() -> Result<(), Box<dyn std::error::Error>> {
            Err(Unwind::Kill)?;
            Ok(())
        }
        assert_eq!(host().unwrap_err().to_string(), "kill");
    }
}
