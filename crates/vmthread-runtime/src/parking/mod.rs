//! Per-context parking
//!
//! Every native execution context owns exactly one `Parker`. All blocking
//! waits in the runtime (latches, sleeps, fiber hand-off, waiting for a
//! safepoint action to complete) park the waiting context on its own parker,
//! so the safepoint coordinator can cut any of them short with a single
//! `interrupt()`.
//!
//! The parker follows token semantics: `unpark` deposits a token and `park`
//! consumes it, returning immediately if one is already present. Spurious
//! returns are allowed; callers always re-check their condition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Platform-specific single-waiter park/unpark primitive
pub trait ContextParking: Send + Sync {
    /// Block until a token is available or `timeout` elapses
    ///
    /// Returns:
    /// - `true` if a token was consumed
    /// - `false` on timeout or spurious wakeup
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Deposit a token, waking the parked waiter if any
    fn unpark(&self);
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

/// Result of an interruptible wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition became true
    Ready,
    /// The deadline passed first
    TimedOut,
    /// The coordinator interrupted the wait
    Interrupted,
}

/// A context's parker plus its coordinator interrupt flag
pub struct Parker {
    inner: PlatformParking,
    interrupted: AtomicBool,
}

impl Parker {
    pub fn new() -> Self {
        Self {
            inner: PlatformParking::new(),
            interrupted: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn park(&self, timeout: Option<Duration>) -> bool {
        self.inner.park(timeout)
    }

    #[inline]
    pub fn unpark(&self) {
        self.inner.unpark();
    }

    /// Flag an interrupt and wake the owner if it is parked
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.inner.unpark();
    }

    /// Consume a pending interrupt
    #[inline]
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Park until `ready()` holds, the deadline passes, or an interrupt arrives
    ///
    /// The condition is checked first, so a satisfied condition wins over a
    /// simultaneous interrupt; the interrupt then stays pending for the next
    /// wait.
    pub fn wait_until<F>(&self, deadline: Option<Instant>, mut ready: F) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        loop {
            if ready() {
                return WaitOutcome::Ready;
            }
            if self.take_interrupt() {
                return WaitOutcome::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return if ready() { WaitOutcome::Ready } else { WaitOutcome::TimedOut };
                    }
                    self.inner.park(Some(deadline - now));
                }
                None => {
                    self.inner.park(None);
                }
            }
        }
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Parker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parker")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_park_timeout() {
        let parker = Parker::new();
        let start = Instant::now();
        let woken = parker.park(Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_token_before_park() {
        let parker = Parker::new();
        parker.unpark();
        let start = Instant::now();
        assert!(parker.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_unpark_wakes_waiter() {
        let parker = Arc::new(Parker::new());
        let parker2 = Arc::clone(&parker);

        let handle = thread::spawn(move || {
            let start = Instant::now();
            while !parker2.park(Some(Duration::from_secs(10))) {}
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        parker.unpark();

        let waited = handle.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_until_interrupted() {
        let parker = Arc::new(Parker::new());
        let parker2 = Arc::clone(&parker);

        let handle = thread::spawn(move || parker2.wait_until(None, || false));

        thread::sleep(Duration::from_millis(30));
        parker.interrupt();

        assert_eq!(handle.join().unwrap(), WaitOutcome::Interrupted);
        assert!(!parker.is_interrupted());
    }

    #[test]
    fn test_wait_until_deadline() {
        let parker = Parker::new();
        let deadline = Instant::now() + Duration::from_millis(30);
        assert_eq!(parker.wait_until(Some(deadline), || false), WaitOutcome::TimedOut);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_ready_wins_over_interrupt() {
        let parker = Parker::new();
        parker.interrupt();
        assert_eq!(parker.wait_until(None, || true), WaitOutcome::Ready);
        assert!(parker.take_interrupt());
    }
}
