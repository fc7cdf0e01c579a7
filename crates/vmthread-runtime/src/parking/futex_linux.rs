//! Linux futex-based context parking
//!
//! Futex word semantics:
//! - 0 = no token
//! - 1 = token deposited by `unpark`
//!
//! Only the owning context ever parks on its word, so a single
//! FUTEX_WAKE of one waiter is always enough.

use super::ContextParking;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Linux futex-based parking
pub struct FutexParking {
    /// Futex word: 0 = empty, 1 = token
    futex: AtomicU32,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
        }
    }

    fn futex_wait(&self, timeout: Option<Duration>) {
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });

        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // FUTEX_WAIT: sleep only while the word is still 0. ETIMEDOUT,
        // EAGAIN and EINTR all just mean "re-check the word".
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextParking for FutexParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        if self.futex.swap(0, Ordering::Acquire) == 1 {
            return true;
        }
        self.futex_wait(timeout);
        self.futex.swap(0, Ordering::Acquire) == 1
    }

    fn unpark(&self) {
        if self.futex.swap(1, Ordering::Release) == 1 {
            // Token already present; the owner has not parked on it yet
            return;
        }
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}
