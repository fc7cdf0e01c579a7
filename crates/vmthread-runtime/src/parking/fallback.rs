//! Fallback parking using a mutex and condvar
//!
//! Used on platforms without futex support.

use super::ContextParking;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Condvar-based parking (fallback)
pub struct FallbackParking {
    /// true = token deposited
    token: Mutex<bool>,
    condvar: Condvar,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextParking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut token = self.token.lock();
        if !*token {
            match timeout {
                Some(t) => {
                    self.condvar.wait_for(&mut token, t);
                }
                None => self.condvar.wait(&mut token),
            }
        }
        std::mem::replace(&mut *token, false)
    }

    fn unpark(&self) {
        let mut token = self.token.lock();
        *token = true;
        self.condvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_consumed_once() {
        let p = FallbackParking::new();
        p.unpark();
        assert!(p.park(Some(Duration::from_millis(1))));
        assert!(!p.park(Some(Duration::from_millis(10))));
    }
}
