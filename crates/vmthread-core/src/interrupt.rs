//! Interrupt timing policy
//!
//! A thread's `InterruptMode` decides when asynchronous interrupts (an
//! injected raise, a kill) queued against it are allowed to take effect.
//!
//! | mode          | non-blocking region | blocking region |
//! |---------------|---------------------|-----------------|
//! | `Immediate`   | deliver             | deliver         |
//! | `OnBlocking`  | defer               | deliver         |
//! | `Never`       | defer               | defer           |
//!
//! Deferred interrupts stay pending and are re-evaluated whenever the mode
//! changes or the thread enters a blocking region.

use core::fmt;
use core::str::FromStr;

use crate::error::VmError;

/// When pending interrupts may be delivered to a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum InterruptMode {
    /// Deliver at the next safepoint poll
    #[default]
    Immediate = 0,

    /// Deliver only while blocked in an interruptible wait
    OnBlocking = 1,

    /// Never deliver while this mode is in effect
    Never = 2,
}

impl InterruptMode {
    /// Guest-visible timing symbol
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            InterruptMode::Immediate => "immediate",
            InterruptMode::OnBlocking => "on_blocking",
            InterruptMode::Never => "never",
        }
    }
}

impl From<u8> for InterruptMode {
    fn from(v: u8) -> Self {
        match v {
            1 => InterruptMode::OnBlocking,
            2 => InterruptMode::Never,
            _ => InterruptMode::Immediate,
        }
    }
}

impl FromStr for InterruptMode {
    type Err = VmError;

    /// Parse a timing symbol; any unknown symbol is a configuration error
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(':').unwrap_or(s) {
            "immediate" => Ok(InterruptMode::Immediate),
            "on_blocking" => Ok(InterruptMode::OnBlocking),
            "never" => Ok(InterruptMode::Never),
            other => Err(VmError::InvalidTiming(other.to_string())),
        }
    }
}

impl fmt::Display for InterruptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.as_symbol())
    }
}

/// Decide whether a pending interrupt is delivered now or deferred
#[inline]
pub const fn should_deliver(mode: InterruptMode, is_blocking_call: bool) -> bool {
    match mode {
        InterruptMode::Immediate => true,
        InterruptMode::OnBlocking => is_blocking_call,
        InterruptMode::Never => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_table() {
        assert!(should_deliver(InterruptMode::Immediate, false));
        assert!(should_deliver(InterruptMode::Immediate, true));
        assert!(!should_deliver(InterruptMode::OnBlocking, false));
        assert!(should_deliver(InterruptMode::OnBlocking, true));
        assert!(!should_deliver(InterruptMode::Never, false));
        assert!(!should_deliver(InterruptMode::Never, true));
    }

    #[test]
    fn test_parse_symbols() {
        assert_eq!("immediate".parse::<InterruptMode>().unwrap(), InterruptMode::Immediate);
        assert_eq!(":on_blocking".parse::<InterruptMode>().unwrap(), InterruptMode::OnBlocking);
        assert_eq!("never".parse::<InterruptMode>().unwrap(), InterruptMode::Never);
    }

    #[test]
    fn test_parse_invalid_symbol() {
        let err = "sometimes".parse::<InterruptMode>().unwrap_err();
        assert!(matches!(err, VmError::InvalidTiming(ref s) if s == "sometimes"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_display_roundtrip() {
        for mode in [InterruptMode::Immediate, InterruptMode::OnBlocking, InterruptMode::Never] {
            assert_eq!(mode.to_string().parse::<InterruptMode>().unwrap(), mode);
            assert_eq!(InterruptMode::from(mode as u8), mode);
        }
    }
}
