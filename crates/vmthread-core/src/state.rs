//! Thread status and priority types

use core::fmt;

/// Status of a logical thread
///
/// Lifecycle: `Run -> (Sleep <-> Run) -> Dead`, with `Aborting` entered while
/// a thread unwinds a `kill`. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Executing guest code (or runnable)
    Run = 0,

    /// Blocked in a sleep or another interruptible wait
    Sleep = 1,

    /// Unwinding after a kill request, not yet dead
    Aborting = 2,

    /// Terminated; result or exception is final
    Dead = 3,
}

impl ThreadStatus {
    /// Check if the thread has not yet terminated
    #[inline]
    pub const fn is_alive(&self) -> bool {
        !matches!(self, ThreadStatus::Dead)
    }

    /// Check if the thread is stopped (dead or sleeping)
    #[inline]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, ThreadStatus::Dead | ThreadStatus::Sleep)
    }

    /// Lower-case name as reported to guest code
    pub const fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Run => "run",
            ThreadStatus::Sleep => "sleep",
            ThreadStatus::Aborting => "aborting",
            ThreadStatus::Dead => "dead",
        }
    }
}

impl From<u8> for ThreadStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ThreadStatus::Run,
            1 => ThreadStatus::Sleep,
            2 => ThreadStatus::Aborting,
            _ => ThreadStatus::Dead,
        }
    }
}

impl From<ThreadStatus> for u8 {
    fn from(status: ThreadStatus) -> u8 {
        status as u8
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level for threads
///
/// Purely administrative: recorded and reported, never used for scheduling
/// decisions inside the runtime (native threads are scheduled by the OS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    /// Number of priority levels
    pub const COUNT: usize = 4;

    /// Get priority from index (0 = Critical, 3 = Low)
    #[inline]
    pub const fn from_index(idx: usize) -> Option<Priority> {
        match idx {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            _ => None,
        }
    }

    /// Map a guest integer priority (-3..=3, higher is more urgent) onto a level
    pub fn from_guest(level: i32) -> Priority {
        match level {
            i32::MIN..=-2 => Priority::Low,
            -1..=0 => Priority::Normal,
            1..=2 => Priority::High,
            _ => Priority::Critical,
        }
    }

    /// Guest integer representation of this level
    pub const fn to_guest(self) -> i32 {
        match self {
            Priority::Critical => 3,
            Priority::High => 1,
            Priority::Normal => 0,
            Priority::Low => -3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl From<u8> for Priority {
    fn from(v: u8) -> Self {
        Priority::from_index(v as usize).unwrap_or(Priority::Normal)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "CRITICAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(ThreadStatus::Run.is_alive());
        assert!(ThreadStatus::Sleep.is_alive());
        assert!(ThreadStatus::Aborting.is_alive());
        assert!(!ThreadStatus::Dead.is_alive());

        assert!(ThreadStatus::Sleep.is_stopped());
        assert!(ThreadStatus::Dead.is_stopped());
        assert!(!ThreadStatus::Run.is_stopped());
    }

    #[test]
    fn test_status_u8_conversion() {
        for status in [
            ThreadStatus::Run,
            ThreadStatus::Sleep,
            ThreadStatus::Aborting,
            ThreadStatus::Dead,
        ] {
            assert_eq!(ThreadStatus::from(u8::from(status)), status);
        }
        assert_eq!(ThreadStatus::from(200), ThreadStatus::Dead);
    }

    #[test]
    fn test_priority_guest_mapping() {
        assert_eq!(Priority::from_guest(0), Priority::Normal);
        assert_eq!(Priority::from_guest(-3), Priority::Low);
        assert_eq!(Priority::from_guest(2), Priority::High);
        assert_eq!(Priority::from_guest(99), Priority::Critical);
        assert_eq!(Priority::from_guest(Priority::High.to_guest()), Priority::High);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::from(7u8), Priority::Normal);
    }
}
