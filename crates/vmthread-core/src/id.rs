//! Identifier types
//!
//! Three id spaces exist: logical threads, fibers, and native execution
//! contexts (one per OS thread that ever ran guest code). Ids are allocated
//! from monotonically increasing counters and are never reused, so a stale id
//! can never alias a newer record.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal, $counter:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Sentinel value indicating "no id"
            pub const NONE: $name = $name(0);

            /// Allocate the next unused id
            #[inline]
            pub fn next() -> Self {
                $name($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Create an id from a raw value
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            /// Get the raw value
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Check if this is the NONE sentinel
            #[inline]
            pub const fn is_none(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, concat!(stringify!($name), "(NONE)"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, "none")
                } else {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::NONE
            }
        }
    };
}

define_id!(
    /// Identifier of a logical (guest-visible) thread
    ThreadId, "t", NEXT_THREAD_ID
);

define_id!(
    /// Identifier of a fiber
    FiberId, "f", NEXT_FIBER_ID
);

define_id!(
    /// Identifier of a native execution context
    ContextId, "c", NEXT_CONTEXT_ID
);
