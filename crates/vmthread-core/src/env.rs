//! Environment variable utilities
//!
//! Lenient getters fall back to the default on a missing or unparsable value.
//! `env_get_checked` is the strict variant used when a malformed override
//! should surface as a configuration error instead of being ignored.
//!
//! ```ignore
//! use vmthread_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let stack: usize = env_get("VMT_THREAD_STACK_SIZE", 2 * 1024 * 1024);
//! let abort = env_get_bool("VMT_ABORT_ON_EXCEPTION", false);
//! let slack = env_get_ms("VMT_JOIN_SLACK_MS", 5);
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::error::{VmError, VmResult};

/// Get an environment variable parsed as `T`, or `default`
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Get an environment variable parsed as `T`, or `None` if unset or malformed
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Strict variant: unset yields `default`, malformed yields a configuration error
pub fn env_get_checked<T: FromStr>(key: &str, default: T) -> VmResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| VmError::Configuration(format!("{}={:?} is not a valid value", key, raw))),
        Err(_) => Ok(default),
    }
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, other values false
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Millisecond duration
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names; tests run in parallel.

    #[test]
    fn test_unset_falls_back() {
        let stack: usize = env_get("__VMT_TEST_UNSET_A__", 4096);
        assert_eq!(stack, 4096);
        assert!(env_get_opt::<u32>("__VMT_TEST_UNSET_A__").is_none());
        assert!(!env_is_set("__VMT_TEST_UNSET_A__"));
        assert_eq!(env_get_str("__VMT_TEST_UNSET_A__", "vm"), "vm");
        assert_eq!(env_get_ms("__VMT_TEST_UNSET_A__", 7), Duration::from_millis(7));
    }

    #[test]
    fn test_parse_with_whitespace() {
        std::env::set_var("__VMT_TEST_NUM__", " 123 ");
        assert_eq!(env_get::<usize>("__VMT_TEST_NUM__", 0), 123);
        std::env::remove_var("__VMT_TEST_NUM__");
    }

    #[test]
    fn test_malformed_is_lenient_or_strict() {
        std::env::set_var("__VMT_TEST_BAD__", "lots");
        assert_eq!(env_get::<usize>("__VMT_TEST_BAD__", 9), 9);
        let err = env_get_checked::<usize>("__VMT_TEST_BAD__", 9).unwrap_err();
        assert!(err.is_configuration());
        std::env::remove_var("__VMT_TEST_BAD__");
        assert_eq!(env_get_checked::<usize>("__VMT_TEST_BAD__", 9).unwrap(), 9);
    }

    #[test]
    fn test_bool_variants() {
        for (raw, expected) in [("1", true), ("Yes", true), ("on", true), ("0", false), ("nah", false)] {
            std::env::set_var("__VMT_TEST_FLAG__", raw);
            assert_eq!(env_get_bool("__VMT_TEST_FLAG__", !expected), expected, "{}", raw);
        }
        std::env::remove_var("__VMT_TEST_FLAG__");
        assert!(env_get_bool("__VMT_TEST_FLAG__", true));
    }
}
