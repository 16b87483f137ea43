//! Environment variable helpers
//!
//! Every tunable in fdmux reads an `FDMUX_*` variable with a compiled-in
//! fallback.
//!
//! ```ignore
//! use fdmux_core::env::{env_get, env_get_bool};
//!
//! let timeout_ms: u64 = env_get("FDMUX_SHUTDOWN_TIMEOUT_MS", 60_000);
//! let flush = env_get_bool("FDMUX_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as `T`, or `default` if unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Boolean variable. "1", "true", "yes", "on" (any case) are true; any other
/// value is false; unset yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
