//! Environment variable parsing utilities.
//!
//! Typed helpers for reading configuration overrides from the environment
//! without repeating `std::env::var(..).ok().and_then(..)` chains.
//!
//! # Example
//!
//! ```
//! use replay_types::env_utils::{env_bool_or, env_var_or};
//!
//! let workers: usize = env_var_or("REPLAY_WORKERS", 4);
//! let progress = env_bool_or("REPLAY_TRACK_PROGRESS", false);
//! ```

use std::path::PathBuf;
use std::str::FromStr;

/// Parse an environment variable into a type that implements `FromStr`.
///
/// Returns `None` if the variable is not set or cannot be parsed.
pub fn env_var<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse an environment variable with a default value.
pub fn env_var_or<T: FromStr>(key: &str, default: T) -> T {
    env_var(key).unwrap_or(default)
}

/// Interpret an environment variable as a boolean.
///
/// "1", "true", "yes" and "on" are truthy, "0", "false", "no" and "off" are
/// falsy (case-insensitive). Anything else, or an unset variable, is `None`.
pub fn env_bool(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Interpret an environment variable as a boolean, with a default.
pub fn env_bool_or(key: &str, default: bool) -> bool {
    env_bool(key).unwrap_or(default)
}

/// Read a non-empty path from the environment.
pub fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
