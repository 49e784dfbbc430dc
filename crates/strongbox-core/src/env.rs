//! Environment variable handling.

use std::env;

/// Prefix for every Strongbox environment variable.
pub const PREFIX: &str = "STRONGBOX_";

/// Get an environment variable, returning None if not set or empty.
pub fn get_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Get an environment variable with a default value.
pub fn get_var_or(name: &str, default: &str) -> String {
    get_var(name).unwrap_or_else(|| default.to_string())
}

/// Get an environment variable as a boolean.
pub fn get_bool(name: &str) -> Option<bool> {
    get_var(name).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Get an environment variable as a u64.
pub fn get_u64(name: &str) -> Option<u64> {
    get_var(name).and_then(|v| v.parse().ok())
}

/// Get an environment variable as a usize.
pub fn get_usize(name: &str) -> Option<usize> {
    get_var(name).and_then(|v| v.parse().ok())
}

/// Get an environment variable as an f64.
pub fn get_f64(name: &str) -> Option<f64> {
    get_var(name).and_then(|v| v.parse().ok())
}

/// Build a prefixed variable name: `var("LOG")` -> `STRONGBOX_LOG`.
pub fn var(suffix: &str) -> String {
    format!("{PREFIX}{suffix}")
}
