//! # strongbox-core
//!
//! Core types, configuration, and utilities for Strongbox.
//!
//! This crate provides shared functionality used across all Strongbox crates:
//!
//! - **Configuration**: Loading, validation, and environment overrides
//! - **Types**: Tenant, namespace and key identifiers, audit vocabulary
//! - **Errors**: The engine-wide error taxonomy
//! - **Utilities**: Logging setup, retry with backoff, clocks, ID generation

pub mod clock;
pub mod config;
pub mod env;
pub mod error;
pub mod id;
pub mod logging;
pub mod notify;
pub mod retry;
pub mod secret;
pub mod types;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use notify::{Notification, Notifier, NullNotifier};
pub use secret::{constant_time_eq, SecretBytes};
pub use types::*;
