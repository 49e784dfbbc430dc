//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::env;

/// Default filter when neither `STRONGBOX_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "strongbox=info";

/// Resolve the filter directive: `STRONGBOX_LOG`, then `RUST_LOG`, then the
/// configured level, then [`DEFAULT_FILTER`].
pub fn filter_directive(config: &LoggingConfig) -> String {
    env::get_var(&env::var("LOG"))
        .or_else(|| env::get_var("RUST_LOG"))
        .or_else(|| config.level.clone())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Install the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed (e.g. by the host
/// application), in which case the existing one is left alone.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(filter_directive(config))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok()
    }
}
