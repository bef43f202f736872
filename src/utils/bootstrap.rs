//! Bootstrap utilities for embedding applications.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the `CAISSON_LOG` environment variable.
///
/// Defaults to "info" level if `CAISSON_LOG` is not set. Call once at
/// process startup; a second call panics because a global subscriber is
/// already installed.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
