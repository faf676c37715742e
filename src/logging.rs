//! Tracing subscriber setup for the `zapboard` binary.
//!
//! `RUST_LOG` wins when set. Otherwise the filter is built from the verbose
//! flag. `ZAPBOARD_LOG_JSON=1` switches to one JSON object per line.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_JSON_ENV: &str = "ZAPBOARD_LOG_JSON";

pub fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "zapboard=debug"
    } else {
        "zapboard=info"
    }
}

fn env_bool(value: Option<String>) -> bool {
    matches!(
        value.as_deref(),
        Some("1" | "true" | "TRUE" | "yes" | "YES")
    )
}

/// Install the global subscriber. Calling it twice is a no-op.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    let result = if env_bool(std::env::var(LOG_JSON_ENV).ok()) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}
