//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// Quieter defaults for the HTTP layers; override via `RUST_LOG`. Safe
/// to call more than once: later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
