//! Environment-driven runtime configuration.

use std::time::Duration;

use tracing::warn;

use crate::error::{Result, RuntimeError};

/// Environment variable naming the control-plane endpoint.
pub const ENV_RUNTIME_API: &str = "NIMBUS_RUNTIME_API";

/// Environment variable overriding the deadline buffer, in milliseconds.
pub const ENV_DEADLINE_BUFFER_MS: &str = "NIMBUS_DEADLINE_BUFFER_MS";

/// Environment variable overriding the shutdown deadline, in milliseconds.
pub const ENV_SHUTDOWN_DEADLINE_MS: &str = "NIMBUS_SHUTDOWN_DEADLINE_MS";

const DEFAULT_DEADLINE_BUFFER_MS: u64 = 500;
const DEFAULT_SHUTDOWN_DEADLINE_MS: u64 = 2_000;

/// Settings for one runtime host.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Control-plane endpoint, e.g. `http://127.0.0.1:9001`.
    pub endpoint: String,
    /// Safety margin subtracted from every invocation deadline when
    /// deriving its cancellation token.
    pub deadline_buffer: Duration,
    /// How long shutdown hooks are given before being abandoned.
    pub shutdown_deadline: Duration,
}

impl RuntimeConfig {
    /// Config for an explicit endpoint with default durations.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: normalize_endpoint(endpoint.into()),
            deadline_buffer: Duration::from_millis(DEFAULT_DEADLINE_BUFFER_MS),
            shutdown_deadline: Duration::from_millis(DEFAULT_SHUTDOWN_DEADLINE_MS),
        }
    }

    /// Override the deadline buffer.
    pub fn with_deadline_buffer(mut self, buffer: Duration) -> Self {
        self.deadline_buffer = buffer;
        self
    }

    /// Override the shutdown deadline.
    pub fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    /// Load from the environment. `NIMBUS_RUNTIME_API` is required;
    /// malformed duration overrides fall back to their defaults with a
    /// warning rather than failing startup.
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var(ENV_RUNTIME_API).map_err(|_| {
            RuntimeError::InvalidState(format!("{ENV_RUNTIME_API} is not set"))
        })?;
        Ok(Self {
            endpoint: normalize_endpoint(endpoint),
            deadline_buffer: env_millis(ENV_DEADLINE_BUFFER_MS, DEFAULT_DEADLINE_BUFFER_MS),
            shutdown_deadline: env_millis(ENV_SHUTDOWN_DEADLINE_MS, DEFAULT_SHUTDOWN_DEADLINE_MS),
        })
    }
}

/// The control plane is conventionally advertised as `host:port`;
/// accept that form as well as a full URL.
fn normalize_endpoint(endpoint: String) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(key, value = %raw, default_ms, "ignoring malformed duration override");
                Duration::from_millis(default_ms)
            }
        },
        Err(_) => Duration::from_millis(default_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_port_gains_a_scheme() {
        assert_eq!(
            normalize_endpoint("127.0.0.1:9001".into()),
            "http://127.0.0.1:9001"
        );
    }

    #[test]
    fn full_urls_keep_their_scheme_and_lose_trailing_slashes() {
        assert_eq!(
            normalize_endpoint("https://plane.internal/".into()),
            "https://plane.internal"
        );
    }

    #[test]
    fn unset_duration_overrides_use_defaults() {
        let config = RuntimeConfig::new("127.0.0.1:9001");
        assert_eq!(config.deadline_buffer, Duration::from_millis(500));
        assert_eq!(config.shutdown_deadline, Duration::from_millis(2_000));
    }
}
