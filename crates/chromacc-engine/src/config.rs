//! Engine runtime configuration.
//!
//! Knobs come from environment variables with documented defaults, the
//! same surface the service has always exposed to operators.

use std::time::Duration;

use tracing::warn;

/// Per-item execution deadline, seconds. `CHROMACC_ITEM_TIMEOUT`.
const DEFAULT_ITEM_TIMEOUT_SECS: u64 = 300;

/// Bounded wait for an active batch to drain at shutdown, seconds.
/// `CHROMACC_DRAIN_TIMEOUT`.
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// How often the drain wait re-checks the batch state.
const DRAIN_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard deadline for one item's execution envelope.
    pub item_timeout: Duration,
    /// How long shutdown waits for an active batch before proceeding.
    pub drain_timeout: Duration,
    /// Poll interval used while waiting for a batch to drain.
    pub drain_poll_interval: Duration,
    /// Whether a GPU execution context is available. Probing real devices
    /// is a collaborator concern; operators set `CHROMACC_GPU=1` when one
    /// is present.
    pub has_gpu: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            item_timeout: Duration::from_secs(DEFAULT_ITEM_TIMEOUT_SECS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            drain_poll_interval: Duration::from_millis(DRAIN_POLL_INTERVAL_MS),
            has_gpu: false,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the process environment, falling back
    /// to defaults on missing or unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            item_timeout: env_secs("CHROMACC_ITEM_TIMEOUT").unwrap_or(defaults.item_timeout),
            drain_timeout: env_secs("CHROMACC_DRAIN_TIMEOUT").unwrap_or(defaults.drain_timeout),
            drain_poll_interval: defaults.drain_poll_interval,
            has_gpu: env_flag("CHROMACC_GPU"),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable duration in environment");
            None
        }
    }
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.item_timeout, Duration::from_secs(300));
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert!(!config.has_gpu);
    }
}
