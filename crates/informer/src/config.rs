//! Informer configuration: defaults, environment overlay, serde shape.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InformerConfig {
    /// Period of Sync re-delivery; 0 disables resync.
    pub resync_secs: u64,
    /// Maximum number of pending identities in the delta queue.
    pub queue_capacity: usize,
    /// Notifications buffered per handler before fan-out waits for it.
    pub listener_buffer: usize,
    pub backoff: BackoffConfig,
}

/// Retry policy for list and watch failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub factor: f64,
    pub max_secs: u64,
    /// Consecutive failures before health reports Degraded; `None` never degrades.
    pub degraded_after: Option<u32>,
}

impl Default for InformerConfig {
    fn default() -> Self { Self { resync_secs: 30, queue_capacity: 2048, listener_buffer: 1024, backoff: BackoffConfig::default() } }
}

impl Default for BackoffConfig {
    fn default() -> Self { Self { initial_ms: 800, factor: 2.0, max_secs: 30, degraded_after: Some(5) } }
}

const MAX_BACKOFF_SECS: u64 = 86_400;

fn env_parse<T: FromStr>(name: &str) -> Option<T> { std::env::var(name).ok().and_then(|s| s.trim().parse().ok()) }

impl InformerConfig {
    /// Defaults overlaid with `TETHER_*` environment variables.
    pub fn from_env() -> Self { Self::default().with_env() }

    /// Overlay `TETHER_*` environment variables; unparsable values are ignored.
    pub fn with_env(mut self) -> Self {
        if let Some(v) = env_parse("TETHER_RESYNC_SECS") { self.resync_secs = v; }
        if let Some(v) = env_parse("TETHER_QUEUE_CAP") { self.queue_capacity = v; }
        if let Some(v) = env_parse("TETHER_LISTENER_BUFFER") { self.listener_buffer = v; }
        if let Some(v) = env_parse("TETHER_BACKOFF_INITIAL_MS") { self.backoff.initial_ms = v; }
        if let Some(v) = env_parse("TETHER_BACKOFF_FACTOR") { self.backoff.factor = v; }
        if let Some(v) = env_parse("TETHER_BACKOFF_MAX_SECS") { self.backoff.max_secs = v; }
        if let Some(v) = env_parse::<u32>("TETHER_DEGRADED_AFTER") {
            self.backoff.degraded_after = (v > 0).then_some(v);
        }
        self
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration { Duration::from_millis(self.initial_ms) }
    /// Retry cap, limited to one day.
    pub fn max(&self) -> Duration { Duration::from_secs(self.max_secs.min(MAX_BACKOFF_SECS)) }
}
