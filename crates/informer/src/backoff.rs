//! Capped exponential backoff for list/watch retries.

use std::time::Duration;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(cfg: &BackoffConfig) -> Self {
        let max = cfg.max().max(cfg.initial());
        Self { initial: cfg.initial(), factor: cfg.factor.max(1.0), max, current: cfg.initial() }
    }

    /// Current delay; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = (self.current.as_secs_f64() * self.factor).min(self.max.as_secs_f64());
        self.current = Duration::try_from_secs_f64(next).unwrap_or(self.max);
        delay
    }

    /// Back to the initial delay after a success.
    pub fn reset(&mut self) { self.current = self.initial; }
}
