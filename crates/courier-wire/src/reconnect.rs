//! Reconnect backoff for dropped host links.
//!
//! The delay starts at `delay` and is multiplied by `decay` after every
//! failed attempt. Retrying stops once the next attempt would start after
//! `timeout` has elapsed since the link dropped.

use courier_types::HostConfig;
use std::time::Duration;

/// Backoff parameters for one reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub delay: Duration,
    /// Growth factor per failed attempt. Values below 1.0 are treated as 1.0.
    pub decay: f64,
    /// Overall budget measured from the moment the link dropped.
    pub timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&HostConfig::default())
    }
}

impl From<&HostConfig> for ReconnectPolicy {
    fn from(config: &HostConfig) -> Self {
        Self {
            delay: config.reconnect_delay,
            decay: config.reconnect_decay,
            timeout: config.reconnect_timeout,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (0-indexed).
    ///
    /// Formula: `delay * max(decay, 1)^attempt`, saturating at the overall
    /// timeout so the value stays representable.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.decay.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = (self.delay.as_millis() as f64) * factor;
        let cap = self.timeout.as_millis().max(self.delay.as_millis()) as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }

    /// Whether an attempt scheduled `delay` from now still fits the budget,
    /// given that `elapsed` has passed since the link dropped.
    pub fn allows(&self, elapsed: Duration, delay: Duration) -> bool {
        elapsed.saturating_add(delay) <= self.timeout
    }

    /// The delays this policy will wait before each attempt, in order,
    /// assuming attempts themselves take no time.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut out = Vec::new();
        let mut elapsed = Duration::ZERO;
        let mut attempt = 0;
        loop {
            let delay = self.delay_for(attempt);
            if !self.allows(elapsed, delay) || (delay.is_zero() && attempt > 0) {
                break;
            }
            elapsed += delay;
            out.push(delay);
            attempt += 1;
        }
        out
    }
}
