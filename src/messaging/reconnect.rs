// Bounded exponential backoff for connection attempts

use std::time::Duration;

use crate::config::ClientConfig;

/// How many attempts a session of trying gets, and how long to wait between them
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_connect_attempts,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based): none for the first, then
    /// `base * 2^(attempt-2)` capped at `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Attempt counter for the current session of trying
#[derive(Debug, Default, Clone)]
pub struct ReconnectState {
    attempts: u32,
}

impl ReconnectState {
    /// Claim the next attempt, returning its number and the delay to wait
    /// first. `None` once the policy's attempts are used up.
    pub fn next_attempt(&mut self, policy: &ReconnectPolicy) -> Option<(u32, Duration)> {
        if self.attempts >= policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some((self.attempts, policy.delay_before(self.attempts)))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
