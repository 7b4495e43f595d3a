//! Bounded retry policy shared by every component that talks to the network
//! or races on the state store.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Exponential backoff with a cap and a bounded number of attempts
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Random extra delay as a fraction of the computed delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryPolicy {
    /// Venue calls: a handful of attempts spread over a few seconds
    pub fn network() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Store compare-and-set: many quick attempts
    pub fn store() -> Self {
        Self {
            max_attempts: 16,
            base_delay_ms: 1,
            max_delay_ms: 50,
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Journal delivery
    pub fn journal() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// No waiting at all, used by tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based: the wait after the first failure is `delay_for(1)`)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        let jitter = if self.jitter > 0.0 && capped > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0)) * capped
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).round() as u64)
    }

    /// True when another attempt is allowed after `attempt` attempts have failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_attempts == 0 {
            errors.push(format!("{name}.max_attempts must be >= 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            errors.push(format!("{name}.max_delay_ms must be >= base_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            errors.push(format!("{name}.jitter must be in [0, 1]"));
        }
        errors
    }
}
