use log::debug;
use rand::{Rng, thread_rng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::StorageError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

/// Retry schedule applied to every fallible storage call.
///
/// Only [`StorageError::Transient`] is retried; quota, availability and
/// corruption errors are returned on the first occurrence.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    pub fn none() -> Self {
        Self::new(RetryStrategy::Linear, 1, Duration::ZERO)
    }

    pub fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.max(0.0);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    /// Run `op`, sleeping on `clock` between attempts while it fails transiently.
    pub fn run<T>(
        &self,
        clock: &dyn Clock,
        what: &str,
        mut op: impl FnMut() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut handle = self.handle();
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => match handle.next_delay() {
                    Some(delay) => {
                        debug!(
                            "retrying {what} after {}ms (attempt {}): {err}",
                            delay.as_millis(),
                            handle.attempts()
                        );
                        clock.sleep(delay);
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let raw = match self.strategy {
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt as u32),
            RetryStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(31);
                let factor = 1u128 << shift;
                let scaled = self.base_delay.as_millis().saturating_mul(factor);
                Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64)
            }
        };
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        jittered(bounded, self.jitter_fraction)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential(4, Duration::from_millis(50))
            .with_max_delay(Duration::from_secs(2))
            .with_jitter(0.2)
    }
}

/// Spread `delay` uniformly over `[1 - fraction, 1 + fraction]`.
pub fn jittered(delay: Duration, fraction: f64) -> Duration {
    if delay.is_zero() || fraction <= 0.0 {
        return delay;
    }
    let jitter = fraction.min(1.0);
    let factor = thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    let millis = (delay.as_millis() as f64 * factor).round().max(0.0);
    Duration::from_millis(millis.min(u64::MAX as f64) as u64)
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(self.attempts))
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
