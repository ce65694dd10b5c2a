//! Bounded retry with backoff and jitter, shared by the lock manager and the
//! throttle-handling write paths.

use std::time::Duration;

use rand::{thread_rng, Rng};

#[derive(Clone, Copy, Debug)]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter: Duration::ZERO,
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

    /// Adds a uniform random delay in `[0, jitter]` on top of each computed
    /// backoff, so competing retriers do not wake in lockstep.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
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

    /// Backoff before attempt `attempt + 1`, where `attempt` counts completed
    /// tries. The cap applies before jitter, so the jitter window survives
    /// even once the exponential curve saturates.
    fn delay_for_attempt(&self, attempt: usize) -> Duration {
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
        bounded + self.random_jitter()
    }

    fn random_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let jitter_ms = self.jitter.as_millis() as u64;
        Duration::from_millis(thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Mutable retry state for one operation. Ask it for the next delay after
/// each failed try; `None` means the budget is spent.
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

    /// Like [`next_delay`](Self::next_delay), but an explicit backoff hint
    /// from the backing store overrides the computed delay. The attempt
    /// budget is consumed either way.
    pub fn next_delay_with_hint(&mut self, hint: Option<Duration>) -> Option<Duration> {
        let computed = self.next_delay()?;
        Some(match hint {
            Some(hinted) => hinted,
            None => computed,
        })
    }

    /// Completed (failed) tries so far, excluding the one about to run.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
