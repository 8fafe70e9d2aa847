/*!
# Retry Module

This module defines retry policies for failed fetch tasks in LeadFlow.

Retry policies determine:
- How many times a failed operation is attempted
- How long to wait before the next retry attempt
- The backoff strategy used to space attempts out
- Whether random jitter is applied to avoid retry storms

The module includes:
- The `BackoffStrategy` enum with fixed, linear, exponential, Fibonacci and
  custom delay sequences
- The `RetryPolicy` struct combining a strategy with attempt and delay limits
- Deterministic delay computation against an injected random source, so
  jittered schedules can be tested with a seeded RNG
*/

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LeadFlowError, Result};

/// Backoff strategy used to space retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay grows by a configurable factor after each attempt
    Exponential,
    /// Delay follows the Fibonacci sequence scaled by the base delay
    Fibonacci,
    /// Delays taken from an explicit sequence, clamped to its last entry
    Custom,
}

/// Retry policy for failed fetch tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one. Must be >= 1.
    pub max_attempts: u32,

    /// Strategy used to compute the delay before each retry
    pub strategy: BackoffStrategy,

    /// Base delay the strategy scales from
    pub base_delay: Duration,

    /// Upper bound applied to every computed delay
    pub max_delay: Duration,

    /// Growth factor for the exponential strategy
    pub backoff_factor: f64,

    /// Whether to add random jitter to computed delays
    pub jitter: bool,

    /// Jitter spread as a fraction of the delay, in `[0, 1]`
    pub jitter_range: f64,

    /// Explicit delay sequence for the custom strategy
    pub custom_delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter: false,
            jitter_range: 0.1,
            custom_delays: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Create a fixed-delay policy
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            ..Default::default()
        }
    }

    /// Create a linear backoff policy
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Linear,
            base_delay,
            ..Default::default()
        }
    }

    /// Create an exponential backoff policy
    pub fn exponential(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Exponential,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Create a Fibonacci backoff policy
    pub fn fibonacci(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Fibonacci,
            base_delay,
            ..Default::default()
        }
    }

    /// Create a policy using an explicit delay sequence.
    ///
    /// Fails with a configuration error if the sequence is empty.
    pub fn custom(max_attempts: u32, delays: Vec<Duration>) -> Result<Self> {
        let policy = Self {
            max_attempts,
            strategy: BackoffStrategy::Custom,
            custom_delays: delays,
            ..Default::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Enable jitter with the given spread fraction
    pub fn with_jitter(mut self, jitter_range: f64) -> Self {
        self.jitter = true;
        self.jitter_range = jitter_range;
        self
    }

    /// Cap every computed delay at the given duration
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Check the policy invariants, failing fast on misconfiguration
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(LeadFlowError::Config(
                "retry policy requires max_attempts >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_range) {
            return Err(LeadFlowError::Config(format!(
                "jitter_range must be in [0, 1], got {}",
                self.jitter_range
            )));
        }
        if self.strategy == BackoffStrategy::Custom && self.custom_delays.is_empty() {
            return Err(LeadFlowError::Config(
                "custom retry strategy requires at least one delay".into(),
            ));
        }
        Ok(())
    }

    /// Compute the delay before the retry following `attempt` (1-based),
    /// sampling jitter from the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Compute the delay using an injected random source.
    ///
    /// Deterministic for a seeded RNG, which is what the tests rely on.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let attempt = attempt.max(1);

        let base = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self
                .base_delay
                .checked_mul(attempt)
                .unwrap_or(self.max_delay),
            BackoffStrategy::Exponential => {
                let scaled = self.base_delay.as_secs_f64()
                    * self.backoff_factor.powi(attempt as i32 - 1);
                if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
                    Duration::from_secs_f64(scaled.max(0.0))
                } else {
                    self.max_delay
                }
            }
            BackoffStrategy::Fibonacci => self
                .base_delay
                .checked_mul(fibonacci(attempt))
                .unwrap_or(self.max_delay),
            BackoffStrategy::Custom => {
                let last = self.custom_delays.len().saturating_sub(1);
                let idx = ((attempt - 1) as usize).min(last);
                self.custom_delays.get(idx).copied().unwrap_or(self.base_delay)
            }
        };

        let capped = base.min(self.max_delay);

        if self.jitter && self.jitter_range > 0.0 && !capped.is_zero() {
            let spread = capped.as_secs_f64() * self.jitter_range;
            let offset = rng.gen_range(-spread..=spread);
            Duration::from_secs_f64((capped.as_secs_f64() + offset).max(0.0))
        } else {
            capped
        }
    }
}

/// Fibonacci with fib(1) = fib(2) = 1, saturating for large attempt numbers
fn fibonacci(n: u32) -> u32 {
    if n <= 2 {
        return 1;
    }
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
        if b == u32::MAX {
            break;
        }
    }
    b
}
