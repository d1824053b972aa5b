//! Bounded retry with pluggable backoff.
//!
//! Backoff strategies own their random source, so a seeded strategy yields
//! the same delays on every run.

use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Upper bound on the exponent so delays stay within a few minutes.
const MAX_EXPONENT: u32 = 8;

/// Decides how long to wait before the given attempt.
pub trait Backoff: Send {
    fn delay(&mut self, attempt: u32) -> Duration;
}

/// Retries immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn delay(&mut self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// `2^attempt` seconds, shifted by up to a third in either direction.
#[derive(Debug, Clone)]
pub struct ExponentialJitter {
    rng: StdRng,
}

impl ExponentialJitter {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_os_rng())
    }
}

impl Backoff for ExponentialJitter {
    fn delay(&mut self, attempt: u32) -> Duration {
        let base_ms = 1000u64 << attempt.min(MAX_EXPONENT);
        let max_jitter = base_ms / 3;
        let jitter = self.rng.random_range(0..=max_jitter);
        let ms = if self.rng.random_bool(0.5) {
            base_ms + jitter
        } else {
            base_ms - jitter
        };
        // A zero delay would collapse into a tight loop.
        Duration::from_millis(ms.max(1))
    }
}

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Box<dyn Backoff>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Box::new(NoBackoff),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Box<dyn Backoff>) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    fn attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            DEFAULT_MAX_ATTEMPTS
        } else {
            self.max_attempts
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("exceeded retry limit after {attempts} attempts: {source:#}")]
    Exhausted {
        attempts: u32,
        source: anyhow::Error,
    },
}

/// Call `op` with the 1-based attempt number until it succeeds or the
/// policy's attempts are used up.
pub async fn retry<T, F, Fut>(mut policy: RetryPolicy, mut op: F) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: e,
                })
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.backoff.delay(attempt);
                warn!(attempt, max_attempts, ?delay, error = %e, "retrying after failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
