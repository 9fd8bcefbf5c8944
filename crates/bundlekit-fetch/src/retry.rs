use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use bundlekit_core::{NetworkConfig, UpdateError};
use rand::Rng;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub deadline: Duration,
}

impl RetryPolicy {
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self {
            max_attempts: network.max_attempts.max(1),
            initial_backoff: Duration::from_millis(network.initial_backoff_ms),
            max_backoff: Duration::from_millis(network.max_backoff_ms),
            deadline: Duration::from_secs(network.deadline_secs),
        }
    }

    pub fn single() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            deadline: Duration::MAX,
        }
    }

    pub fn backoff_cap(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = self.backoff_cap(attempt);
        let half = cap / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts or deadline run out.
pub fn run_with_retry<T, F>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let started = Instant::now();
    let mut attempt = 1;
    loop {
        let err = match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_transient(&err) || attempt >= policy.max_attempts {
            return Err(err);
        }
        let delay = policy.backoff(attempt);
        if started.elapsed().saturating_add(delay) >= policy.deadline {
            warn!(label, attempt, "retry deadline reached");
            return Err(err);
        }

        warn!(
            label,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %format!("{err:#}"),
            "transient failure; retrying"
        );
        thread::sleep(delay);
        attempt += 1;
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<UpdateError>())
        .is_some_and(UpdateError::is_transient)
}
