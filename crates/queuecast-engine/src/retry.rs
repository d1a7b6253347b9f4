use std::fmt;
use std::thread;
use std::time::Duration;

/// Fixed-delay, bounded-attempt retry.
///
/// Attempts run sequentially on the calling thread. The delay is slept
/// between attempts and never after the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

/// The retry budget was spent; carries the error of the final attempt.
#[derive(Debug, thiserror::Error)]
#[error("all {attempts} attempts failed: {last}")]
pub struct UpstreamExhausted<E: fmt::Display + fmt::Debug> {
    pub attempts: usize,
    pub last: E,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn run<T, E, F>(&self, op: F) -> Result<T, UpstreamExhausted<E>>
    where
        E: fmt::Display + fmt::Debug,
        F: FnMut(usize) -> Result<T, E>,
    {
        self.run_observed(op, |_, _| {})
    }

    /// Like [`RetryPolicy::run`]; `on_retry(attempt, &err)` fires for every
    /// failure that will be retried.
    pub fn run_observed<T, E, F, O>(&self, op: F, on_retry: O) -> Result<T, UpstreamExhausted<E>>
    where
        E: fmt::Display + fmt::Debug,
        F: FnMut(usize) -> Result<T, E>,
        O: FnMut(usize, &E),
    {
        self.run_with(op, on_retry, thread::sleep)
    }

    pub fn run_with<T, E, F, O, S>(
        &self,
        mut op: F,
        mut on_retry: O,
        mut sleep: S,
    ) -> Result<T, UpstreamExhausted<E>>
    where
        E: fmt::Display + fmt::Debug,
        F: FnMut(usize) -> Result<T, E>,
        O: FnMut(usize, &E),
        S: FnMut(Duration),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => {
                    tracing::warn!(attempt, max_attempts, "final attempt failed: {err}");
                    return Err(UpstreamExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) => {
                    tracing::warn!(attempt, max_attempts, "attempt failed, retrying: {err}");
                    on_retry(attempt, &err);
                    sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}
