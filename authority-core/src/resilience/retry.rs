//! Retry policy for transient, side-effect-safe calls (spec §4.B, §7): 3
//! attempts with 100/200/400 ms exponential backoff and ±25% jitter. Only
//! reads and idempotency-proven writes are ever wrapped in this; the
//! authority engine decides what is safe to retry, this module just
//! executes the schedule.

use std::time::Duration;

use rand::Rng;

/// A fixed backoff schedule. `delays` holds the wait *before* each retry
/// attempt (i.e. `delays.len()` is one less than the total attempt count).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    jitter_fraction: f64,
}

impl Default for RetryPolicy {
    /// 3 attempts total, 100/200/400 ms base backoff, ±25% jitter (spec §4.B, §7).
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ],
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Total number of attempts this policy will make (first try + retries).
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    fn jittered_delay(&self, attempt: usize) -> Duration {
        let base = self.delays[attempt];
        let jitter = base.as_secs_f64() * self.jitter_fraction;
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

/// Run `op` up to `policy.max_attempts()` times, sleeping the jittered
/// backoff between attempts. `is_retryable` distinguishes transient errors
/// (retried) from permanent ones (returned immediately, spec §4.B).
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut is_retryable: impl FnMut(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = is_retryable(&err);
                if !retryable || attempt >= policy.delays.len() {
                    return Err(err);
                }
                let delay = policy.jittered_delay(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
