//! Retry with capped exponential backoff, used where a failure is transient and
//! the caller can afford to wait (model hot reload), never on the request path.

use rand::{thread_rng, Rng};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(2), jitter: 0.2 }
    }
}

impl RetryConfig {
    pub fn with_retries(max_retries: usize) -> Self { Self { max_retries, ..Self::default() } }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(30) as i32));
        let capped = exp.min(self.max_delay);
        if self.jitter <= 0.0 { return capped; }
        let spread = capped.as_millis() as f64 * self.jitter.min(1.0);
        let offset = thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((capped.as_millis() as f64 + offset).max(0.0) as u64)
    }
}

/// Runs `op` until it succeeds or `max_retries` retries are spent, returning the last error.
pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries => {
                warn!(what, attempt, error = %e, "giving up after retries");
                return Err(e);
            }
            Err(e) => {
                let delay = cfg.backoff(attempt);
                warn!(what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
