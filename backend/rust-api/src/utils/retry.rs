use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Backoff policy for retrying a failed unit of work (a scheduler tick, a store call).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            jitter_max: Some(Duration::from_millis(100)),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: usize, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff: base_backoff * 16,
            jitter_max: Some(base_backoff / 2),
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter_max: None,
        }
    }

    fn wait_for(&self, backoff: Duration) -> Duration {
        match self.jitter_max {
            Some(jitter_max) if !jitter_max.is_zero() => {
                let jitter_ms = jitter_max.as_millis() as u64;
                backoff + Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
            }
            _ => backoff,
        }
    }
}

/// Runs `f` until it succeeds or attempts are exhausted, doubling the wait each time.
/// Returns the last error when every attempt fails.
pub async fn retry_async_with_config<F, Fut, T, E>(
    label: &str,
    config: &RetryConfig,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts_left = config.max_attempts.max(1);
    let mut backoff = config.base_backoff;
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts_left = attempts_left.saturating_sub(1);
                if attempts_left == 0 {
                    return Err(err);
                }

                let wait = config.wait_for(backoff);
                tracing::warn!(
                    label,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(wait).await;
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}
