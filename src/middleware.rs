//! Retry middleware for subscription requests.

use anyhow::anyhow;
use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::time::Duration;

/// Middleware that retries transient failures with exponential backoff.
///
/// Connect errors, timeouts and 5xx responses are retried; any other outcome
/// (including 4xx responses) is returned to the caller unchanged.
#[derive(Debug, Clone)]
pub struct RetryTransientMiddleware {
    /// Retries after the first attempt.
    max_retries: usize,
    /// Delay before the first retry; doubles on every further retry.
    backoff: Duration,
}

impl RetryTransientMiddleware {
    pub fn new(max_retries: usize, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: usize) -> Duration {
        let exponent = retry.saturating_sub(1).min(16) as u32;
        self.backoff.saturating_mul(2u32.pow(exponent))
    }

    fn delay_with_jitter(&self, retry: usize) -> Duration {
        let base = self.base_delay(retry);
        let max_jitter = (base.as_millis() / 2) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_jitter)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Whether a transport error is worth another attempt.
pub(crate) fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_builder() || err.is_redirect() || err.is_decode() {
        return false;
    }
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

#[async_trait]
impl Middleware for RetryTransientMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let url = req.url().clone();
        let mut retry = 0;

        loop {
            let attempt = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                        .to_string()
                ))
            })?;

            let outcome = next.clone().run(attempt, extensions).await;
            let retryable = match &outcome {
                Ok(response) => response.status().is_server_error(),
                Err(Error::Reqwest(e)) => is_transient(e),
                Err(_) => false,
            };

            if !retryable {
                if retry > 0 {
                    debug!("Request to {} settled after {} retries", url, retry);
                }
                return outcome;
            }
            if retry >= self.max_retries {
                warn!("Giving up on {} after {} attempts", url, retry + 1);
                return outcome;
            }

            retry += 1;
            let delay = self.delay_with_jitter(retry);
            match &outcome {
                Ok(response) => warn!(
                    "Request to {} returned {} (retry {} of {} in {:?})",
                    url,
                    response.status(),
                    retry,
                    self.max_retries,
                    delay
                ),
                Err(e) => warn!(
                    "Request to {} failed: {} (retry {} of {} in {:?})",
                    url, e, retry, self.max_retries, delay
                ),
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_retry() {
        let middleware = RetryTransientMiddleware::new(3, Duration::from_millis(100));
        assert_eq!(middleware.base_delay(1), Duration::from_millis(100));
        assert_eq!(middleware.base_delay(2), Duration::from_millis(200));
        assert_eq!(middleware.base_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_half_the_base_delay() {
        let middleware = RetryTransientMiddleware::new(3, Duration::from_millis(100));
        for _ in 0..50 {
            let delay = middleware.delay_with_jitter(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }
}
