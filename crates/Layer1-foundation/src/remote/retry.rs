//! Bounded retry for remote calls
//!
//! Transport / timeout 에러만 재시도한다 (`Error::is_retryable`).
//! 지연: initial × 2^attempt, max에서 cap, ±20% jitter.

use crate::config::RemoteConfig;
use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 첫 시도 이후 재시도 횟수
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::from(&RemoteConfig::default())
    }
}

impl From<&RemoteConfig> for RetryConfig {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        let capped = doubled.min(self.max_delay);
        if self.jitter {
            capped.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
        } else {
            capped
        }
    }
}

/// Run `call` until it succeeds, fails permanently, or retries run out
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, what: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let err: Error = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            debug!("{}: permanent failure: {}", what, err);
            return Err(err);
        }
        if attempt >= config.max_retries {
            warn!("{}: giving up after {} attempts: {}", what, attempt + 1, err);
            return Err(err);
        }

        let delay = config.backoff(attempt);
        warn!("{}: attempt {} failed ({}), next in {:?}", what, attempt + 1, err, delay);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            jitter: false,
        };

        assert_eq!(config.backoff(0), Duration::from_millis(500));
        assert_eq!(config.backoff(1), Duration::from_millis(1000));
        assert_eq!(config.backoff(2), Duration::from_millis(2000));
        assert_eq!(config.backoff(5), Duration::from_millis(3000));
        assert_eq!(config.backoff(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1000),
            ..fast()
        };
        let config = RetryConfig { jitter: true, ..config };
        for _ in 0..20 {
            let d = config.backoff(0);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&fast(), "status", || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::Transport("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_parse_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = with_retry(&fast(), "status", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Parse("bad".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = with_retry(&fast(), "status", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout("slow".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
