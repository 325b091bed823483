//! Bounded exponential backoff for RPC calls
//!
//! Only retryable errors (see [`RelayerError::is_retryable`]) are retried;
//! permanent rejections return immediately.

use crate::config::RetryConfig;
use crate::error::{RelayerError, RelayerResult};

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Run `action` until it succeeds, fails permanently, or attempts run out
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    config: &RetryConfig,
    mut action: F,
) -> RelayerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RelayerResult<T>>,
{
    let attempts = config.max_retries.saturating_add(1);
    let call_timeout = Duration::from_millis(config.timeout_ms);

    for attempt in 0..attempts {
        let err = match timeout(call_timeout, action()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if !err.is_retryable() => return Err(err),
            Ok(Err(err)) => err,
            Err(_) => RelayerError::Timeout {
                operation: label.to_string(),
            },
        };

        if attempt + 1 >= attempts {
            return Err(err);
        }
        warn!(attempt = attempt + 1, error = %err, "{label} failed; retrying");
        crate::metrics::record_rpc_retry(label);

        sleep(backoff_delay(config, attempt)).await;
    }

    Err(RelayerError::Timeout {
        operation: format!("{label} (retries exhausted)"),
    })
}

pub(crate) fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = Duration::from_millis(config.base_delay_ms);
    let backoff = base.saturating_mul(2u32.saturating_pow(attempt));
    let capped = std::cmp::min(backoff, Duration::from_millis(config.max_delay_ms));
    let jitter = if config.jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=config.jitter_ms))
    };
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_ms: 0,
            timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_backoff("test", &fast_config(3), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RelayerError::TransientRpc {
                        chain: Chain::Ethereum,
                        message: "connection reset".into(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: RelayerResult<()> = with_backoff("test", &fast_config(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RelayerError::ChainRejection {
                    chain: Chain::Tron,
                    reason: "REVERT".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(RelayerError::ChainRejection { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_exhaust() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut config = fast_config(1);
        config.timeout_ms = 5;
        let result: RelayerResult<()> = with_backoff("slow", &config, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(RelayerError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 0,
            timeout_ms: 1_000,
        };
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 8), Duration::from_millis(1_000));
    }
}
