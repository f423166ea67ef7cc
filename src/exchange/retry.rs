//! Bounded retry for exchange calls.
//!
//! Transient failures (transport errors, timeouts, rate limits) are retried
//! up to `max_attempts` times with exponential backoff. Anything else is
//! returned on the first occurrence.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::{debug, warn};

use super::{ExchangeGateway, GatewayFuture};
use crate::error::TradingError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles after each failure
    pub base_delay: Duration,

    /// Upper bound on a single delay
    pub max_delay: Duration,

    /// Deadline for one attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No jitter, no overall deadline: the attempt count is the only bound.
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Delays slept between attempts, in order.
    pub fn delays(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (1..self.max_attempts.max(1))
            .map(|_| backoff.next_backoff().unwrap_or(self.max_delay))
            .collect()
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// An attempt that exceeds `call_timeout` fails with the error built by
    /// `on_timeout`, which should be a transient kind.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        on_timeout: fn(String) -> TradingError,
        mut call: F,
    ) -> Result<T, TradingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TradingError>>,
    {
        let mut backoff = self.backoff();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(on_timeout(format!(
                    "{} timed out after {}s",
                    operation,
                    self.call_timeout.as_secs_f64()
                ))),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    warn!(operation, attempts = attempt, error = %e, "Retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.max_delay);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient exchange failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// [`run`](Self::run) for a single gateway method.
    pub async fn call<'a, T, F>(
        &self,
        operation: &str,
        on_timeout: fn(String) -> TradingError,
        gateway: &'a dyn ExchangeGateway,
        call: F,
    ) -> Result<T, TradingError>
    where
        F: Fn(&'a dyn ExchangeGateway) -> GatewayFuture<'a, T>,
    {
        self.run(operation, on_timeout, || call(gateway)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            call_timeout: Duration::from_secs(1),
        };
        let millis: Vec<u128> = policy.delays().iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![100, 200, 300, 300]);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast_policy()
            .run("fetch", TradingError::MarketDataUnavailable, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TradingError::MarketDataUnavailable("503".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast_policy()
            .run("fetch", TradingError::MarketDataUnavailable, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TradingError::MarketDataUnavailable("down".into()))
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), "market_data_unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast_policy()
            .run("order", TradingError::ExchangeUnavailable, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TradingError::OrderRejected("margin".into()))
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), "order_rejected");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(10),
            ..fast_policy()
        };
        let result: Result<(), _> = policy
            .run("fetch", TradingError::MarketDataUnavailable, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), "market_data_unavailable");
        assert!(err.to_string().contains("timed out"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
