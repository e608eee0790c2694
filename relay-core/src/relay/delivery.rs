//! Delivery client: rate-limited, retrying wrapper around the chat transport

use crate::models::{DeliveryConfig, MessageHandle};
use crate::relay::rate_limiter::RateLimiter;
use crate::services::logging;
use crate::transport::{ChatTransport, ChoiceButton, TransportError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Delivery failure surfaced to the batcher or the approval coordinator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("{operation} failed permanently: {source}")]
    Permanent {
        operation: &'static str,
        source: TransportError,
    },

    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: TransportError,
    },
}

/// Bounded exponential backoff: `base × 2^(attempt-1)` between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

/// Every outbound transport call goes through one instance of this client.
pub struct DeliveryClient {
    transport: Arc<dyn ChatTransport>,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl DeliveryClient {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        limiter: RateLimiter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            limiter,
            retry,
        }
    }

    pub fn from_config(transport: Arc<dyn ChatTransport>, config: &DeliveryConfig) -> Self {
        Self::new(
            transport,
            RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window()),
            RetryPolicy::new(config.retry_attempts, config.retry_base_delay()),
        )
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn max_message_chars(&self) -> usize {
        self.transport.max_message_chars()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub async fn send(&self, text: &str) -> Result<MessageHandle, DeliveryError> {
        self.execute("send", || self.transport.send_message(text)).await
    }

    pub async fn edit(
        &self,
        handle: MessageHandle,
        text: &str,
    ) -> Result<MessageHandle, DeliveryError> {
        self.execute("edit", || self.transport.edit_message(handle, text))
            .await
    }

    pub async fn send_choice(
        &self,
        header: &str,
        question: &str,
        buttons: &[ChoiceButton],
    ) -> Result<MessageHandle, DeliveryError> {
        self.execute("send_choice", || {
            self.transport.send_choice_request(header, question, buttons)
        })
        .await
    }

    /// Acknowledge a callback query. Single attempt, not rate limited; failures are only logged.
    pub async fn answer_callback(&self, query_id: &str, text: Option<&str>) {
        if let Err(e) = self.transport.answer_callback(query_id, text).await {
            tracing::debug!(error = %e, "Failed to answer callback query");
        }
    }

    async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, DeliveryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
        T: std::fmt::Debug,
    {
        let mut attempt = 1;
        loop {
            self.limiter.throttle().await;
            match call().await {
                Ok(value) => {
                    logging::log_delivery(
                        operation,
                        self.transport.name(),
                        Some(&format!("{:?}", value)),
                    );
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    tracing::warn!(operation, error = %e, "Permanent delivery failure");
                    return Err(DeliveryError::Permanent {
                        operation,
                        source: e,
                    });
                }
                Err(e) if attempt >= self.retry.max_attempts => {
                    tracing::warn!(operation, attempt, error = %e, "Delivery retries exhausted");
                    return Err(DeliveryError::Exhausted {
                        operation,
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let mut delay = self.retry.delay_for(attempt);
                    if let TransportError::RateLimited {
                        retry_after: Some(retry_after),
                    } = &e
                    {
                        delay = delay.max(*retry_after);
                    }
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient delivery failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use tokio::time::Instant;

    fn client(transport: &MemoryTransport, attempts: u32) -> DeliveryClient {
        DeliveryClient::new(
            Arc::new(transport.clone()),
            RateLimiter::new(100, Duration::from_secs(1)),
            RetryPolicy::new(attempts, Duration::from_millis(100)),
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_with_backoff() {
        let transport = MemoryTransport::new();
        transport.fail_next(2, TransportError::Network("reset".into()));
        let client = client(&transport, 3);

        let start = Instant::now();
        let handle = client.send("hello").await.unwrap();
        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.message_text(handle).as_deref(), Some("hello"));
        // 100ms after the first failure, 200ms after the second
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let transport = MemoryTransport::new();
        transport.fail_next(
            1,
            TransportError::Rejected {
                status: 401,
                description: "Unauthorized".into(),
            },
        );
        let client = client(&transport, 3);

        let err = client.send("hello").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Permanent { operation: "send", .. }));
        assert_eq!(transport.attempts(), 1);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_configured_attempts() {
        let transport = MemoryTransport::new();
        transport.fail_next(5, TransportError::Timeout);
        let client = client(&transport, 3);

        let err = client.send("hello").await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::Exhausted {
                operation: "send",
                attempts: 3,
                last: TransportError::Timeout,
            }
        );
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_short_backoff() {
        let transport = MemoryTransport::new();
        transport.fail_next(
            1,
            TransportError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            },
        );
        let client = client(&transport, 2);

        let start = Instant::now();
        client.send("hello").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_is_rate_limited() {
        let transport = MemoryTransport::new();
        let client = DeliveryClient::new(
            Arc::new(transport.clone()),
            RateLimiter::new(1, Duration::from_secs(1)),
            RetryPolicy::new(1, Duration::ZERO),
        );

        let start = Instant::now();
        client.send("one").await.unwrap();
        client.send("two").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
