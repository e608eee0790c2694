//! Sliding-window rate limiter guarding the chat transport

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Allows at most `max_requests` calls in any trailing `window`.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    /// Instants of admitted calls, oldest first
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(calls: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(oldest) = calls.front() {
            if now.duration_since(*oldest) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Suspend until a call is allowed, then record it.
    pub async fn throttle(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                Self::prune(&mut calls, self.window, now);
                if calls.len() < self.max_requests {
                    calls.push_back(now);
                    return;
                }
                match calls.front() {
                    Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Whether a call made now would have to wait. Does not consume a slot.
    pub async fn would_limit(&self) -> bool {
        let mut calls = self.calls.lock().await;
        Self::prune(&mut calls, self.window, Instant::now());
        calls.len() >= self.max_requests
    }

    /// Calls recorded in the current window
    pub async fn in_window(&self) -> usize {
        let mut calls = self.calls.lock().await;
        Self::prune(&mut calls, self.window, Instant::now());
        calls.len()
    }
}
