//! Message batcher: coalesces normal-priority notifications into one chat message
//!
//! Normal notifications wait up to one batch window and are then delivered together. A
//! high-priority notification first pushes out whatever is queued, then goes out on its own,
//! so nothing queued before it is ever delivered after it.
//!
//! Failed deliveries are logged and dropped, never re-queued. Once closed, normal
//! notifications are no longer queued and go out immediately like high-priority ones.

use crate::models::{BatchConfig, MessageHandle, Priority, QueuedMessage};
use crate::relay::delivery::{DeliveryClient, DeliveryError};
use crate::services::logging;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const BATCH_SEPARATOR: &str = "\n\n──────────\n\n";

/// Text of a combined message: a count header, then bodies in insertion order.
pub fn compose_batch(bodies: &[String]) -> String {
    format!(
        "📬 {} notifications{}{}",
        bodies.len(),
        BATCH_SEPARATOR,
        bodies.join(BATCH_SEPARATOR)
    )
}

/// What happened to a notification handed to [`MessageBatcher::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Waiting for the next flush. `forced_flush` is set when the queue was full and had to be
    /// flushed first.
    Queued { forced_flush: bool },
    /// Delivered immediately
    Delivered(MessageHandle),
    /// Immediate delivery failed and the notification was dropped
    Dropped(DeliveryError),
}

/// Result of one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued
    Empty,
    /// Delivered as a new message
    Sent { handle: MessageHandle, count: usize },
    /// Merged into the previous batch message
    Edited { handle: MessageHandle, count: usize },
    /// Delivery failed; `count` notifications were dropped
    Failed { count: usize, error: DeliveryError },
}

struct BatchState {
    queue: VecDeque<QueuedMessage>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every drain so a stale timer can tell it lost the race
    epoch: u64,
    closed: bool,
}

/// The most recent combined message, while nothing standalone has been sent after it
struct LastBatch {
    handle: MessageHandle,
    bodies: Vec<String>,
    delivered_at: Instant,
}

struct BatcherInner {
    delivery: Arc<DeliveryClient>,
    window: Duration,
    max_queue_size: usize,
    state: Mutex<BatchState>,
    /// Held for the whole of every delivery so flushes never interleave.
    /// Lock order: `outbox` before `state`.
    outbox: Mutex<Option<LastBatch>>,
}

/// Notification batcher. Cloning shares the queue.
#[derive(Clone)]
pub struct MessageBatcher {
    inner: Arc<BatcherInner>,
}

impl MessageBatcher {
    pub fn new(delivery: Arc<DeliveryClient>, window: Duration, max_queue_size: usize) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                delivery,
                window,
                max_queue_size: max_queue_size.max(1),
                state: Mutex::new(BatchState {
                    queue: VecDeque::new(),
                    timer: None,
                    epoch: 0,
                    closed: false,
                }),
                outbox: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(delivery: Arc<DeliveryClient>, config: &BatchConfig) -> Self {
        Self::new(delivery, config.window(), config.max_queue_size)
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Notifications currently waiting for a flush
    pub async fn queue_len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Stop queueing. Anything already queued stays until the next flush.
    pub async fn close(&self) {
        self.inner.state.lock().await.closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    pub async fn add(&self, text: impl Into<String>, priority: Priority) -> AddOutcome {
        let text = text.into();
        match priority {
            Priority::High => self.add_high(text).await,
            Priority::Normal => self.add_normal(text).await,
        }
    }

    async fn add_high(&self, text: String) -> AddOutcome {
        let mut outbox = self.inner.outbox.lock().await;
        let pending = self.drain().await;
        if !pending.is_empty() {
            self.deliver(&mut outbox, pending).await;
        }
        // Whatever happens, the last batch message is no longer the newest one in chat
        *outbox = None;
        match self.inner.delivery.send(&text).await {
            Ok(handle) => AddOutcome::Delivered(handle),
            Err(e) => {
                logging::log_delivery_failure(&e.to_string(), Some("high priority notification"));
                AddOutcome::Dropped(e)
            }
        }
    }

    async fn add_normal(&self, text: String) -> AddOutcome {
        let stale_after = self.inner.window.saturating_mul(2);
        let mut forced_flush = false;
        loop {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                drop(state);
                tracing::debug!("Batcher closed, delivering notification immediately");
                return self.add_high(text).await;
            }

            let before = state.queue.len();
            state
                .queue
                .retain(|m| m.enqueued_at.elapsed() < stale_after);
            let purged = before - state.queue.len();
            if purged > 0 {
                tracing::warn!(purged, "Dropped stale queued notifications");
            }

            if state.queue.len() >= self.inner.max_queue_size {
                drop(state);
                tracing::warn!(
                    max_queue_size = self.inner.max_queue_size,
                    "Notification queue at capacity, flushing early"
                );
                forced_flush = true;
                self.flush().await;
                continue;
            }

            state.queue.push_back(QueuedMessage::new(text, Priority::Normal));
            if state.timer.is_none() {
                let epoch = state.epoch;
                let batcher = self.clone();
                let window = self.inner.window;
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    batcher.flush_on_timer(epoch).await;
                }));
            }
            return AddOutcome::Queued { forced_flush };
        }
    }

    /// Deliver everything queued as one message and clear the queue.
    pub async fn flush(&self) -> FlushOutcome {
        let mut outbox = self.inner.outbox.lock().await;
        let pending = self.drain().await;
        self.deliver(&mut outbox, pending).await
    }

    async fn flush_on_timer(&self, epoch: u64) {
        let mut outbox = self.inner.outbox.lock().await;
        let pending: Vec<QueuedMessage> = {
            let mut state = self.inner.state.lock().await;
            if state.epoch != epoch {
                return;
            }
            // This task's own handle; dropping it detaches rather than aborts
            state.timer = None;
            state.epoch += 1;
            state.queue.drain(..).collect()
        };
        let outcome = self.deliver(&mut outbox, pending).await;
        tracing::debug!(?outcome, "Batch window elapsed");
    }

    /// Take the queue and disarm the timer.
    async fn drain(&self) -> Vec<QueuedMessage> {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.epoch += 1;
        state.queue.drain(..).collect()
    }

    async fn deliver(
        &self,
        outbox: &mut Option<LastBatch>,
        pending: Vec<QueuedMessage>,
    ) -> FlushOutcome {
        let delivery = &self.inner.delivery;
        let count = pending.len();
        let mut bodies: Vec<String> = pending.into_iter().map(|m| m.text).collect();

        if count == 0 {
            return FlushOutcome::Empty;
        }

        if count == 1 {
            *outbox = None;
            return match delivery.send(&bodies[0]).await {
                Ok(handle) => FlushOutcome::Sent { handle, count },
                Err(error) => {
                    logging::log_delivery_failure(&error.to_string(), Some("batch flush"));
                    FlushOutcome::Failed { count, error }
                }
            };
        }

        if let Some(last) = outbox.take() {
            let fresh = last.delivered_at.elapsed() < self.inner.window.saturating_mul(2);
            let mut merged = last.bodies;
            merged.extend(bodies.iter().cloned());
            let text = compose_batch(&merged);
            if fresh && text.chars().count() <= delivery.max_message_chars() {
                match delivery.edit(last.handle, &text).await {
                    Ok(handle) => {
                        *outbox = Some(LastBatch {
                            handle,
                            bodies: merged,
                            delivered_at: Instant::now(),
                        });
                        return FlushOutcome::Edited { handle, count };
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Editing previous batch failed, sending new message");
                    }
                }
            }
        }

        match delivery.send(&compose_batch(&bodies)).await {
            Ok(handle) => {
                *outbox = Some(LastBatch {
                    handle,
                    bodies: std::mem::take(&mut bodies),
                    delivered_at: Instant::now(),
                });
                FlushOutcome::Sent { handle, count }
            }
            Err(error) => {
                logging::log_delivery_failure(&error.to_string(), Some("batch flush"));
                FlushOutcome::Failed { count, error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::delivery::RetryPolicy;
    use crate::relay::rate_limiter::RateLimiter;
    use crate::transport::{MemoryTransport, SentMessage, TransportError};

    fn batcher(transport: &MemoryTransport, window_secs: u64, max: usize) -> MessageBatcher {
        let delivery = Arc::new(DeliveryClient::new(
            Arc::new(transport.clone()),
            RateLimiter::new(1000, Duration::from_secs(1)),
            RetryPolicy::new(1, Duration::from_millis(10)),
        ));
        MessageBatcher::new(delivery, Duration::from_secs(window_secs), max)
    }

    #[test]
    fn test_compose_batch_layout() {
        let text = compose_batch(&["A".to_string(), "B".to_string()]);
        assert!(text.starts_with("📬 2 notifications"));
        assert!(text.find('A').unwrap() < text.find('B').unwrap());
        assert!(text.contains(BATCH_SEPARATOR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_of_empty_queue_is_noop() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        assert_eq!(batcher.flush().await, FlushOutcome::Empty);
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_item_is_sent_unwrapped() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        batcher.add("only", Priority::Normal).await;
        let outcome = batcher.flush().await;
        assert!(matches!(outcome, FlushOutcome::Sent { count: 1, .. }));
        assert_eq!(transport.texts(), vec!["only"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_after_window() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        batcher.add("A", Priority::Normal).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        batcher.add("B", Priority::Normal).await;

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(transport.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let texts = transport.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("2 notifications"));
        assert_eq!(batcher.queue_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_flush_disarms_timer() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        batcher.add("A", Priority::Normal).await;
        batcher.flush().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        batcher.add("B", Priority::Normal).await;

        // The first timer would have fired at 5s; the second is due at 6s
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(transport.texts(), vec!["A"]);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(transport.texts(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_forces_flush_and_starts_fresh_queue() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 3);
        for text in ["1", "2", "3"] {
            assert_eq!(
                batcher.add(text, Priority::Normal).await,
                AddOutcome::Queued {
                    forced_flush: false
                }
            );
        }
        assert_eq!(
            batcher.add("4", Priority::Normal).await,
            AddOutcome::Queued { forced_flush: true }
        );
        assert_eq!(batcher.queue_len().await, 1);
        let texts = transport.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("3 notifications"));
        assert!(!texts[0].contains('4'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_are_purged() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        {
            // Simulate an entry stuck behind a slow delivery
            let mut state = batcher.inner.state.lock().await;
            state.queue.push_back(QueuedMessage::new("old", Priority::Normal));
        }
        tokio::time::sleep(Duration::from_secs(11)).await;
        batcher.add("new", Priority::Normal).await;
        assert_eq!(batcher.queue_len().await, 1);
        batcher.flush().await;
        assert_eq!(transport.texts(), vec!["new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_batches_merge_by_edit() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        batcher.add("A", Priority::Normal).await;
        batcher.add("B", Priority::Normal).await;
        let first = batcher.flush().await;
        batcher.add("C", Priority::Normal).await;
        batcher.add("D", Priority::Normal).await;
        let second = batcher.flush().await;

        let FlushOutcome::Sent { handle, .. } = first else {
            panic!("expected a send, got {:?}", first);
        };
        assert_eq!(second, FlushOutcome::Edited { handle, count: 2 });
        let text = transport.message_text(handle).unwrap();
        assert!(text.contains("4 notifications"));
        for body in ["A", "B", "C", "D"] {
            assert_eq!(text.matches(body).count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_edit_falls_back_to_new_message() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        batcher.add("A", Priority::Normal).await;
        batcher.add("B", Priority::Normal).await;
        batcher.flush().await;

        transport.fail_edits(Some(TransportError::Rejected {
            status: 400,
            description: "message to edit not found".into(),
        }));
        batcher.add("C", Priority::Normal).await;
        batcher.add("D", Priority::Normal).await;
        let outcome = batcher.flush().await;

        assert!(matches!(outcome, FlushOutcome::Sent { count: 2, .. }));
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| matches!(m, SentMessage::Text { .. })));
        assert!(sent[1].text().contains("2 notifications"));
        assert!(!sent[1].text().contains('A'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_standalone_send_stops_merging() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        batcher.add("A", Priority::Normal).await;
        batcher.add("B", Priority::Normal).await;
        batcher.flush().await;
        batcher.add("urgent", Priority::High).await;
        batcher.add("C", Priority::Normal).await;
        batcher.add("D", Priority::Normal).await;
        batcher.flush().await;

        assert!(transport.sent().iter().all(|m| !m.is_edit()));
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_batch_is_not_edited() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        batcher.add("A", Priority::Normal).await;
        batcher.add("B", Priority::Normal).await;
        batcher.flush().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        batcher.add("C", Priority::Normal).await;
        batcher.add("D", Priority::Normal).await;
        let outcome = batcher.flush().await;
        assert!(matches!(outcome, FlushOutcome::Sent { count: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_is_not_requeued() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        batcher.add("A", Priority::Normal).await;
        batcher.add("B", Priority::Normal).await;
        transport.fail_next(1, TransportError::Timeout);

        let outcome = batcher.flush().await;
        assert!(matches!(outcome, FlushOutcome::Failed { count: 2, .. }));
        assert_eq!(batcher.queue_len().await, 0);
        assert_eq!(batcher.flush().await, FlushOutcome::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_batcher_delivers_immediately() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        batcher.add("queued", Priority::Normal).await;
        batcher.close().await;
        assert!(batcher.is_closed().await);

        let outcome = batcher.add("late", Priority::Normal).await;
        assert!(matches!(outcome, AddOutcome::Delivered(_)));
        assert_eq!(batcher.queue_len().await, 0);
        assert_eq!(transport.texts(), vec!["queued", "late"]);

        // No window timer was armed for the late notification
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.texts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_failure_is_reported() {
        let transport = MemoryTransport::new();
        let batcher = batcher(&transport, 5, 10);
        transport.fail_next(
            1,
            TransportError::Rejected {
                status: 403,
                description: "bot was blocked".into(),
            },
        );
        let outcome = batcher.add("urgent", Priority::High).await;
        assert!(matches!(outcome, AddOutcome::Dropped(DeliveryError::Permanent { .. })));
    }
}
