//! Approval coordinator: issues choice requests and matches operator callbacks to waiters
//!
//! Each request becomes a pending record holding a write-once result slot (a `watch` channel
//! that starts as `None`). Whoever fills the slot first wins: the callback handler with the
//! operator's choice, the waiter's deadline with `Expired`, admission with `Evicted`, or
//! shutdown with `Cancelled`. Every later attempt is a no-op.
//!
//! Capacity: when `max_concurrent` unresolved records exist, the oldest one is evicted to admit
//! the new request.

use crate::models::{
    ApprovalConfig, ApprovalId, ApprovalOption, ApprovalOutcome, ApprovalState, ApprovalSummary,
    ApprovalTicket, MessageHandle, WaitMode,
};
use crate::relay::callback::{encode_callback_data, CallbackEvent};
use crate::relay::delivery::DeliveryClient;
use crate::relay::RelayError;
use crate::services::logging;
use crate::transport::ChoiceButton;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

/// Header of every approval message
pub const APPROVAL_HEADER: &str = "🔐 Approval required";
/// Most choice buttons one request may carry
pub const MAX_OPTIONS: usize = 8;

/// Terminal value of a result slot
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Chosen(ApprovalOption),
    Expired,
    Evicted,
    Cancelled,
}

impl Resolution {
    fn state(&self) -> ApprovalState {
        match self {
            Resolution::Chosen(_) => ApprovalState::Resolved,
            Resolution::Expired => ApprovalState::Expired,
            Resolution::Evicted => ApprovalState::Evicted,
            Resolution::Cancelled => ApprovalState::Cancelled,
        }
    }

    fn into_outcome(self) -> ApprovalOutcome {
        match self {
            Resolution::Chosen(option) => ApprovalOutcome::Chosen(option),
            Resolution::Expired => ApprovalOutcome::TimedOut,
            Resolution::Evicted => ApprovalOutcome::Evicted,
            Resolution::Cancelled => ApprovalOutcome::Cancelled,
        }
    }

    fn status_line(&self) -> String {
        match self {
            Resolution::Chosen(option) => format!("✅ Selected: {}", option.label),
            Resolution::Expired => "⏰ Expired without an answer".to_string(),
            Resolution::Evicted => "♻️ Superseded by a newer request".to_string(),
            Resolution::Cancelled => "🛑 Cancelled".to_string(),
        }
    }
}

struct PendingApproval {
    id: ApprovalId,
    question: String,
    options: Vec<ApprovalOption>,
    created_at: DateTime<Utc>,
    timeout_at: Instant,
    handle: Option<MessageHandle>,
    slot: watch::Sender<Option<Resolution>>,
}

impl PendingApproval {
    /// Write the slot unless it already holds a value. Returns true if this call wrote it.
    fn fill(&self, resolution: Resolution) -> bool {
        self.slot.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(resolution);
                true
            }
        })
    }

    fn resolution(&self) -> Option<Resolution> {
        self.slot.borrow().clone()
    }

    fn is_live(&self) -> bool {
        self.slot.borrow().is_none()
    }

    fn state(&self) -> ApprovalState {
        self.resolution()
            .map(|r| r.state())
            .unwrap_or(ApprovalState::Pending)
    }
}

/// A finished record whose chat message should show its final state
struct Annotation {
    handle: MessageHandle,
    question: String,
    resolution: Resolution,
}

impl Annotation {
    fn of(record: &PendingApproval) -> Option<Self> {
        Some(Self {
            handle: record.handle?,
            question: record.question.clone(),
            resolution: record.resolution()?,
        })
    }
}

/// Coordinates approval requests with inbound callbacks. One instance per destination chat.
pub struct ApprovalCoordinator {
    delivery: Arc<DeliveryClient>,
    config: ApprovalConfig,
    /// Callbacks from any other chat are rejected; `None` accepts all
    expected_chat_id: Option<String>,
    /// Oldest first
    records: RwLock<VecDeque<PendingApproval>>,
    closed: AtomicBool,
}

impl ApprovalCoordinator {
    pub fn new(
        delivery: Arc<DeliveryClient>,
        config: ApprovalConfig,
        expected_chat_id: Option<String>,
    ) -> Self {
        Self {
            delivery,
            config,
            expected_chat_id,
            records: RwLock::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// Send a choice request and start tracking it.
    pub async fn request_approval(
        &self,
        question: impl Into<String>,
        options: Vec<ApprovalOption>,
        timeout: Duration,
    ) -> Result<ApprovalTicket, RelayError> {
        let question = question.into();
        if question.trim().is_empty() {
            return Err(RelayError::InvalidRequest("question is empty".to_string()));
        }
        if options.is_empty() || options.len() > MAX_OPTIONS {
            return Err(RelayError::InvalidRequest(format!(
                "between 1 and {} options required, got {}",
                MAX_OPTIONS,
                options.len()
            )));
        }
        let Some(timeout_at) = Instant::now().checked_add(timeout) else {
            return Err(RelayError::InvalidRequest(format!(
                "timeout of {}s is out of range",
                timeout.as_secs()
            )));
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::ShuttingDown);
        }

        let id = ApprovalId::new();
        let buttons: Vec<ChoiceButton> = options
            .iter()
            .enumerate()
            .map(|(index, option)| ChoiceButton {
                label: option.label.clone(),
                callback_data: encode_callback_data(id, index),
            })
            .collect();
        let (slot, watcher) = watch::channel(None);

        // Sweep, evict and reserve under one lock so concurrent requests cannot overshoot
        let (evicted, annotations) = {
            let mut records = self.records.write().await;
            let mut annotations = self.sweep(&mut records);

            let mut evicted = None;
            let live = records.iter().filter(|r| r.is_live()).count();
            if live >= self.config.max_concurrent {
                if let Some(oldest) = records.iter().find(|r| r.is_live()) {
                    oldest.fill(Resolution::Evicted);
                    tracing::warn!(
                        evicted = %oldest.id,
                        max_concurrent = self.config.max_concurrent,
                        "CapacityExceeded: evicting oldest pending approval"
                    );
                    evicted = Some(oldest.id);
                    annotations.extend(Annotation::of(oldest));
                }
            }

            records.push_back(PendingApproval {
                id,
                question: question.clone(),
                options,
                created_at: Utc::now(),
                timeout_at,
                handle: None,
                slot,
            });
            (evicted, annotations)
        };
        self.annotate_all(annotations).await;

        match self
            .delivery
            .send_choice(APPROVAL_HEADER, &question, &buttons)
            .await
        {
            Ok(handle) => {
                if let Some(record) = self.records.write().await.iter_mut().find(|r| r.id == id) {
                    record.handle = Some(handle);
                }
                // Evicted, expired or cancelled while the message was in flight
                let resolution = watcher.borrow().clone();
                if let Some(resolution) = resolution {
                    self.annotate(Annotation {
                        handle,
                        question,
                        resolution,
                    })
                    .await;
                }
                tracing::info!(approval_id = %id, "Approval request issued");
                Ok(ApprovalTicket { id, evicted })
            }
            Err(e) => {
                self.records.write().await.retain(|r| r.id != id);
                logging::log_delivery_failure(&e.to_string(), Some("approval request"));
                Err(e.into())
            }
        }
    }

    /// Drop records past their deadline, expiring the unresolved ones first. Finished records
    /// inside their deadline stay so a late `poll` still sees the outcome.
    fn sweep(&self, records: &mut VecDeque<PendingApproval>) -> Vec<Annotation> {
        let now = Instant::now();
        let mut annotations = Vec::new();
        records.retain(|record| {
            if now < record.timeout_at {
                return true;
            }
            if record.fill(Resolution::Expired) {
                annotations.extend(Annotation::of(record));
            }
            false
        });
        annotations
    }

    /// Fill the slot of a live approval with the chosen option and acknowledge it in chat.
    /// Unknown, finished or overdue ids and out-of-range indexes are no-ops returning false.
    pub async fn resolve(&self, id: ApprovalId, option_index: usize) -> bool {
        let annotation = {
            let records = self.records.read().await;
            let Some(record) = records.iter().find(|r| r.id == id) else {
                tracing::debug!(approval_id = %id, "Resolve for unknown approval ignored");
                return false;
            };
            if Instant::now() >= record.timeout_at {
                tracing::debug!(approval_id = %id, "Resolve after deadline ignored");
                return false;
            }
            let Some(option) = record.options.get(option_index) else {
                tracing::warn!(approval_id = %id, option_index, "Option index out of range");
                return false;
            };
            if !record.fill(Resolution::Chosen(option.clone())) {
                tracing::debug!(approval_id = %id, "Approval already finished");
                return false;
            }
            tracing::info!(approval_id = %id, choice = %option.label, "Approval resolved");
            Annotation::of(record)
        };
        if let Some(annotation) = annotation {
            self.annotate(annotation).await;
        }
        true
    }

    /// Entry point for raw inbound updates. Never fails: anything unusable is logged and
    /// dropped. Returns true if the update resolved an approval.
    pub async fn handle_callback(&self, raw: &serde_json::Value) -> bool {
        match CallbackEvent::from_value(raw) {
            CallbackEvent::Valid {
                approval_id,
                option_index,
                query_id,
                chat_id,
            } => {
                if let Some(expected) = &self.expected_chat_id {
                    if chat_id.as_deref() != Some(expected.as_str()) {
                        logging::log_security_event(
                            "foreign_callback",
                            self.delivery.transport_name(),
                            &format!("callback from chat {:?} rejected", chat_id),
                        );
                        return false;
                    }
                }
                let resolved = self.resolve(approval_id, option_index).await;
                let ack = if resolved {
                    "Answer recorded"
                } else {
                    "This request is no longer pending"
                };
                self.delivery.answer_callback(&query_id, Some(ack)).await;
                resolved
            }
            CallbackEvent::Unrelated => {
                tracing::debug!("Ignoring non-callback update");
                false
            }
            CallbackEvent::Malformed(reason) => {
                tracing::warn!(reason = %reason, "MalformedCallback ignored");
                false
            }
        }
    }

    /// Wait for an approval to finish. Consumes the record: a second call returns `NotFound`.
    pub async fn poll(&self, id: ApprovalId) -> ApprovalOutcome {
        let (mut watcher, deadline) = {
            let records = self.records.read().await;
            match records.iter().find(|r| r.id == id) {
                Some(record) => (record.slot.subscribe(), record.timeout_at),
                None => return ApprovalOutcome::NotFound,
            }
        };

        let seen = match self.config.wait_mode {
            WaitMode::Signal => {
                let waited = tokio::time::timeout_at(deadline, async {
                    watcher
                        .wait_for(Option::is_some)
                        .await
                        .map(|value| (*value).clone())
                })
                .await;
                match waited {
                    Ok(Ok(resolution)) => resolution,
                    // Slot dropped unwritten or deadline reached; settle decides
                    Ok(Err(_)) | Err(_) => None,
                }
            }
            WaitMode::AdaptivePoll => self.poll_adaptively(&watcher, deadline).await,
        };

        self.settle(id, seen).await
    }

    /// Check the slot on a growing interval until it is written or the deadline passes.
    async fn poll_adaptively(
        &self,
        watcher: &watch::Receiver<Option<Resolution>>,
        deadline: Instant,
    ) -> Option<Resolution> {
        let floor = Duration::from_millis(self.config.poll_floor_ms);
        let step = Duration::from_millis(self.config.poll_step_ms);
        let ceiling = Duration::from_millis(self.config.poll_ceiling_ms).max(floor);
        let mut interval = floor;
        loop {
            let current = watcher.borrow().clone();
            if current.is_some() {
                return current;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval + step).min(ceiling);
        }
    }

    /// Remove the record after its wait ended, expiring it if nothing was written.
    async fn settle(&self, id: ApprovalId, seen: Option<Resolution>) -> ApprovalOutcome {
        let (resolution, annotation) = {
            let mut records = self.records.write().await;
            match records.iter().position(|r| r.id == id) {
                Some(pos) => {
                    let record = &records[pos];
                    let expired_here = record.fill(Resolution::Expired);
                    let resolution = record.resolution();
                    let annotation = if expired_here {
                        Annotation::of(record)
                    } else {
                        None
                    };
                    records.remove(pos);
                    (resolution.or(seen), annotation)
                }
                None => (seen, None),
            }
        };
        if let Some(annotation) = annotation {
            tracing::info!(approval_id = %id, "Approval timed out");
            self.annotate(annotation).await;
        }
        match resolution {
            Some(resolution) => resolution.into_outcome(),
            None => ApprovalOutcome::NotFound,
        }
    }

    /// Release every waiter with `Cancelled` and refuse further requests.
    pub async fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let (cancelled, annotations) = {
            let records = self.records.read().await;
            let filled: Vec<&PendingApproval> = records
                .iter()
                .filter(|record| record.fill(Resolution::Cancelled))
                .collect();
            let annotations: Vec<Annotation> =
                filled.iter().filter_map(|record| Annotation::of(record)).collect();
            (filled.len(), annotations)
        };
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled outstanding approvals");
        }
        self.annotate_all(annotations).await;
        cancelled
    }

    /// Whether `cancel_all` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Unresolved records
    pub async fn live_count(&self) -> usize {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.is_live())
            .count()
    }

    /// Snapshot of tracked records, oldest first
    pub async fn pending(&self) -> Vec<ApprovalSummary> {
        self.records
            .read()
            .await
            .iter()
            .map(|r| ApprovalSummary {
                id: r.id,
                question: r.question.clone(),
                options: r.options.clone(),
                state: r.state(),
                created_at: r.created_at,
            })
            .collect()
    }

    async fn annotate(&self, annotation: Annotation) {
        let text = format!(
            "{}\n\n{}\n\n{}",
            APPROVAL_HEADER,
            annotation.question,
            annotation.resolution.status_line()
        );
        if let Err(e) = self.delivery.edit(annotation.handle, &text).await {
            logging::log_delivery_failure(&e.to_string(), Some("approval acknowledgement"));
        }
    }

    async fn annotate_all(&self, annotations: Vec<Annotation>) {
        futures_util::future::join_all(annotations.into_iter().map(|a| self.annotate(a))).await;
    }
}
