//! Relay components and the facade wiring them to one transport

pub mod approval;
pub mod batcher;
pub mod callback;
pub mod delivery;
pub mod rate_limiter;
pub mod shutdown;

pub use approval::{ApprovalCoordinator, APPROVAL_HEADER, MAX_OPTIONS};
pub use batcher::{compose_batch, AddOutcome, FlushOutcome, MessageBatcher};
pub use callback::{encode_callback_data, CallbackEvent};
pub use delivery::{DeliveryClient, DeliveryError, RetryPolicy};
pub use rate_limiter::RateLimiter;
pub use shutdown::{ShutdownController, ShutdownReport};

use crate::models::{
    ApprovalOption, ApprovalOutcome, ConfigError, Priority, RelayConfig, BOT_TOKEN_ENV,
};
use crate::transport::{
    ChatTransport, TelegramTransport, TelegramUpdateSource, TransportError, UpdateSource,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Update listener backoff after a failed poll
const LISTENER_INITIAL_DELAY: Duration = Duration::from_millis(100);
const LISTENER_MAX_DELAY: Duration = Duration::from_secs(10);

/// Errors surfaced by the relay API
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("Invalid approval request: {0}")]
    InvalidRequest(String),

    #[error("Relay is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Missing setting: {0}")]
    MissingSetting(&'static str),
}

/// One relay: a delivery client shared by the batcher and the approval coordinator.
pub struct Relay {
    config: RelayConfig,
    delivery: Arc<DeliveryClient>,
    batcher: MessageBatcher,
    approvals: Arc<ApprovalCoordinator>,
    shutdown: Arc<ShutdownController>,
}

impl Relay {
    /// Wire a relay around `transport`. Callbacks are only accepted from the configured chat.
    pub fn new(config: RelayConfig, transport: Arc<dyn ChatTransport>) -> Self {
        let delivery = Arc::new(DeliveryClient::from_config(transport, &config.delivery));
        let batcher = MessageBatcher::from_config(delivery.clone(), &config.batch);
        let approvals = Arc::new(ApprovalCoordinator::new(
            delivery.clone(),
            config.approvals.clone(),
            config.telegram.resolve_chat_id(),
        ));
        let shutdown = Arc::new(ShutdownController::new(batcher.clone(), approvals.clone()));
        Self {
            config,
            delivery,
            batcher,
            approvals,
            shutdown,
        }
    }

    /// Relay on the Telegram Bot API, plus the update source feeding its callbacks.
    /// The bot token comes from the environment only.
    pub fn telegram(config: RelayConfig) -> Result<(Self, TelegramUpdateSource), RelayError> {
        let token = std::env::var(BOT_TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or(RelayError::MissingSetting(BOT_TOKEN_ENV))?;
        let chat_id = config
            .telegram
            .resolve_chat_id()
            .ok_or(RelayError::MissingSetting("telegram.chat_id"))?;
        let transport = TelegramTransport::new(token.clone(), chat_id, &config.telegram)?;
        let updates = TelegramUpdateSource::new(token, &config.telegram)?;
        Ok((Self::new(config, Arc::new(transport)), updates))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn delivery(&self) -> &Arc<DeliveryClient> {
        &self.delivery
    }

    pub fn batcher(&self) -> &MessageBatcher {
        &self.batcher
    }

    pub fn approvals(&self) -> &Arc<ApprovalCoordinator> {
        &self.approvals
    }

    pub fn shutdown_controller(&self) -> &Arc<ShutdownController> {
        &self.shutdown
    }

    /// Queue or send a notification depending on its priority.
    pub async fn notify(&self, text: impl Into<String>, priority: Priority) -> AddOutcome {
        self.batcher.add(text, priority).await
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.batcher.flush().await
    }

    /// Ask the operator and wait for the answer. `None` uses the configured default timeout.
    pub async fn request_approval(
        &self,
        question: impl Into<String>,
        options: Vec<ApprovalOption>,
        timeout: Option<Duration>,
    ) -> Result<ApprovalOutcome, RelayError> {
        let timeout = timeout.unwrap_or_else(|| self.config.approvals.default_timeout());
        let ticket = self
            .approvals
            .request_approval(question, options, timeout)
            .await?;
        Ok(self.approvals.poll(ticket.id).await)
    }

    /// Feed one raw inbound update to the approval coordinator.
    pub async fn handle_callback(&self, raw: &serde_json::Value) -> bool {
        self.approvals.handle_callback(raw).await
    }

    /// Pump updates from `source` into the coordinator until shutdown. Poll failures back off
    /// exponentially and never end the loop.
    pub fn spawn_update_listener(&self, source: Arc<dyn UpdateSource>) -> JoinHandle<()> {
        let approvals = self.approvals.clone();
        tokio::spawn(async move {
            let mut delay = LISTENER_INITIAL_DELAY;
            while !approvals.is_closed() {
                match source.next_updates().await {
                    Ok(updates) => {
                        delay = LISTENER_INITIAL_DELAY;
                        for update in &updates {
                            approvals.handle_callback(update).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Polling for updates failed"
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(LISTENER_MAX_DELAY);
                    }
                }
            }
            tracing::debug!("Update listener stopped");
        })
    }

    /// Flush queued notifications and cancel live approvals. Idempotent.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        self.shutdown.shutdown().await
    }
}
