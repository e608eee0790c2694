//! Chat transports: outbound delivery and inbound callback updates
//!
//! Every outbound call returns a [`TransportError`] on failure; the delivery client decides
//! from [`TransportError::is_transient`] whether to retry.

mod memory;
mod telegram;

pub use memory::{MemoryTransport, MemoryUpdateSource, SentMessage};
pub use telegram::{TelegramTransport, TelegramUpdateSource, TELEGRAM_MAX_MESSAGE_CHARS};

use crate::models::MessageHandle;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Message length limit assumed for transports that do not declare one.
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 4096;

/// Failure of a single transport call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error {status}: {description}")]
    Server { status: u16, description: String },

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request rejected {status}: {description}")]
    Rejected { status: u16, description: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Network errors, timeouts, 5xx and 429 responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_)
                | TransportError::Timeout
                | TransportError::Server { .. }
                | TransportError::RateLimited { .. }
        )
    }

    /// Classify an HTTP status with the provider's description.
    pub fn from_status(status: u16, description: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => TransportError::RateLimited { retry_after },
            500..=599 => TransportError::Server {
                status,
                description,
            },
            _ => TransportError::Rejected {
                status,
                description,
            },
        }
    }
}

/// One interactive choice control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceButton {
    pub label: String,
    /// Opaque data echoed back in the callback when the button is pressed
    pub callback_data: String,
}

/// Outbound side of a chat-bot transport bound to a single destination.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Transport name for logging (e.g. "telegram").
    fn name(&self) -> &str;

    /// Longest text a single message may carry.
    fn max_message_chars(&self) -> usize {
        DEFAULT_MAX_MESSAGE_CHARS
    }

    async fn send_message(&self, text: &str) -> Result<MessageHandle, TransportError>;

    async fn edit_message(
        &self,
        handle: MessageHandle,
        text: &str,
    ) -> Result<MessageHandle, TransportError>;

    async fn send_choice_request(
        &self,
        header: &str,
        question: &str,
        buttons: &[ChoiceButton],
    ) -> Result<MessageHandle, TransportError>;

    /// Acknowledge an activated choice control. Transports without the concept ignore it.
    async fn answer_callback(
        &self,
        _query_id: &str,
        _text: Option<&str>,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Inbound side of a transport: raw, untrusted update payloads.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Wait for the next batch of updates. An empty batch means nothing arrived in time.
    async fn next_updates(&self) -> Result<Vec<serde_json::Value>, TransportError>;
}
