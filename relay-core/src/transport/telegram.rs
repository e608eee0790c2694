//! Telegram transport: send and edit messages via the Bot API and receive callback queries
//! via getUpdates.

use crate::models::{MessageHandle, TelegramConfig};
use crate::transport::{ChatTransport, ChoiceButton, TransportError, UpdateSource};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LONG_POLL_TIMEOUT_SECS: u64 = 30;
/// Bot API limit on message text length, in characters.
pub const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;

#[derive(serde::Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(serde::Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(serde::Deserialize)]
struct BotMessage {
    message_id: i64,
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    // The request URL embeds the bot token
    let err = err.without_url();
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

fn truncate_text(text: &str) -> String {
    if text.chars().count() <= TELEGRAM_MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(TELEGRAM_MAX_MESSAGE_CHARS - 1).collect();
    truncated.push('…');
    truncated
}

/// Shared Bot API plumbing for the transport and the update source. Never log the token.
struct BotApi {
    api_base: String,
    token: String,
    client: Arc<Client>,
}

impl BotApi {
    fn new(api_base: &str, token: String, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_reqwest_error)?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            client: Arc::new(client),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = res.status();
        let parsed: ApiResponse<T> = match res.json().await {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => {
                return Err(TransportError::InvalidResponse(e.without_url().to_string()))
            }
            Err(_) => {
                return Err(TransportError::from_status(
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("unknown").to_string(),
                    None,
                ))
            }
        };
        if !parsed.ok || !status.is_success() {
            let retry_after = parsed
                .parameters
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs);
            return Err(TransportError::from_status(
                parsed.error_code.unwrap_or(status.as_u16()),
                parsed.description.unwrap_or_default(),
                retry_after,
            ));
        }
        parsed
            .result
            .ok_or_else(|| TransportError::InvalidResponse(format!("{}: missing result", method)))
    }
}

/// Telegram transport bound to one chat. Token from env, chat id from config/env.
pub struct TelegramTransport {
    api: BotApi,
    chat_id: String,
}

impl TelegramTransport {
    pub fn new(
        token: String,
        chat_id: String,
        config: &TelegramConfig,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            api: BotApi::new(&config.api_base, token, config.request_timeout())?,
            chat_id,
        })
    }

    fn choice_markup(buttons: &[ChoiceButton]) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = buttons
            .iter()
            .map(|b| {
                serde_json::json!([{
                    "text": b.label,
                    "callback_data": b.callback_data,
                }])
            })
            .collect();
        serde_json::json!({ "inline_keyboard": rows })
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    fn max_message_chars(&self) -> usize {
        TELEGRAM_MAX_MESSAGE_CHARS
    }

    async fn send_message(&self, text: &str) -> Result<MessageHandle, TransportError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": truncate_text(text),
        });
        let sent: BotMessage = self.api.call("sendMessage", body).await?;
        Ok(MessageHandle::new(sent.message_id))
    }

    async fn edit_message(
        &self,
        handle: MessageHandle,
        text: &str,
    ) -> Result<MessageHandle, TransportError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "message_id": handle.message_id,
            "text": truncate_text(text),
        });
        // editMessageText answers with the edited message, or `true` for inline messages
        match self
            .api
            .call::<serde_json::Value>("editMessageText", body)
            .await
        {
            Ok(result) => Ok(result
                .get("message_id")
                .and_then(|v| v.as_i64())
                .map(MessageHandle::new)
                .unwrap_or(handle)),
            Err(TransportError::Rejected { description, .. })
                if description.contains("message is not modified") =>
            {
                Ok(handle)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_choice_request(
        &self,
        header: &str,
        question: &str,
        buttons: &[ChoiceButton],
    ) -> Result<MessageHandle, TransportError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": truncate_text(&format!("{}\n\n{}", header, question)),
            "reply_markup": Self::choice_markup(buttons),
        });
        let sent: BotMessage = self.api.call("sendMessage", body).await?;
        Ok(MessageHandle::new(sent.message_id))
    }

    async fn answer_callback(
        &self,
        query_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut body = serde_json::json!({ "callback_query_id": query_id });
        if let Some(text) = text {
            body["text"] = serde_json::Value::String(text.to_string());
        }
        let _: bool = self.api.call("answerCallbackQuery", body).await?;
        Ok(())
    }
}

/// Telegram update source (getUpdates long poll), restricted to callback queries.
pub struct TelegramUpdateSource {
    api: BotApi,
    /// Next offset for getUpdates (last_update_id + 1).
    next_offset: AtomicI64,
}

impl TelegramUpdateSource {
    pub fn new(token: String, config: &TelegramConfig) -> Result<Self, TransportError> {
        // The HTTP timeout must outlast the long poll itself
        let timeout = Duration::from_secs(LONG_POLL_TIMEOUT_SECS) + config.request_timeout();
        Ok(Self {
            api: BotApi::new(&config.api_base, token, timeout)?,
            next_offset: AtomicI64::new(0),
        })
    }
}

#[async_trait]
impl UpdateSource for TelegramUpdateSource {
    async fn next_updates(&self) -> Result<Vec<serde_json::Value>, TransportError> {
        let offset = self.next_offset.load(Ordering::Relaxed);
        let body = serde_json::json!({
            "offset": offset,
            "timeout": LONG_POLL_TIMEOUT_SECS,
            "allowed_updates": ["callback_query"],
        });
        let updates: Vec<serde_json::Value> = self.api.call("getUpdates", body).await?;
        let last_id = updates
            .iter()
            .filter_map(|u| u.get("update_id").and_then(|v| v.as_i64()))
            .max();
        if let Some(last_id) = last_id {
            self.next_offset.store(last_id + 1, Ordering::Relaxed);
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text_respects_limit() {
        let short = "hello";
        assert_eq!(truncate_text(short), "hello");

        let long = "x".repeat(TELEGRAM_MAX_MESSAGE_CHARS + 10);
        let truncated = truncate_text(&long);
        assert_eq!(truncated.chars().count(), TELEGRAM_MAX_MESSAGE_CHARS);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn test_choice_markup_one_button_per_row() {
        let markup = TelegramTransport::choice_markup(&[
            ChoiceButton {
                label: "yes".into(),
                callback_data: "apr:abc:0".into(),
            },
            ChoiceButton {
                label: "no".into(),
                callback_data: "apr:abc:1".into(),
            },
        ]);
        let rows = markup["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0]["text"], "no");
        assert_eq!(rows[1][0]["callback_data"], "apr:abc:1");
    }

    #[test]
    fn test_telegram_transport_name_and_url() {
        let config = TelegramConfig {
            api_base: "https://api.telegram.org/".into(),
            ..TelegramConfig::default()
        };
        let transport = TelegramTransport::new("token".into(), "chat".into(), &config).unwrap();
        assert_eq!(transport.name(), "telegram");
        assert_eq!(
            transport.api.method_url("sendMessage"),
            "https://api.telegram.org/bottoken/sendMessage"
        );
    }

    #[test]
    fn test_api_error_response_parsing() {
        let parsed: ApiResponse<BotMessage> = serde_json::from_str(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":7}}"#,
        )
        .unwrap();
        assert!(!parsed.ok);
        assert!(parsed.result.is_none());
        assert_eq!(parsed.error_code, Some(429));
        assert_eq!(parsed.parameters.and_then(|p| p.retry_after), Some(7));
    }
}
