//! Inbound callback parsing: untrusted update payloads into a tagged event

use crate::models::ApprovalId;
use serde::Deserialize;

const CALLBACK_PREFIX: &str = "apr";

/// Callback data attached to the choice button at `index` of approval `id`.
pub fn encode_callback_data(id: ApprovalId, index: usize) -> String {
    format!("{}:{}:{}", CALLBACK_PREFIX, id, index)
}

/// Parse result of one inbound update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    /// A choice control press addressed to an approval
    Valid {
        approval_id: ApprovalId,
        option_index: usize,
        /// Transport id of the callback query, used to acknowledge it
        query_id: String,
        /// Chat the press came from, when the payload carries it
        chat_id: Option<String>,
    },
    /// A well-formed update that is not a callback (e.g. a plain text message)
    Unrelated,
    /// Anything that could not be understood
    Malformed(String),
}

#[derive(Deserialize)]
struct Update {
    #[serde(default)]
    callback_query: Option<CallbackQuery>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    id: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message: Option<CallbackMessage>,
}

#[derive(Deserialize)]
struct CallbackMessage {
    chat: Chat,
}

#[derive(Deserialize)]
struct Chat {
    id: serde_json::Value,
}

fn parse_data(data: &str) -> Result<(ApprovalId, usize), String> {
    let mut parts = data.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(CALLBACK_PREFIX), Some(id), Some(index)) => {
            let id = id
                .parse::<ApprovalId>()
                .map_err(|e| format!("bad approval id: {}", e))?;
            let index = index
                .parse::<usize>()
                .map_err(|e| format!("bad option index: {}", e))?;
            Ok((id, index))
        }
        _ => Err(format!("unrecognised callback data '{}'", data)),
    }
}

fn chat_id_string(id: &serde_json::Value) -> Option<String> {
    match id {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

impl CallbackEvent {
    /// Parse a raw JSON update body
    pub fn from_json_str(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => Self::from_value(&value),
            Err(e) => CallbackEvent::Malformed(format!("invalid JSON: {}", e)),
        }
    }

    /// Parse an already-decoded update
    pub fn from_value(raw: &serde_json::Value) -> Self {
        let update = match Update::deserialize(raw) {
            Ok(update) => update,
            Err(e) => return CallbackEvent::Malformed(format!("unexpected update shape: {}", e)),
        };
        let Some(query) = update.callback_query else {
            return CallbackEvent::Unrelated;
        };
        let Some(data) = query.data.as_deref() else {
            return CallbackEvent::Malformed("callback query without data".to_string());
        };
        match parse_data(data) {
            Ok((approval_id, option_index)) => CallbackEvent::Valid {
                approval_id,
                option_index,
                query_id: query.id,
                chat_id: query.message.and_then(|m| chat_id_string(&m.chat.id)),
            },
            Err(reason) => CallbackEvent::Malformed(reason),
        }
    }
}
