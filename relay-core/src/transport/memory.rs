//! In-process transport that records everything it is asked to deliver.
//!
//! Used by tests and by embedders that want to observe relay traffic without a chat service.
//! Failures can be scripted so retry and fallback paths are reachable.

use crate::models::MessageHandle;
use crate::transport::{
    ChatTransport, ChoiceButton, TransportError, UpdateSource, DEFAULT_MAX_MESSAGE_CHARS,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// A successful delivery observed by [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessage {
    Text {
        handle: MessageHandle,
        text: String,
    },
    Edit {
        handle: MessageHandle,
        text: String,
    },
    Choice {
        handle: MessageHandle,
        header: String,
        question: String,
        buttons: Vec<ChoiceButton>,
    },
}

impl SentMessage {
    pub fn handle(&self) -> MessageHandle {
        match self {
            SentMessage::Text { handle, .. }
            | SentMessage::Edit { handle, .. }
            | SentMessage::Choice { handle, .. } => *handle,
        }
    }

    /// Text as it would appear in chat
    pub fn text(&self) -> String {
        match self {
            SentMessage::Text { text, .. } | SentMessage::Edit { text, .. } => text.clone(),
            SentMessage::Choice {
                header, question, ..
            } => format!("{}\n\n{}", header, question),
        }
    }

    pub fn is_edit(&self) -> bool {
        matches!(self, SentMessage::Edit { .. })
    }
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    attempts: usize,
    sent: Vec<SentMessage>,
    contents: HashMap<MessageHandle, String>,
    answered: Vec<(String, Option<String>)>,
    scripted_failures: VecDeque<TransportError>,
    edit_failure: Option<TransportError>,
}

/// Recording transport. Cloning shares the recording.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    max_message_chars: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        }
    }

    pub fn with_max_message_chars(mut self, max: usize) -> Self {
        self.max_message_chars = max;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not hide the recording from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` calls of any kind with `error`.
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.scripted_failures.push_back(error.clone());
        }
    }

    /// Fail every edit with `error` until cleared with `None`.
    pub fn fail_edits(&self, error: Option<TransportError>) {
        self.lock().edit_failure = error;
    }

    /// Successful deliveries in order
    pub fn sent(&self) -> Vec<SentMessage> {
        self.lock().sent.clone()
    }

    /// Texts of successful deliveries in order
    pub fn texts(&self) -> Vec<String> {
        self.lock().sent.iter().map(SentMessage::text).collect()
    }

    /// Current text of a message, reflecting edits
    pub fn message_text(&self, handle: MessageHandle) -> Option<String> {
        self.lock().contents.get(&handle).cloned()
    }

    /// Every call made, including failed ones
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Callback queries acknowledged so far
    pub fn answered(&self) -> Vec<(String, Option<String>)> {
        self.lock().answered.clone()
    }

    fn begin_call(&self, state: &mut MemoryState) -> Result<(), TransportError> {
        state.attempts += 1;
        match state.scripted_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_handle(state: &mut MemoryState) -> MessageHandle {
        state.next_id += 1;
        MessageHandle::new(state.next_id)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn max_message_chars(&self) -> usize {
        self.max_message_chars
    }

    async fn send_message(&self, text: &str) -> Result<MessageHandle, TransportError> {
        let mut state = self.lock();
        self.begin_call(&mut state)?;
        let handle = Self::next_handle(&mut state);
        state.contents.insert(handle, text.to_string());
        state.sent.push(SentMessage::Text {
            handle,
            text: text.to_string(),
        });
        Ok(handle)
    }

    async fn edit_message(
        &self,
        handle: MessageHandle,
        text: &str,
    ) -> Result<MessageHandle, TransportError> {
        let mut state = self.lock();
        self.begin_call(&mut state)?;
        if let Some(error) = state.edit_failure.clone() {
            return Err(error);
        }
        if !state.contents.contains_key(&handle) {
            return Err(TransportError::Rejected {
                status: 400,
                description: format!("message {} not found", handle),
            });
        }
        state.contents.insert(handle, text.to_string());
        state.sent.push(SentMessage::Edit {
            handle,
            text: text.to_string(),
        });
        Ok(handle)
    }

    async fn send_choice_request(
        &self,
        header: &str,
        question: &str,
        buttons: &[ChoiceButton],
    ) -> Result<MessageHandle, TransportError> {
        let mut state = self.lock();
        self.begin_call(&mut state)?;
        let handle = Self::next_handle(&mut state);
        state
            .contents
            .insert(handle, format!("{}\n\n{}", header, question));
        state.sent.push(SentMessage::Choice {
            handle,
            header: header.to_string(),
            question: question.to_string(),
            buttons: buttons.to_vec(),
        });
        Ok(handle)
    }

    async fn answer_callback(
        &self,
        query_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError> {
        self.lock()
            .answered
            .push((query_id.to_string(), text.map(str::to_string)));
        Ok(())
    }
}

/// Update source fed by hand; `push` delivers one raw payload per `next_updates` call.
pub struct MemoryUpdateSource {
    tx: mpsc::UnboundedSender<serde_json::Value>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<serde_json::Value>>,
}

impl MemoryUpdateSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn push(&self, update: serde_json::Value) {
        // The receiver lives as long as self
        let _ = self.tx.send(update);
    }
}

impl Default for MemoryUpdateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateSource for MemoryUpdateSource {
    async fn next_updates(&self) -> Result<Vec<serde_json::Value>, TransportError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(update) => Ok(vec![update]),
            None => Ok(Vec::new()),
        }
    }
}
