//! Approval request data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(Uuid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

/// Rendered without hyphens so callback data stays within the 64 byte limit.
impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for ApprovalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for ApprovalId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// One choice offered to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOption {
    /// Button label shown in chat
    pub label: String,
    /// Value handed back to the caller (defaults to the label)
    pub value: String,
}

impl ApprovalOption {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            value: label.clone(),
            label,
        }
    }

    pub fn with_value(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

impl From<&str> for ApprovalOption {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

/// Lifecycle of a pending approval. Every state except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Resolved,
    Expired,
    Evicted,
    Cancelled,
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

/// Final result handed to the waiting caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// The operator picked an option
    Chosen(ApprovalOption),
    /// Nobody answered before the deadline
    TimedOut,
    /// Displaced by a newer request while the coordinator was at capacity
    Evicted,
    /// Released by shutdown
    Cancelled,
    /// No such request (already consumed, swept, or never issued)
    NotFound,
}

impl ApprovalOutcome {
    pub fn chosen(&self) -> Option<&ApprovalOption> {
        match self {
            ApprovalOutcome::Chosen(option) => Some(option),
            _ => None,
        }
    }

    /// Short machine-friendly name, used in logs and CLI JSON output
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalOutcome::Chosen(_) => "chosen",
            ApprovalOutcome::TimedOut => "timed_out",
            ApprovalOutcome::Evicted => "evicted",
            ApprovalOutcome::Cancelled => "cancelled",
            ApprovalOutcome::NotFound => "not_found",
        }
    }
}

/// Result of issuing an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalTicket {
    pub id: ApprovalId,
    /// Request displaced to make room for this one, if the coordinator was full
    pub evicted: Option<ApprovalId>,
}

/// Read-only view of a pending approval
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalSummary {
    pub id: ApprovalId,
    pub question: String,
    pub options: Vec<ApprovalOption>,
    pub state: ApprovalState,
    pub created_at: DateTime<Utc>,
}
