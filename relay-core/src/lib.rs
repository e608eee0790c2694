//! # Relay Core Library
//!
//! Notification batching, rate-limited delivery and blocking operator approvals
//! over a chat-bot transport.

pub mod models;
pub mod relay;
pub mod services;
pub mod transport;

pub use relay::Relay;
