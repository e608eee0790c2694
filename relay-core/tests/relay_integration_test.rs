//! End-to-end tests of the relay facade over the in-memory transport

use relay_core::models::{ApprovalOption, ApprovalOutcome, Priority, RelayConfig};
use relay_core::relay::{AddOutcome, FlushOutcome, Relay, RelayError};
use relay_core::transport::{MemoryTransport, MemoryUpdateSource, SentMessage, UpdateSource};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const CHAT: &str = "42";

fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.telegram.chat_id = Some(CHAT.to_string());
    config.delivery.retry_attempts = 2;
    config.delivery.retry_base_delay_ms = 100;
    config
}

fn relay(transport: &MemoryTransport) -> Arc<Relay> {
    Arc::new(Relay::new(config(), Arc::new(transport.clone())))
}

fn press(callback_data: &str, chat: &str) -> serde_json::Value {
    json!({
        "update_id": 900,
        "callback_query": {
            "id": "query-1",
            "from": { "id": 5, "is_bot": false, "first_name": "Operator" },
            "message": { "message_id": 1, "chat": { "id": chat, "type": "private" } },
            "data": callback_data,
        }
    })
}

/// Callback data of the nth button of the most recent choice request
async fn wait_for_button(transport: &MemoryTransport, nth: usize) -> String {
    loop {
        let button = transport.sent().into_iter().rev().find_map(|m| match m {
            SentMessage::Choice { buttons, .. } => buttons.get(nth).map(|b| b.callback_data.clone()),
            _ => None,
        });
        if let Some(data) = button {
            return data;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_normal_notifications_are_combined_after_window() {
    let transport = MemoryTransport::new();
    let relay = relay(&transport);

    assert_eq!(
        relay.notify("build started", Priority::Normal).await,
        AddOutcome::Queued { forced_flush: false }
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    relay.notify("tests passed", Priority::Normal).await;
    assert!(transport.sent().is_empty());

    tokio::time::sleep(Duration::from_millis(4100)).await;
    let texts = transport.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("📬 2 notifications"));
    let started = texts[0].find("build started").unwrap();
    let passed = texts[0].find("tests passed").unwrap();
    assert!(started < passed);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_pushes_queue_out_first() {
    let transport = MemoryTransport::new();
    let relay = relay(&transport);

    relay.notify("queued one", Priority::Normal).await;
    relay.notify("queued two", Priority::Normal).await;
    let outcome = relay.notify("disk full", Priority::High).await;
    assert!(matches!(outcome, AddOutcome::Delivered(_)));

    let texts = transport.texts();
    assert_eq!(texts.len(), 2);
    assert!(texts[0].contains("queued one") && texts[0].contains("queued two"));
    assert_eq!(texts[1], "disk full");

    // The window timer was disarmed by the drain
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.texts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_operator_choice_reaches_blocked_caller() {
    let transport = MemoryTransport::new();
    let relay = relay(&transport);
    let updates = Arc::new(MemoryUpdateSource::new());
    let listener = relay.spawn_update_listener(updates.clone());

    let request = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .request_approval(
                    "Merge release branch?",
                    vec![ApprovalOption::new("Merge"), ApprovalOption::new("Hold")],
                    Some(Duration::from_secs(120)),
                )
                .await
        })
    };

    let data = wait_for_button(&transport, 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    updates.push(press(&data, CHAT));

    let outcome = request.await.unwrap().unwrap();
    assert_eq!(outcome.chosen().map(|o| o.label.as_str()), Some("Hold"));
    assert_eq!(transport.answered().len(), 1);
    assert!(transport
        .texts()
        .iter()
        .any(|t| t.contains("✅ Selected: Hold")));
    listener.abort();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_approval_times_out() {
    let transport = MemoryTransport::new();
    let relay = relay(&transport);

    let start = Instant::now();
    let outcome = relay
        .request_approval(
            "Rotate keys?",
            vec![ApprovalOption::new("Yes")],
            Some(Duration::from_secs(3)),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ApprovalOutcome::TimedOut);
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(relay.approvals().live_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_callback_from_other_chat_does_not_resolve() {
    let transport = MemoryTransport::new();
    let relay = relay(&transport);

    let request = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .request_approval(
                    "Wipe cache?",
                    vec![ApprovalOption::new("Yes")],
                    Some(Duration::from_secs(2)),
                )
                .await
        })
    };
    let data = wait_for_button(&transport, 0).await;
    assert!(!relay.handle_callback(&press(&data, "31337")).await);

    let outcome = request.await.unwrap().unwrap();
    assert_eq!(outcome, ApprovalOutcome::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_and_releases_waiters() {
    let transport = MemoryTransport::new();
    let relay = relay(&transport);

    relay.notify("last words", Priority::Normal).await;
    let request = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .request_approval("Proceed?", vec![ApprovalOption::new("Go")], None)
                .await
        })
    };
    wait_for_button(&transport, 0).await;

    let report = relay.shutdown().await.unwrap();
    assert!(matches!(report.flushed, FlushOutcome::Sent { count: 1, .. }));
    assert_eq!(report.cancelled_approvals, 1);
    assert_eq!(request.await.unwrap().unwrap(), ApprovalOutcome::Cancelled);
    assert!(relay.shutdown().await.is_none());

    let late = relay
        .request_approval("Again?", vec![ApprovalOption::new("Go")], None)
        .await;
    assert!(matches!(late, Err(RelayError::ShuttingDown)));

    // Notifications after shutdown skip the queue
    let late = relay.notify("straggler", Priority::Normal).await;
    assert!(matches!(late, AddOutcome::Delivered(_)));
    assert_eq!(transport.texts().last().map(String::as_str), Some("straggler"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_through_facade() {
    let transport = MemoryTransport::new();
    transport.fail_next(1, relay_core::transport::TransportError::Timeout);
    let relay = relay(&transport);

    let outcome = relay.notify("urgent", Priority::High).await;
    assert!(matches!(outcome, AddOutcome::Delivered(_)));
    assert_eq!(transport.attempts(), 2);
}

/// Bodies in the order a reader of the chat first sees them
fn delivery_order(sent: &[SentMessage]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for message in sent {
        for word in message.text().split_whitespace() {
            let is_body = word.len() == 3
                && word.starts_with('n')
                && word[1..].chars().all(|c| c.is_ascii_digit());
            if is_body && seen.insert(word.to_string()) {
                order.push(word.to_string());
            }
        }
    }
    order
}

#[tokio::test(start_paused = true)]
async fn test_mixed_priorities_preserve_insertion_order() {
    let transport = MemoryTransport::new();
    let mut config = config();
    config.batch.max_queue_size = 4;
    let relay = Relay::new(config, Arc::new(transport.clone()));

    let bodies: Vec<String> = (0..30).map(|i| format!("n{:02}", i)).collect();
    for (i, body) in bodies.iter().enumerate() {
        let priority = if i % 7 == 6 {
            Priority::High
        } else {
            Priority::Normal
        };
        relay.notify(body.clone(), priority).await;
        tokio::time::sleep(Duration::from_millis(700 * (i as u64 % 3))).await;
    }
    relay.flush().await;

    assert_eq!(delivery_order(&transport.sent()), bodies);
}

#[tokio::test]
async fn test_update_source_delivers_pushed_payloads() {
    let source = MemoryUpdateSource::new();
    source.push(json!({ "update_id": 1 }));
    let updates = source.next_updates().await.unwrap();
    assert_eq!(updates, vec![json!({ "update_id": 1 })]);
}
