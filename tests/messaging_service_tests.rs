// MessagingService tests: reconnects, backoff, the offline queue and delivery status
// Timing-sensitive tests run on paused tokio time, which jumps straight to
// the next timer whenever every task is idle.

mod common;
use common::{setup_service, wait_until, MockConnector, USER_ID};

use std::time::Duration;
use tokio::sync::broadcast;

use collaboraid_chat::messaging::delivery::DEFAULT_OUTBOX_CAPACITY;
use collaboraid_chat::models::{ConnectionState, DeliveryStatus, Message};
use collaboraid_chat::stomp::Command;

fn drain_updates(rx: &mut broadcast::Receiver<Message>) -> Vec<Message> {
    let mut updates = Vec::new();
    while let Ok(message) = rx.try_recv() {
        updates.push(message);
    }
    updates
}

fn statuses_for(updates: &[Message], content: &str) -> Vec<DeliveryStatus> {
    updates
        .iter()
        .filter(|m| m.content == content)
        .map(|m| m.delivery_status)
        .collect()
}

// Paused time advances in whole milliseconds
fn assert_about(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(50),
        "expected about {:?}, got {:?}",
        expected,
        actual
    );
}

fn sent_contents(mock: &MockConnector) -> Vec<String> {
    mock.sent_messages()
        .iter()
        .map(|body| body["content"].as_str().unwrap_or_default().to_string())
        .collect()
}

//------------------------------------------------------------------------------
// CONNECTING AND BACKOFF
//------------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_uses_provider_credentials() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);

    assert!(service.connect().await);
    assert!(service.is_connected());
    assert_eq!(service.connection_attempts(), 0);

    let connect = &mock.sent_frames(Command::Connect)[0];
    assert_eq!(connect.get_header("userId"), Some("42"));
    assert!(connect
        .get_header("Authorization")
        .is_some_and(|auth| auth.starts_with("Bearer test-token")));

    // Already connected: nothing new is opened
    assert!(service.connect().await);
    assert_eq!(mock.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_sequence_and_give_up() {
    let mock = MockConnector::new();
    mock.fail_next_opens(100);
    let service = setup_service(&mock);

    println!("\n=== Testing reconnect backoff ===");
    assert!(!service.connect().await);
    assert_eq!(mock.opens(), 3);
    assert_eq!(service.connection_attempts(), 3);

    let times = mock.open_times();
    assert_about(times[1] - times[0], Duration::from_secs(1));
    assert_about(times[2] - times[1], Duration::from_secs(2));

    // Gave up: no further attempts on its own
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(mock.opens(), 3);

    // An explicit connect starts a fresh set of attempts
    assert!(!service.connect().await);
    assert_eq!(mock.opens(), 6);
    let times = mock.open_times();
    assert_about(times[4] - times[3], Duration::from_secs(1));
    println!("✅ Backoff followed 1s, 2s and stopped after 3 attempts");
}

#[tokio::test(start_paused = true)]
async fn test_success_after_retries_resets_counter() {
    let mock = MockConnector::new();
    mock.fail_next_opens(2);
    let service = setup_service(&mock);

    assert!(service.connect().await);
    assert_eq!(mock.opens(), 3);
    assert_eq!(service.connection_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_deadline_counts_as_failure() {
    let mock = MockConnector::new();
    mock.manual_ack();
    let service = setup_service(&mock);

    let started = tokio::time::Instant::now();
    assert!(!service.connect().await);

    // Three 15s deadlines plus 1s and 2s of backoff
    assert_about(started.elapsed(), Duration::from_secs(48));
    assert_eq!(mock.opens(), 3);
    assert_eq!(service.client().state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_service_connect_is_rejected() {
    let mock = MockConnector::new();
    mock.manual_ack();
    let service = setup_service(&mock);

    let first = {
        let service = service.clone();
        tokio::spawn(async move { service.connect().await })
    };
    assert!(wait_until(|| mock.opens() == 1).await);

    assert!(!service.connect().await);
    assert_eq!(mock.opens(), 1);

    mock.ack("s-1");
    assert!(first.await.unwrap());
    assert_eq!(mock.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_retries() {
    let mock = MockConnector::new();
    mock.fail_next_opens(100);
    let service = setup_service(&mock);

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.connect().await })
    };
    assert!(wait_until(|| mock.opens() == 1).await);

    service.disconnect().await;
    assert!(!pending.await.unwrap());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(mock.opens(), 1);
    assert_eq!(service.client().state(), ConnectionState::Idle);
}

//------------------------------------------------------------------------------
// AUTOMATIC RECONNECT
//------------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_connection_loss() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    let mut status = service.client().subscribe_status();

    assert!(service.connect().await);
    mock.drop_link();

    assert!(wait_until(|| mock.opens() == 2 && service.is_connected()).await);
    assert_eq!(status.try_recv(), Ok(true));
    assert_eq!(status.try_recv(), Ok(false));
    assert_eq!(status.try_recv(), Ok(true));

    // The new session subscribes to the topic again
    assert_eq!(mock.sent_frames(Command::Subscribe).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_loss_gives_up_after_three_attempts() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    assert!(service.connect().await);

    mock.fail_next_opens(100);
    mock.drop_link();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(mock.opens(), 1 + 3);
    assert!(!service.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_link_lost_while_draining_queue_reconnects() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    service.enqueue(7, "a").await;
    service.enqueue(7, "b").await;

    // The link fails right after "a" is written
    mock.drop_link_on_next_send();
    assert!(!service.connect().await);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(mock.opens(), 2);
    assert!(service.is_connected());
    assert_eq!(service.queued_len().await, 0);
    assert_eq!(sent_contents(&mock), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_does_not_reconnect() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    assert!(service.connect().await);

    service.disconnect().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(mock.opens(), 1);
    assert_eq!(service.client().state(), ConnectionState::Idle);
}

//------------------------------------------------------------------------------
// SENDING AND THE OFFLINE QUEUE
//------------------------------------------------------------------------------

#[tokio::test]
async fn test_send_while_connected() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    let mut updates = service.client().subscribe_messages();
    assert!(service.connect().await);

    assert!(service.send_message(7, "hello").await);
    assert_eq!(service.queued_len().await, 0);

    let sent = mock.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["receiver"]["id"], 7);
    assert_eq!(sent[0]["sender"]["id"], USER_ID);

    let updates = drain_updates(&mut updates);
    assert_eq!(
        statuses_for(&updates, "hello"),
        vec![DeliveryStatus::Sending, DeliveryStatus::Sent]
    );
    let local_id = updates[0].client_temp_id.clone();
    assert!(local_id.is_some());
    assert_eq!(sent[0]["tempId"].as_str(), local_id.as_deref());
}

#[tokio::test]
async fn test_server_echo_is_reconciled() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    let mut updates = service.client().subscribe_messages();
    assert!(service.connect().await);

    assert!(service.send_message(7, "ping").await);
    let wire_id = mock.sent_messages()[0]["tempId"].as_str().unwrap().to_string();
    assert_eq!(service.outbox().len(), 1);

    mock.inject_message(&format!(
        r#"{{"id":99,"tempId":"{}","senderId":42,"receiverId":7,"content":"ping","status":"DELIVERED"}}"#,
        wire_id
    ));
    assert!(wait_until(|| service.outbox().is_empty()).await);

    let echo = drain_updates(&mut updates)
        .into_iter()
        .find(|m| m.id == Some(99))
        .unwrap();
    assert_eq!(echo.client_temp_id.as_deref(), Some(wire_id.as_str()));
    assert_eq!(echo.delivery_status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn test_echo_without_temp_id_is_reconciled() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    let mut updates = service.client().subscribe_messages();
    assert!(service.connect().await);

    assert!(service.send_message(7, "ping").await);
    let local_id = mock.sent_messages()[0]["tempId"].as_str().unwrap().to_string();

    // The broker copies the message to the sender's topic without its tempId
    mock.inject_message(r#"{"id":100,"senderId":42,"receiverId":7,"content":"ping"}"#);
    assert!(wait_until(|| service.outbox().is_empty()).await);

    let echo = drain_updates(&mut updates)
        .into_iter()
        .find(|m| m.id == Some(100))
        .unwrap();
    assert_eq!(echo.client_temp_id.as_deref(), Some(local_id.as_str()));
}

#[tokio::test]
async fn test_outbox_stays_bounded_without_echoes() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    assert!(service.connect().await);

    for i in 0..DEFAULT_OUTBOX_CAPACITY + 50 {
        assert!(service.send_message(7, &format!("message {}", i)).await);
    }
    assert_eq!(service.outbox().len(), DEFAULT_OUTBOX_CAPACITY);
}

#[tokio::test]
async fn test_write_failure_queues_message() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    let mut updates = service.client().subscribe_messages();
    assert!(service.connect().await);

    mock.fail_sends_after(0);
    assert!(!service.send_message(7, "lost?").await);
    assert_eq!(service.queued_len().await, 1);
    assert_eq!(
        statuses_for(&drain_updates(&mut updates), "lost?"),
        vec![DeliveryStatus::Sending, DeliveryStatus::Failed]
    );

    // Not lost: the next drain sends it
    mock.allow_sends();
    assert_eq!(service.drain_queue().await, 1);
    assert_eq!(sent_contents(&mock), vec!["lost?".to_string()]);
    assert_eq!(
        statuses_for(&drain_updates(&mut updates), "lost?"),
        vec![DeliveryStatus::Sent]
    );
}

#[tokio::test(start_paused = true)]
async fn test_offline_messages_drain_in_order() {
    let mock = MockConnector::new();
    mock.fail_next_opens(6);
    let service = setup_service(&mock);
    let mut updates = service.client().subscribe_messages();

    println!("\n=== Testing offline queue ===");
    assert!(!service.send_message(7, "one").await);
    assert!(!service.send_message(8, "two").await);
    assert_eq!(service.queued_len().await, 2);
    assert!(mock.sent_messages().is_empty());

    let queued: Vec<String> = service.queued().await.into_iter().map(|q| q.content).collect();
    assert_eq!(queued, vec!["one".to_string(), "two".to_string()]);

    assert!(service.connect().await);
    assert_eq!(service.queued_len().await, 0);
    assert_eq!(sent_contents(&mock), vec!["one".to_string(), "two".to_string()]);

    let updates = drain_updates(&mut updates);
    assert_eq!(
        statuses_for(&updates, "one"),
        vec![DeliveryStatus::Sending, DeliveryStatus::Queued, DeliveryStatus::Sent]
    );

    // Drained items go out under a fresh tempId
    let local_id = updates
        .iter()
        .find(|m| m.content == "one")
        .and_then(|m| m.client_temp_id.clone())
        .unwrap();
    let wire_id = mock.sent_messages()[0]["tempId"].as_str().unwrap().to_string();
    assert_ne!(local_id, wire_id);
    println!("✅ Queue drained in FIFO order");
}

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected_reconnects() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);

    // The send itself triggers the connection and is drained right away
    assert!(service.send_message(7, "wake up").await);
    assert!(service.is_connected());
    assert_eq!(sent_contents(&mock), vec!["wake up".to_string()]);
    assert_eq!(service.queued_len().await, 0);
}

#[tokio::test]
async fn test_drain_stops_at_first_failure() {
    let mock = MockConnector::new();
    let service = setup_service(&mock);
    service.enqueue(1, "a").await;
    service.enqueue(2, "b").await;
    service.enqueue(3, "c").await;

    mock.fail_sends_after(1);
    assert!(service.connect().await);

    assert_eq!(sent_contents(&mock), vec!["a".to_string()]);
    let remaining: Vec<String> = service.queued().await.into_iter().map(|q| q.content).collect();
    assert_eq!(remaining, vec!["b".to_string(), "c".to_string()]);

    mock.allow_sends();
    assert_eq!(service.drain_queue().await, 2);
    assert_eq!(
        sent_contents(&mock),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_drained_message_is_sent_exactly_once() {
    let mock = MockConnector::new();
    mock.fail_next_opens(3);
    let service = setup_service(&mock);

    assert!(!service.send_message(7, "once").await);
    assert!(service.connect().await);
    assert_eq!(sent_contents(&mock), vec!["once".to_string()]);

    // Later drains and reconnects do not send it again
    assert_eq!(service.drain_queue().await, 0);
    mock.drop_link();
    assert!(wait_until(|| mock.opens() == 5 && service.is_connected()).await);
    assert_eq!(sent_contents(&mock), vec!["once".to_string()]);
    assert_eq!(service.queued_len().await, 0);
}
