// Common test utilities for integration tests
// An in-memory broker connection that tests can script: feed inbound
// frames, inspect what the client wrote, and make opens or sends fail.
#![allow(dead_code)]

use async_trait::async_trait;
use log::LevelFilter;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::sync::mpsc;
use tokio::time::Instant;

use collaboraid_chat::{
    config::ClientConfig,
    credentials::SessionCredentials,
    messaging::MessagingService,
    stomp::{
        Command, Connector, Frame, FrameSink, FrameSource, StompClient, TransportError,
        TransportEvent,
    },
};

pub const TOKEN: &str = "test-token-abcdefghijkl";
pub const USER_ID: i64 = 42;
pub const USERNAME: &str = "alice";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

#[derive(Default)]
struct MockState {
    opens: AtomicUsize,
    open_times: Mutex<Vec<Instant>>,
    fail_opens: AtomicUsize,
    manual_ack: AtomicBool,
    // SEND frames still allowed to succeed; None means unlimited
    send_budget: Mutex<Option<usize>>,
    sent: Mutex<Vec<String>>,
    closes: AtomicUsize,
    // Fail the link right after the next SEND is written
    drop_on_send: AtomicBool,
    link: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

/// Scriptable stand-in for the broker's WebSocket endpoint
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop answering CONNECT automatically; tests send CONNECTED themselves
    pub fn manual_ack(&self) {
        self.state.manual_ack.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.fail_opens.store(count, Ordering::SeqCst);
    }

    /// Let `count` more SEND frames through, then fail the rest
    pub fn fail_sends_after(&self, count: usize) {
        *self.state.send_budget.lock().unwrap() = Some(count);
    }

    /// The next SEND goes through, then the link fails under it
    pub fn drop_link_on_next_send(&self) {
        self.state.drop_on_send.store(true, Ordering::SeqCst);
    }

    pub fn allow_sends(&self) {
        *self.state.send_budget.lock().unwrap() = None;
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.state.open_times.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Every text the client wrote successfully, in order
    pub fn sent(&self) -> Vec<String> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn sent_frames(&self, command: Command) -> Vec<Frame> {
        self.sent()
            .iter()
            .filter_map(|text| Frame::decode(text).ok().flatten())
            .filter(|frame| frame.command == command)
            .collect()
    }

    /// JSON bodies of the SEND frames written so far
    pub fn sent_messages(&self) -> Vec<serde_json::Value> {
        self.sent_frames(Command::Send)
            .iter()
            .map(|frame| serde_json::from_str(&frame.body).unwrap())
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.sent().iter().filter(|text| text.as_str() == "\n").count()
    }

    pub fn inject(&self, event: TransportEvent) {
        if let Some(tx) = self.state.link.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn inject_text(&self, text: &str) {
        self.inject(TransportEvent::Text(text.to_string()));
    }

    pub fn ack(&self, session: &str) {
        self.inject_text(&connected_frame(session));
    }

    pub fn inject_message(&self, json: &str) {
        self.inject_text(&message_frame(json));
    }

    /// Simulate the network dropping the current link
    pub fn drop_link(&self) {
        self.inject(TransportEvent::Failed("connection reset by peer".to_string()));
    }
}

pub fn connected_frame(session: &str) -> String {
    format!("CONNECTED\nversion:1.1\nheart-beat:0,0\nsession:{}\n\n\0", session)
}

pub fn message_frame(json: &str) -> String {
    format!(
        "MESSAGE\ndestination:/topic/messages/{}\nsubscription:sub-0\nmessage-id:m-1\ncontent-type:application/json\n\n{}\0",
        USER_ID, json
    )
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        _url: &str,
        _token: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let state = &self.state;
        let attempt = state.opens.fetch_add(1, Ordering::SeqCst) + 1;
        state.open_times.lock().unwrap().push(Instant::now());

        let remaining = state.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            state.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Open("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *state.link.lock().unwrap() = Some(tx.clone());
        Ok((
            Box::new(MockSink {
                state: self.state.clone(),
                link: tx,
                session: format!("session-{}", attempt),
            }),
            Box::new(MockSource { rx }),
        ))
    }
}

struct MockSink {
    state: Arc<MockState>,
    link: mpsc::UnboundedSender<TransportEvent>,
    session: String,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if text.starts_with("SEND\n") {
            let mut budget = self.state.send_budget.lock().unwrap();
            match budget.as_mut() {
                Some(0) => return Err(TransportError::Write("broken pipe".to_string())),
                Some(n) => *n -= 1,
                None => {}
            }
        }

        let is_connect = text.starts_with("CONNECT\n");
        let is_send = text.starts_with("SEND\n");
        self.state.sent.lock().unwrap().push(text);
        if is_connect && !self.state.manual_ack.load(Ordering::SeqCst) {
            let _ = self.link.send(TransportEvent::Text(connected_frame(&self.session)));
        }
        if is_send && self.state.drop_on_send.swap(false, Ordering::SeqCst) {
            let _ = self
                .link
                .send(TransportEvent::Failed("connection reset by peer".to_string()));
            // Let the reader see the failure before the caller continues
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        url: "ws://broker.test/ws/websocket".to_string(),
        ..ClientConfig::default()
    }
}

pub fn test_credentials() -> Arc<SessionCredentials> {
    Arc::new(SessionCredentials::new(TOKEN, USER_ID, USERNAME))
}

pub fn setup_client(mock: &MockConnector) -> StompClient {
    setup_client_with(mock, test_config())
}

pub fn setup_client_with(mock: &MockConnector, config: ClientConfig) -> StompClient {
    setup_logging();
    StompClient::new(config, Arc::new(mock.clone()), test_credentials())
}

pub fn setup_service(mock: &MockConnector) -> MessagingService {
    MessagingService::new(setup_client(mock))
}

/// Let spawned tasks run until `condition` holds. Does not advance time.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..1_000 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    condition()
}
