// STOMP-over-WebSocket messaging client
// Entry point for the realtime side: one logical connection to the broker,
// frame translation, and the two broadcast streams the UI layer observes.
//
// Submodules extend `StompClient` the same way:
//   connection - connect / disconnect / subscribe / send and the read loop
//   heartbeat  - keep-alive sender and server silence watchdog
//   inbound    - tolerant JSON decoding of pushed messages
//   frame      - wire encoding
//   transport  - the WebSocket underneath

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

pub mod connection;
pub mod frame;
pub mod heartbeat;
pub mod inbound;
pub mod transport;

pub use frame::{Command, Frame, FrameError};
pub use transport::{Connector, FrameSink, FrameSource, TransportError, TransportEvent, WsConnector};

use crate::config::ClientConfig;
use crate::credentials::CredentialProvider;
use crate::models::{ConnectionState, Message};

/// Errors that can occur in the messaging client.
///
/// Public entry points (`connect`, `send_message`) report these as a boolean
/// and a log line; the `try_*` variants return them.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to open transport: {0}")]
    TransportOpen(#[source] TransportError),

    /// The broker answered with an ERROR frame
    #[error("Broker error: {0}")]
    Protocol(String),

    #[error("Failed to send frame: {0}")]
    Send(#[source] TransportError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("Connection attempt cancelled by disconnect")]
    Cancelled,

    #[error("Missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Lets the owner of the client rewrite inbound messages before they are
/// broadcast (used to reconcile optimistic sends with server echoes).
pub trait InboundHook: Send + Sync {
    fn on_message(&self, message: Message) -> Message;
}

/// Single-resolution bridge between the transport callbacks and a pending
/// `connect()`. Resolving twice is a no-op.
#[derive(Debug, Default)]
pub(crate) struct ConnectSignal {
    tx: Option<oneshot::Sender<Result<(), ClientError>>>,
}

impl ConnectSignal {
    pub(crate) fn arm() -> (Self, oneshot::Receiver<Result<(), ClientError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Returns false if the signal was already resolved
    pub(crate) fn resolve(&mut self, result: Result<(), ClientError>) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The waiter may have given up (outer timeout)
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

// Mutable connection state. Only touched under `Inner::shared` and never
// held across an await.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: ConnectionState,
    pub(crate) session_id: Option<String>,
    pub(crate) subscriptions: HashMap<String, String>, // destination -> subscription id
    // Bumped whenever a link ends; tasks and writers tagged with an older
    // generation are stale and must not touch the state.
    pub(crate) generation: u64,
    pub(crate) user_id: Option<i64>,
    pub(crate) pending: ConnectSignal,
    pub(crate) explicit_disconnect: bool,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) writer: TokioMutex<Option<(u64, Box<dyn FrameSink>)>>,
    pub(crate) hook: Mutex<Option<Arc<dyn InboundHook>>>,
    pub(crate) msg_tx: broadcast::Sender<Message>,
    pub(crate) status_tx: broadcast::Sender<bool>,
    pub(crate) lost_tx: broadcast::Sender<()>,
}

/// Cheap to clone; all clones drive the same connection
#[derive(Clone)]
pub struct StompClient {
    pub(crate) inner: Arc<Inner>,
}

impl StompClient {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (msg_tx, _) = broadcast::channel(capacity);
        let (status_tx, _) = broadcast::channel(capacity);
        let (lost_tx, _) = broadcast::channel(capacity);

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                credentials,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Idle,
                    session_id: None,
                    subscriptions: HashMap::new(),
                    generation: 0,
                    user_id: None,
                    pending: ConnectSignal::default(),
                    explicit_disconnect: false,
                    tasks: Vec::new(),
                }),
                writer: TokioMutex::new(None),
                hook: Mutex::new(None),
                msg_tx,
                status_tx,
                lost_tx,
            }),
        }
    }

    /// Production client over a real WebSocket
    pub fn with_websocket(config: ClientConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::new(config, Arc::new(WsConnector::new()), credentials)
    }

    pub(crate) fn shared(&self) -> MutexGuard<'_, Shared> {
        match self.inner.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Connection state lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.shared().generation == generation
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        self.inner.credentials.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Broker-assigned session id; only present while connected
    pub fn session_id(&self) -> Option<String> {
        let shared = self.shared();
        if shared.state.is_connected() {
            shared.session_id.clone()
        } else {
            None
        }
    }

    /// Destinations we currently hold a subscription for
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.shared().subscriptions.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn set_inbound_hook(&self, hook: Arc<dyn InboundHook>) {
        match self.inner.hook.lock() {
            Ok(mut guard) => *guard = Some(hook),
            Err(poisoned) => *poisoned.into_inner() = Some(hook),
        }
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.inner.msg_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<bool> {
        self.inner.status_tx.subscribe()
    }

    /// Inbound and locally published messages. Lagging subscribers skip
    /// what they missed.
    pub fn message_updates(&self) -> impl Stream<Item = Message> + Send + Unpin + 'static {
        BroadcastStream::new(self.subscribe_messages()).filter_map(|item| item.ok())
    }

    /// `true` when a connection is established, `false` when it ends
    pub fn connection_status(&self) -> impl Stream<Item = bool> + Send + Unpin + 'static {
        BroadcastStream::new(self.subscribe_status()).filter_map(|item| item.ok())
    }

    /// Fires when an established connection drops without `disconnect()`
    pub(crate) fn subscribe_lost(&self) -> broadcast::Receiver<()> {
        self.inner.lost_tx.subscribe()
    }

    pub(crate) fn notify_lost(&self) {
        if self.inner.lost_tx.send(()).is_err() {
            debug!("No reconnect supervisor listening");
        }
    }

    /// Publish a message on the message stream (local status updates)
    pub fn publish(&self, message: Message) {
        if self.inner.msg_tx.send(message).is_err() {
            debug!("No message subscribers");
        }
    }

    pub(crate) fn publish_inbound(&self, message: Message) {
        let hook = match self.inner.hook.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let message = match hook {
            Some(hook) => hook.on_message(message),
            None => message,
        };
        self.publish(message);
    }

    pub(crate) fn emit_status(&self, connected: bool) {
        if self.inner.status_tx.send(connected).is_err() {
            debug!("No connection status subscribers");
        }
    }
}
