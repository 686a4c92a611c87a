// Messaging service: the caller-side policy around StompClient
//
// Owns what the UI layer should not have to think about: reading fresh
// credentials, the connect deadline, bounded reconnects with backoff, the
// offline send queue and optimistic delivery status updates.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use uuid::Uuid;

pub mod delivery;
pub mod queue;
pub mod reconnect;

pub use delivery::Outbox;
pub use queue::PendingSendQueue;
pub use reconnect::{ReconnectPolicy, ReconnectState};

use crate::models::{now_timestamp, DeliveryStatus, Message, QueuedMessage};
use crate::stomp::inbound::UNKNOWN_USERNAME;
use crate::stomp::{ClientError, StompClient};

struct ServiceInner {
    client: StompClient,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    queue: TokioMutex<PendingSendQueue>,
    outbox: Arc<Outbox>,
    reconnect: Mutex<ReconnectState>,
    // A session of connection attempts is running
    connecting: AtomicBool,
    // The link dropped while a session was running; raised again when it ends
    lost_while_busy: AtomicBool,
    // Bumped by disconnect(); attempt loops started under an older epoch stop
    cancel_epoch: watch::Sender<u64>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.supervisor.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

// Ends a session of attempts, even if the connect future is dropped
struct SessionGuard<'a> {
    inner: &'a ServiceInner,
    epoch: u64,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let inner = self.inner;
        inner.connecting.store(false, Ordering::SeqCst);
        if inner.lost_while_busy.swap(false, Ordering::SeqCst)
            && !inner.client.is_connected()
            && *inner.cancel_epoch.borrow() == self.epoch
        {
            debug!("Link dropped during a connection attempt, raising it again");
            inner.client.notify_lost();
        }
    }
}

#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<ServiceInner>,
}

impl MessagingService {
    pub fn new(client: StompClient) -> Self {
        let policy = ReconnectPolicy::from_config(client.config());
        let connect_timeout = client.config().connect_timeout();
        let outbox = Arc::new(Outbox::new());
        client.set_inbound_hook(outbox.clone());
        let (cancel_epoch, _) = watch::channel(0u64);

        Self {
            inner: Arc::new(ServiceInner {
                client,
                policy,
                connect_timeout,
                queue: TokioMutex::new(PendingSendQueue::new()),
                outbox,
                reconnect: Mutex::new(ReconnectState::default()),
                connecting: AtomicBool::new(false),
                lost_while_busy: AtomicBool::new(false),
                cancel_epoch,
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn client(&self) -> &StompClient {
        &self.inner.client
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    pub fn message_updates(&self) -> impl Stream<Item = Message> + Send + Unpin + 'static {
        self.inner.client.message_updates()
    }

    pub fn connection_status(&self) -> impl Stream<Item = bool> + Send + Unpin + 'static {
        self.inner.client.connection_status()
    }

    /// Attempts used in the current (or last) session of trying
    pub fn connection_attempts(&self) -> u32 {
        self.reconnect_state().attempts()
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    pub async fn queued(&self) -> Vec<QueuedMessage> {
        self.inner.queue.lock().await.snapshot()
    }

    fn reconnect_state(&self) -> MutexGuard<'_, ReconnectState> {
        match self.inner.reconnect.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Explicit connect: resets the attempt counter and tries up to
    /// `max_attempts` times with backoff. Returns false immediately if a
    /// session of attempts is already running.
    pub async fn connect(&self) -> bool {
        self.ensure_supervisor();
        if self.inner.client.is_connected() {
            debug!("Already connected");
            return true;
        }
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            debug!("WebSocket connection already in progress");
            return false;
        }
        let epoch = *self.inner.cancel_epoch.borrow();
        let _guard = SessionGuard { inner: &self.inner, epoch };
        self.reconnect_state().reset();
        self.run_attempts(epoch).await
    }

    /// Explicit disconnect: stops any pending retries and closes the link.
    /// Queued messages are kept for the next connection.
    pub async fn disconnect(&self) {
        self.inner.cancel_epoch.send_modify(|epoch| *epoch += 1);
        self.inner.client.disconnect().await;
    }

    /// Send a chat message, queueing it if the link is down.
    ///
    /// Publishes the optimistic local copy (`Sending`) and its subsequent
    /// status (`Sent`, `Failed` or `Queued`) on the message stream. Returns
    /// true if the frame reached the transport before this call returned.
    pub async fn send_message(&self, receiver_id: i64, content: &str) -> bool {
        let temp_id = new_temp_id();
        let local = self.local_message(receiver_id, content, &temp_id);
        self.inner.outbox.track(&temp_id, local.clone());
        self.inner.client.publish(local);

        {
            // Holding the queue keeps new sends behind an in-progress drain
            let mut queue = self.inner.queue.lock().await;
            if self.inner.client.is_connected() {
                if self.inner.client.send_message(receiver_id, content, &temp_id).await {
                    self.publish_status(&temp_id, DeliveryStatus::Sent);
                    return true;
                }
                error!("Failed to send message via WebSocket, queueing for retry");
                queue.push(queued(receiver_id, content, &temp_id));
                self.publish_status(&temp_id, DeliveryStatus::Failed);
                return false;
            }

            warn!("WebSocket not connected, queueing message");
            queue.push(queued(receiver_id, content, &temp_id));
        }
        self.publish_status(&temp_id, DeliveryStatus::Queued);

        // A successful connect drains the queue, this message included
        self.connect().await;
        !self.inner.queue.lock().await.contains_local(&temp_id)
    }

    /// Send queued messages front to back. Stops at the first failure and
    /// leaves it and everything behind it queued. Returns how many were sent.
    pub async fn drain_queue(&self) -> usize {
        let mut queue = self.inner.queue.lock().await;
        if queue.is_empty() {
            return 0;
        }
        info!("Processing message queue: {} messages", queue.len());

        let mut sent = 0;
        while let Some(item) = queue.front().cloned() {
            // The first attempt never reached the wire, so it gets a new id
            let wire_id = new_temp_id();
            if let Some(local_id) = &item.local_temp_id {
                self.inner.outbox.rekey(local_id, &wire_id);
            }

            if self.inner.client.send_message(item.receiver_id, &item.content, &wire_id).await {
                queue.pop_front();
                sent += 1;
                if item.local_temp_id.is_some() {
                    self.publish_status(&wire_id, DeliveryStatus::Sent);
                }
            } else {
                error!("Failed to send queued message, will retry later");
                if let Some(local_id) = &item.local_temp_id {
                    self.inner.outbox.rekey(&wire_id, local_id);
                }
                break;
            }
        }

        info!("Sent {} queued messages, {} remaining", sent, queue.len());
        sent
    }

    /// Queue a message without attempting to send it
    pub async fn enqueue(&self, receiver_id: i64, content: &str) {
        self.inner
            .queue
            .lock()
            .await
            .push(QueuedMessage::new(receiver_id, content));
    }

    async fn run_attempts(&self, epoch: u64) -> bool {
        let mut cancel = self.inner.cancel_epoch.subscribe();
        let max_attempts = self.inner.policy.max_attempts;

        loop {
            if *cancel.borrow() != epoch {
                info!("Connection attempts cancelled");
                return false;
            }

            let next = self.reconnect_state().next_attempt(&self.inner.policy);
            let Some((attempt, delay)) = next else {
                warn!("Max connection attempts reached, giving up");
                return false;
            };

            if !delay.is_zero() {
                info!(
                    "Retrying connection in {:?} (attempt {} of {})",
                    delay, attempt, max_attempts
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(&mut cancel, epoch) => {
                        info!("Connection attempts cancelled");
                        return false;
                    }
                }
            }

            match self.attempt_once().await {
                Ok(()) => {
                    info!("WebSocket connected successfully");
                    self.reconnect_state().reset();
                    self.drain_queue().await;
                    // The link can drop again while the queue drains
                    if !self.inner.client.is_connected() {
                        warn!("Connection lost while sending queued messages");
                        return false;
                    }
                    return true;
                }
                Err(e) => {
                    error!(
                        "Failed to connect to WebSocket (attempt {} of {}): {}",
                        attempt, max_attempts, e
                    );
                }
            }
        }
    }

    async fn attempt_once(&self) -> Result<(), ClientError> {
        let client = &self.inner.client;
        let credentials = client.credentials();
        let token = credentials
            .auth_token()
            .ok_or(ClientError::MissingCredentials("auth token"))?;
        let user_id = credentials
            .user_id()
            .ok_or(ClientError::MissingCredentials("user id"))?;

        match tokio::time::timeout(self.inner.connect_timeout, client.try_connect(&token, user_id)).await {
            Ok(result) => result,
            Err(_) => {
                let reason = format!("no CONNECTED frame within {:?}", self.inner.connect_timeout);
                client.abandon_connect(&reason);
                Err(ClientError::Timeout(reason))
            }
        }
    }

    // Reconnect after an established link dropped on its own
    async fn reconnect_after_loss(&self) {
        self.inner.lost_while_busy.store(true, Ordering::SeqCst);
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            debug!("Connection attempt already running, reconnect deferred until it ends");
            return;
        }
        self.inner.lost_while_busy.store(false, Ordering::SeqCst);
        let epoch = *self.inner.cancel_epoch.borrow();
        let _guard = SessionGuard { inner: &self.inner, epoch };
        if self.inner.client.is_connected() {
            debug!("Connection already restored");
            return;
        }
        self.reconnect_state().reset();
        info!("Connection lost, reconnecting");
        if !self.run_attempts(epoch).await {
            warn!("Could not restore the connection; waiting for an explicit connect");
        }
    }

    fn ensure_supervisor(&self) {
        let mut supervisor = match self.inner.supervisor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let mut lost = self.inner.client.subscribe_lost();
        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        *supervisor = Some(tokio::spawn(async move {
            loop {
                match lost.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                MessagingService { inner }.reconnect_after_loss().await;
            }
            debug!("Reconnect supervisor stopped");
        }));
    }

    fn local_message(&self, receiver_id: i64, content: &str, temp_id: &str) -> Message {
        let credentials = self.inner.client.credentials();
        Message {
            id: None,
            client_temp_id: Some(temp_id.to_string()),
            sender_id: credentials.user_id().unwrap_or(0),
            sender_username: credentials
                .username()
                .unwrap_or_else(|| UNKNOWN_USERNAME.to_string()),
            receiver_id,
            receiver_username: None,
            content: content.to_string(),
            timestamp: now_timestamp(),
            read: false,
            delivery_status: DeliveryStatus::Sending,
        }
    }

    fn publish_status(&self, wire_temp_id: &str, status: DeliveryStatus) {
        if let Some(message) = self.inner.outbox.update_status(wire_temp_id, status) {
            self.inner.client.publish(message);
        }
    }
}

fn queued(receiver_id: i64, content: &str, local_temp_id: &str) -> QueuedMessage {
    QueuedMessage {
        receiver_id,
        content: content.to_string(),
        local_temp_id: Some(local_temp_id.to_string()),
    }
}

pub fn new_temp_id() -> String {
    Uuid::new_v4().to_string()
}

async fn cancelled(rx: &mut watch::Receiver<u64>, epoch: u64) {
    loop {
        if *rx.borrow() != epoch {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nothing can cancel us any more
            std::future::pending::<()>().await;
        }
    }
}
