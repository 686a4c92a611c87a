// Connection management for StompClient
// Contains connect, disconnect, subscribe, send and the inbound read loop

use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use super::frame::{Command, Frame, HEARTBEAT};
use super::inbound::{self, UNKNOWN_USERNAME};
use super::transport::{FrameSource, TransportEvent};
use super::{ClientError, ConnectSignal, StompClient};
use crate::credentials::redact;
use crate::models::ConnectionState;

// JSON body of a SEND frame
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessage<'a> {
    sender: OutboundSender<'a>,
    receiver: OutboundReceiver,
    content: &'a str,
    temp_id: &'a str,
}

#[derive(Debug, Serialize)]
struct OutboundSender<'a> {
    id: i64,
    username: &'a str,
}

#[derive(Debug, Serialize)]
struct OutboundReceiver {
    id: i64,
}

impl StompClient {
    /// Open the connection and wait for the broker's CONNECTED frame.
    ///
    /// Returns true once connected (or if already connected). Returns false
    /// immediately if another attempt is in flight. No timeout is applied
    /// here; callers wrap this in their own deadline and call
    /// `abandon_connect` when it expires.
    pub async fn connect(&self, token: &str, user_id: i64) -> bool {
        match self.try_connect(token, user_id).await {
            Ok(()) => true,
            Err(ClientError::AlreadyConnecting) => {
                debug!("Connection already in progress");
                false
            }
            Err(e) => {
                error!("Failed to connect: {}", e);
                false
            }
        }
    }

    pub async fn try_connect(&self, token: &str, user_id: i64) -> Result<(), ClientError> {
        let (generation, rx) = {
            let mut shared = self.shared();
            match shared.state {
                ConnectionState::Connected => {
                    debug!("Already connected to broker");
                    return Ok(());
                }
                ConnectionState::Connecting => return Err(ClientError::AlreadyConnecting),
                ConnectionState::Idle | ConnectionState::Disconnected => {}
            }
            let (signal, rx) = ConnectSignal::arm();
            shared.state = ConnectionState::Connecting;
            shared.generation += 1;
            shared.explicit_disconnect = false;
            shared.user_id = Some(user_id);
            shared.pending = signal;
            (shared.generation, rx)
        };

        let url = self.inner.config.url.clone();
        info!("Connecting to {} as user {} with token {}", url, user_id, redact(token));

        let (mut sink, source) = match self.inner.connector.open(&url, token).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("Transport open failed: {}", e);
                self.handle_disconnection(generation, ClientError::TransportClosed(e.to_string()));
                return Err(ClientError::TransportOpen(e));
            }
        };
        debug!("Transport opened, sending CONNECT");

        let config = &self.inner.config;
        let connect_frame = Frame::connect(
            &config.accept_version,
            (config.heartbeat_outgoing_ms, config.heartbeat_incoming_ms),
            token,
            user_id,
        );
        if let Err(e) = sink.send_text(connect_frame.encode()).await {
            error!("Failed to send CONNECT frame: {}", e);
            let _ = sink.close().await;
            self.handle_disconnection(generation, ClientError::TransportClosed(e.to_string()));
            return Err(ClientError::Send(e));
        }

        {
            let mut writer = self.inner.writer.lock().await;
            // disconnect() may have run while the transport was opening
            if !self.is_current(generation) {
                drop(writer);
                debug!("Connection attempt superseded, closing transport");
                let _ = sink.close().await;
                return Err(ClientError::Cancelled);
            }
            *writer = Some((generation, sink));
        }

        let reader = tokio::spawn(Self::read_loop(self.clone(), generation, source));
        {
            let mut shared = self.shared();
            if shared.generation == generation {
                shared.tasks.push(reader);
            } else {
                reader.abort();
            }
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped without resolving: treat as cancelled
            Err(_) => Err(ClientError::Cancelled),
        }
    }

    /// Give up on an in-flight connect (the caller's deadline expired).
    /// The pending `connect()` resolves to false.
    pub fn abandon_connect(&self, reason: &str) {
        let generation = {
            let shared = self.shared();
            if !shared.state.is_connecting() {
                return;
            }
            shared.generation
        };
        warn!("Abandoning connection attempt: {}", reason);
        self.handle_disconnection(generation, ClientError::Timeout(reason.to_string()));
    }

    /// Explicit disconnect. Idempotent; never schedules a reconnect.
    pub async fn disconnect(&self) {
        let (was_connected, was_active, tasks) = {
            let mut shared = self.shared();
            let was_connected = shared.state.is_connected();
            let was_active = was_connected || shared.state.is_connecting();
            shared.explicit_disconnect = true;
            shared.state = ConnectionState::Idle;
            shared.session_id = None;
            shared.subscriptions.clear();
            shared.pending.resolve(Err(ClientError::Cancelled));
            shared.generation += 1;
            (was_connected, was_active, std::mem::take(&mut shared.tasks))
        };

        if was_active {
            info!("Disconnecting from broker");
        } else {
            debug!("Disconnect requested while not connected");
        }

        for task in tasks {
            task.abort();
        }

        let writer = self.inner.writer.lock().await.take();
        if let Some((_, mut sink)) = writer {
            if was_connected {
                let receipt = format!("disconnect-{}", Uuid::new_v4());
                match sink.send_text(Frame::disconnect(&receipt).encode()).await {
                    Ok(()) => debug!("Sent DISCONNECT frame"),
                    Err(e) => warn!("Failed to send DISCONNECT frame: {}", e),
                }
            }
            if let Err(e) = sink.close().await {
                warn!("Error closing transport: {}", e);
            }
        }

        if was_active {
            self.emit_status(false);
            info!("Disconnected from broker");
        }
    }

    /// Subscribe to a destination. A destination already subscribed in this
    /// session is not subscribed again.
    pub async fn subscribe(&self, destination: &str) -> Result<(), ClientError> {
        let subscription_id = {
            let mut shared = self.shared();
            if !shared.state.is_connected() {
                debug!("Cannot subscribe to {}: not connected", destination);
                return Err(ClientError::NotConnected);
            }
            if shared.subscriptions.contains_key(destination) {
                debug!("Already subscribed to: {}", destination);
                return Ok(());
            }
            let id = format!("sub-{}", Uuid::new_v4());
            // Reserve before the await so a concurrent call sees it
            shared.subscriptions.insert(destination.to_string(), id.clone());
            id
        };

        info!("Subscribing to destination: {}", destination);
        match self.send_frame(&Frame::subscribe(&subscription_id, destination)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Failed to subscribe to {}: {}", destination, e);
                let mut shared = self.shared();
                if shared.subscriptions.get(destination) == Some(&subscription_id) {
                    shared.subscriptions.remove(destination);
                }
                Err(e)
            }
        }
    }

    pub async fn unsubscribe(&self, destination: &str) -> Result<(), ClientError> {
        let subscription_id = match self.shared().subscriptions.remove(destination) {
            Some(id) => id,
            None => {
                debug!("Not subscribed to: {}", destination);
                return Ok(());
            }
        };
        info!("Unsubscribing from destination: {}", destination);
        self.send_frame(&Frame::unsubscribe(&subscription_id)).await
    }

    /// Write a chat message as a SEND frame.
    ///
    /// True means the frame was written, not that it was delivered; delivery
    /// shows up later as an inbound frame carrying the same `tempId`.
    pub async fn send_message(&self, receiver_id: i64, content: &str, temp_id: &str) -> bool {
        match self.try_send_message(receiver_id, content, temp_id).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send message: {}", e);
                false
            }
        }
    }

    pub async fn try_send_message(
        &self,
        receiver_id: i64,
        content: &str,
        temp_id: &str,
    ) -> Result<(), ClientError> {
        let session_user = {
            let shared = self.shared();
            if !shared.state.is_connected() {
                return Err(ClientError::NotConnected);
            }
            shared.user_id
        };

        let credentials = &self.inner.credentials;
        let sender_id = credentials
            .user_id()
            .or(session_user)
            .ok_or(ClientError::MissingCredentials("user id"))?;
        let username = credentials
            .username()
            .unwrap_or_else(|| UNKNOWN_USERNAME.to_string());

        let payload = OutboundMessage {
            sender: OutboundSender {
                id: sender_id,
                username: &username,
            },
            receiver: OutboundReceiver { id: receiver_id },
            content,
            temp_id,
        };
        let json = serde_json::to_string(&payload)?;
        debug!("Sending message: {}", json);

        let frame = Frame::send_json(&self.inner.config.send_destination, json);
        self.send_frame(&frame).await?;
        debug!("Message {} written to transport", temp_id);
        Ok(())
    }

    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        debug!("Sending {} frame", frame.command);
        self.send_text(frame.encode()).await
    }

    pub(crate) async fn send_text(&self, text: String) -> Result<(), ClientError> {
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some((_, sink)) => sink.send_text(text).await.map_err(ClientError::Send),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Send a keep-alive EOL on the link of `generation`
    pub(crate) async fn send_heartbeat(&self, generation: u64) -> Result<(), ClientError> {
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some((g, sink)) if *g == generation => sink
                .send_text(HEARTBEAT.to_string())
                .await
                .map_err(ClientError::Send),
            _ => Err(ClientError::NotConnected),
        }
    }

    // Reads transport events in order until the link ends or goes stale
    async fn read_loop(client: StompClient, generation: u64, mut source: Box<dyn FrameSource>) {
        loop {
            let event = match client.next_event(source.as_mut()).await {
                Ok(event) => event,
                Err(e) => {
                    warn!("{}", e);
                    client.handle_disconnection(generation, e);
                    return;
                }
            };

            match event {
                Some(TransportEvent::Text(text)) => {
                    client.handle_text(generation, &text).await;
                }
                Some(TransportEvent::Closed { code, reason }) => {
                    info!("WebSocket closed: {} - {}", code, reason);
                    client.handle_disconnection(
                        generation,
                        ClientError::TransportClosed(format!("{} {}", code, reason)),
                    );
                    return;
                }
                Some(TransportEvent::Failed(reason)) => {
                    error!("WebSocket failure: {}", reason);
                    client.handle_disconnection(generation, ClientError::TransportClosed(reason));
                    return;
                }
                None => {
                    info!("WebSocket stream ended");
                    client.handle_disconnection(
                        generation,
                        ClientError::TransportClosed("stream ended".to_string()),
                    );
                    return;
                }
            }

            if !client.is_current(generation) {
                debug!("Read loop for stale connection exiting");
                return;
            }
        }
    }

    pub(crate) async fn handle_text(&self, generation: u64, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Received heartbeat");
                return;
            }
            Err(e) => {
                error!("Undecodable frame: {}", e);
                debug!("Frame was: {:?}", text);
                self.publish_inbound(inbound::error_message(&e.to_string()));
                return;
            }
        };

        match frame.command {
            Command::Connected => self.on_connected(generation, &frame).await,
            Command::Message => {
                let message = inbound::parse_message_body(&frame.body);
                debug!("Processed message from {}: {}", message.sender_id, message.content);
                self.publish_inbound(message);
            }
            Command::Error => {
                let reason = frame
                    .get_header("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.body.trim().to_string());
                error!("STOMP error: {}", reason);
                self.handle_disconnection(generation, ClientError::Protocol(reason));
            }
            Command::Receipt => {
                debug!("Received RECEIPT: {:?}", frame.get_header("receipt-id"));
            }
            other => {
                warn!("Ignoring unexpected {} frame from broker", other);
            }
        }
    }

    async fn on_connected(&self, generation: u64, frame: &Frame) {
        let session_id = frame
            .get_header("session")
            .or_else(|| frame.get_header("session-id"))
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let user_id = {
            let mut shared = self.shared();
            if shared.generation != generation || !shared.state.is_connecting() {
                warn!("Ignoring CONNECTED for a connection that is no longer pending");
                return;
            }
            shared.state = ConnectionState::Connected;
            shared.session_id = Some(session_id.clone());
            shared.user_id
        };

        info!("STOMP connection established with session ID: {}", session_id);
        self.emit_status(true);

        if let Some(user_id) = user_id {
            let topic = self.inner.config.topic_for(user_id);
            if let Err(e) = self.subscribe(&topic).await {
                error!("Failed to subscribe to message topic {}: {}", topic, e);
            }
        }

        self.start_heartbeat(generation);

        // Resolve last so the waiter sees a subscribed connection
        let mut shared = self.shared();
        if shared.generation == generation {
            shared.pending.resolve(Ok(()));
        }
    }

    /// Move to Disconnected after an error or a dropped transport.
    /// Stale generations are ignored, so this runs at most once per link.
    pub(crate) fn handle_disconnection(&self, generation: u64, reason: ClientError) {
        let (was_connected, explicit, tasks) = {
            let mut shared = self.shared();
            if shared.generation != generation {
                return;
            }
            let was_connected = shared.state.is_connected();
            debug!("Connection {} ended: {}", generation, reason);
            shared.state = ConnectionState::Disconnected;
            shared.session_id = None;
            shared.subscriptions.clear();
            shared.pending.resolve(Err(reason));
            shared.generation += 1;
            (
                was_connected,
                shared.explicit_disconnect,
                std::mem::take(&mut shared.tasks),
            )
        };

        for task in tasks {
            task.abort();
        }

        // Close the writer of this link, unless a newer link replaced it
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut writer = inner.writer.lock().await;
            if matches!(writer.as_ref(), Some((g, _)) if *g == generation) {
                if let Some((_, mut sink)) = writer.take() {
                    if let Err(e) = sink.close().await {
                        debug!("Error closing dropped transport: {}", e);
                    }
                }
            }
        });

        self.emit_status(false);

        if was_connected && !explicit {
            info!("Connection lost, notifying reconnect supervisor");
            self.notify_lost();
        }
    }
}
