// Domain types shared by the STOMP client and the messaging service

use std::fmt;

/// Connection lifecycle of a `StompClient`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,         // Never connected, or explicitly disconnected
    Connecting,   // Transport opening or waiting for CONNECTED
    Connected,    // CONNECTED received, session id valid
    Disconnected, // Lost the link, a reconnect may follow
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DeliveryStatus {
    Sending = 1,   // Message is being sent
    Sent = 2,      // Frame written to the broker
    Delivered = 3, // Delivered to recipient's device
    Read = 4,      // Read by recipient
    Failed = 5,    // Failed to send (or failed to parse)
    Queued = 6,    // Waiting for a connection
}

impl DeliveryStatus {
    /// Parse the `status` field the backend puts on pushed messages.
    /// Unknown values yield `None`.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SENDING" => Some(DeliveryStatus::Sending),
            "SENT" => Some(DeliveryStatus::Sent),
            "DELIVERED" => Some(DeliveryStatus::Delivered),
            "READ" => Some(DeliveryStatus::Read),
            "FAILED" | "ERROR" => Some(DeliveryStatus::Failed),
            "QUEUED" => Some(DeliveryStatus::Queued),
            _ => None,
        }
    }

    /// Whether the UI should offer a retry for a message in this state
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryStatus::Failed | DeliveryStatus::Queued)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryStatus::Sending => "SENDING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Read => "READ",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Queued => "QUEUED",
        };
        f.write_str(name)
    }
}

/// A chat message exchanged between two users
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<i64>,                  // Server id, absent until acknowledged
    pub client_temp_id: Option<String>,   // Correlation id for optimistic sends
    pub sender_id: i64,
    pub sender_username: String,
    pub receiver_id: i64,
    pub receiver_username: Option<String>,
    pub content: String,
    pub timestamp: String,                // ISO-8601
    pub read: bool,
    pub delivery_status: DeliveryStatus,
}

impl Message {
    pub fn with_status(&self, delivery_status: DeliveryStatus) -> Self {
        Self {
            delivery_status,
            ..self.clone()
        }
    }
}

/// One entry of the pending send queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub receiver_id: i64,
    pub content: String,
    // clientTempId of the optimistic copy the UI is showing, if any
    pub local_temp_id: Option<String>,
}

impl QueuedMessage {
    pub fn new(receiver_id: i64, content: impl Into<String>) -> Self {
        Self {
            receiver_id,
            content: content.into(),
            local_temp_id: None,
        }
    }
}

/// Current time in the timestamp format the backend uses
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
