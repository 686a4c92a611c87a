// Inbound MESSAGE body -> domain Message
//
// The backend is not consistent about the JSON shape it pushes: sometimes
// participants are flat (`senderId`, `senderUsername`), sometimes nested
// (`sender: {id, username}`). Every participant field is resolved with the
// same precedence:
//
//   1. the flat field (`senderId`)
//   2. the nested object field (`sender.id`)
//   3. the default
//
// `null` counts as absent at every level. Only `content` is required; a body
// that is not JSON, or lacks `content`, becomes a synthetic `Failed` message.

use log::{debug, error};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{now_timestamp, DeliveryStatus, Message};

pub const UNKNOWN_USERNAME: &str = "Unknown";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("message body is not a JSON object")]
    NotAnObject,

    #[error("missing required field 'content'")]
    MissingContent,
}

/// Decode a MESSAGE body. Never fails: parse errors become a `Failed` message.
pub fn parse_message_body(body: &str) -> Message {
    match try_parse_message_body(body) {
        Ok(message) => message,
        Err(e) => {
            error!("Error parsing message: {}", e);
            debug!("Body was: {}", body);
            error_message(&e.to_string())
        }
    }
}

pub fn try_parse_message_body(body: &str) -> Result<Message, ParseError> {
    let value: Value = serde_json::from_str(body.trim())?;
    let json = value.as_object().ok_or(ParseError::NotAnObject)?;

    let content = match json.get("content") {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(ParseError::MissingContent),
    };

    let read = json.get("read").and_then(Value::as_bool).unwrap_or(false);
    let delivery_status = json
        .get("status")
        .and_then(Value::as_str)
        .and_then(DeliveryStatus::from_wire)
        .unwrap_or(DeliveryStatus::Sent);

    Ok(Message {
        id: json.get("id").and_then(as_i64),
        client_temp_id: json.get("tempId").and_then(as_string),
        sender_id: participant_id(json, "senderId", "sender").unwrap_or(0),
        sender_username: participant_name(json, "senderUsername", "sender")
            .unwrap_or_else(|| UNKNOWN_USERNAME.to_string()),
        receiver_id: participant_id(json, "receiverId", "receiver").unwrap_or(0),
        receiver_username: participant_name(json, "receiverUsername", "receiver"),
        content,
        timestamp: json
            .get("timestamp")
            .and_then(as_string)
            .unwrap_or_else(now_timestamp),
        read,
        delivery_status,
    })
}

/// The synthetic message shown in place of something we could not parse
pub fn error_message(reason: &str) -> Message {
    Message {
        id: None,
        client_temp_id: None,
        sender_id: 0,
        sender_username: "Error".to_string(),
        receiver_id: 0,
        receiver_username: None,
        content: format!("Error parsing message: {}", reason),
        timestamp: now_timestamp(),
        read: false,
        delivery_status: DeliveryStatus::Failed,
    }
}

fn participant_id(json: &Map<String, Value>, flat: &str, nested: &str) -> Option<i64> {
    json.get(flat)
        .and_then(as_i64)
        .or_else(|| nested_field(json, nested, "id").and_then(as_i64))
}

fn participant_name(json: &Map<String, Value>, flat: &str, nested: &str) -> Option<String> {
    json.get(flat)
        .and_then(as_string)
        .or_else(|| nested_field(json, nested, "username").and_then(as_string))
}

fn nested_field<'a>(json: &'a Map<String, Value>, object: &str, field: &str) -> Option<&'a Value> {
    json.get(object)?.as_object()?.get(field)
}

// Ids arrive as numbers, occasionally as numeric strings
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
