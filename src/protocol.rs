//! Wire protocol between clients and the gateway, plus the envelope
//! exchanged between gateway instances through the broker.
//!
//! Client frames are JSON text with a `type` tag. Anything that fails to
//! parse produces an error frame rather than a disconnect.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Current time as epoch milliseconds.
pub fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON object, lacks a string `type`, or has
    /// missing/invalid fields for a recognized type.
    #[error("invalid message: {0}")]
    Invalid(String),

    /// The frame is a well-formed object but carries an unrecognized `type`.
    #[error("unsupported message type '{0}'")]
    UnknownType(String),
}

/// Messages from client to gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Join one or more channels
    Subscribe { channels: Vec<String> },
    /// Leave one or more channels
    Unsubscribe { channels: Vec<String> },
    /// Publish a payload to a channel (fans out through the broker)
    Publish { channel: String, payload: Value },
    /// Application-level keepalive
    Ping,
}

impl ClientMessage {
    /// Parse a raw text frame.
    ///
    /// Distinguishes malformed frames from well-formed frames with an
    /// unknown tag, since the two map to different error codes.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;

        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::Invalid("message must be a JSON object".to_string()))?;

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Invalid("missing string `type` field".to_string()))?;

        match kind {
            "subscribe" | "unsubscribe" | "publish" | "ping" => {
                serde_json::from_value(value.clone())
                    .map_err(|e| ProtocolError::Invalid(e.to_string()))
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    UnknownMessageType,
    ClientPublishForbidden,
    MessageProcessingFailed,
}

/// Messages from gateway to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Confirms the channels whose membership actually changed
    Ack {
        action: AckAction,
        channels: Vec<String>,
    },
    /// Protocol or processing error; the connection stays open
    Error { code: ErrorCode, message: String },
    /// Reply to a client ping
    Pong { timestamp: i64 },
    /// A broker-delivered message fanned out to channel members
    Message {
        channel: String,
        payload: Value,
        origin: String,
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// The structure carried over the broker transport between gateway
/// instances. Never seen by WebSocket clients.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelEnvelope {
    pub payload: Value,
    pub origin: String,
    pub timestamp: i64,
}

impl ChannelEnvelope {
    pub fn new(payload: Value, origin: String) -> Self {
        Self {
            payload,
            origin,
            timestamp: epoch_ms(),
        }
    }

    /// Tolerant decode of a raw broker message.
    ///
    /// Returns `None` when the message is not JSON, not object-shaped, or
    /// lacks a `payload` key; callers drop such messages. A missing `origin`
    /// defaults to `"unknown"` and a missing `timestamp` to the current time.
    pub fn decode(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let obj = value.as_object()?;
        let payload = obj.get("payload")?.clone();

        let origin = obj
            .get("origin")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(epoch_ms);

        Some(Self {
            payload,
            origin,
            timestamp,
        })
    }
}
