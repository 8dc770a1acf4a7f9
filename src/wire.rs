//! Message framing and container decoding.
//!
//! A message is a multi-part frame set.  Only the last frame carries the
//! encoded [`Container`]; a leading frame, when present, is the subscription
//! topic the publisher sent it under.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One multi-part message.
pub type Frames = Vec<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    PingAcknowledge,
    FullUpdate,
    IncrementalUpdate,
    Error,
    Text,
    Display,
    Executed,
    Completed,
    /// A batch of commands sent to a command sink.
    Command,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn is_keepalive(self) -> bool {
        matches!(self, MessageType::Ping | MessageType::PingAcknowledge)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub note: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

impl Container {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            topic: None,
            note: Vec::new(),
            body: Value::Null,
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note.push(note.into());
        self
    }

    /// Single-frame encoding of this container.
    pub fn to_frames(&self) -> Result<Frames, serde_json::Error> {
        Ok(vec![serde_json::to_vec(self)?])
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message has no frames")]
    Empty,
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected {0:?} message")]
    Unexpected(MessageType),
}

/// Decodes the payload frame of `frames`.
pub fn decode(frames: &[Vec<u8>]) -> Result<Container, DecodeError> {
    let payload = frames.last().ok_or(DecodeError::Empty)?;
    let mut container: Container = serde_json::from_slice(payload)?;
    if container.topic.is_none() && frames.len() > 1 {
        container.topic = std::str::from_utf8(&frames[0])
            .ok()
            .filter(|t| !t.is_empty())
            .map(str::to_string);
    }
    Ok(container)
}
