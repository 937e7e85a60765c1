//! Message serialization
//!
//! The message log and the outbox store messages as self-describing text:
//! the serialized form carries the message kind and type tag so the inverse
//! reconstructs the original concrete message. The core only depends on the
//! contract; JSON is the default codec.

use serde::{Deserialize, Serialize};

use crate::messages::{Command, VersionedEvent};

/// A message as it appears in the durable log: either an external command
/// or a versioned event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoggedMessage {
    Command(Command),
    Event(VersionedEvent),
}

impl LoggedMessage {
    /// Kind discriminator as stored in the message log
    pub fn kind(&self) -> &'static str {
        match self {
            LoggedMessage::Command(_) => "command",
            LoggedMessage::Event(_) => "event",
        }
    }
}

/// Serialization errors
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Round-trip codec for logged messages.
///
/// Implementations must reconstruct the exact message they serialized.
pub trait Serializer: Send + Sync {
    fn serialize(&self, message: &LoggedMessage) -> Result<String, SerializationError>;
    fn deserialize(&self, text: &str) -> Result<LoggedMessage, SerializationError>;
}

/// Default JSON codec
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &LoggedMessage) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(message)?)
    }

    fn deserialize(&self, text: &str) -> Result<LoggedMessage, SerializationError> {
        if text.trim().is_empty() {
            return Err(SerializationError::Malformed("empty payload".to_string()));
        }
        Ok(serde_json::from_str(text)?)
    }
}
