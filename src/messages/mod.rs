//! Message types
//!
//! Data carriers for the messaging core: commands, versioned events and
//! delivery envelopes. Payloads are self-describing tagged JSON so the
//! carriers stay open for extension without compile-time coupling to any
//! particular domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A command: an intention to change one aggregate.
///
/// `command_type` is the stable type tag handlers register against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Unique message id
    pub id: Uuid,

    /// Stable type tag, e.g. "add_item"
    pub command_type: String,

    /// The single aggregate this command targets
    pub target_id: Uuid,

    /// Command body
    pub payload: serde_json::Value,

    /// When the command was created
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn new(command_type: &str, target_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_type: command_type.to_string(),
            target_id,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// An event emitted by an aggregate, stamped with its stream position.
///
/// For any `(source_id, source_type)` the persisted versions form a
/// contiguous range starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedEvent {
    /// Aggregate id (stable across the stream)
    pub source_id: Uuid,

    /// Aggregate kind, e.g. "FakeItems"
    pub source_type: String,

    /// Position in the stream, starting at 1
    pub version: i64,

    /// Stable type tag, e.g. "item_added"
    pub event_type: String,

    /// Event body
    pub payload: serde_json::Value,

    /// Id of the command this event ultimately derives from
    pub correlation_id: Option<String>,

    /// When the event was created
    pub created_at: DateTime<Utc>,
}

impl VersionedEvent {
    /// Message identity for deduplication and envelope addressing.
    ///
    /// Events have no id of their own; `(source, version)` is the identity.
    pub fn message_id(&self) -> String {
        format!("{}_{}", self.source_id, self.version)
    }
}

/// A message plus delivery metadata, handed to handlers by the processor
/// and the dispatcher.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub body: T,

    /// Identity of the wrapped message
    pub message_id: String,

    /// Correlation id threaded from the originating command
    pub correlation_id: Option<String>,

    /// Human-readable trace line for diagnostics
    pub trace_identifier: Option<String>,
}

impl<T> Envelope<T> {
    pub fn new(body: T, message_id: String) -> Self {
        Self {
            body,
            message_id,
            correlation_id: None,
            trace_identifier: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_trace(mut self, trace: String) -> Self {
        self.trace_identifier = Some(trace);
        self
    }
}

impl Envelope<VersionedEvent> {
    /// Wrap an event, deriving message id and correlation from the body
    pub fn for_event(event: VersionedEvent) -> Self {
        let message_id = event.message_id();
        let correlation_id = event.correlation_id.clone();
        Envelope::new(event, message_id).with_correlation_id(correlation_id)
    }
}

impl Envelope<Command> {
    /// Wrap a command; a command correlates with itself
    pub fn for_command(command: Command) -> Self {
        let message_id = command.id.to_string();
        let correlation_id = Some(command.id.to_string());
        Envelope::new(command, message_id).with_correlation_id(correlation_id)
    }
}
