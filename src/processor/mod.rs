//! Command processor
//!
//! Type-keyed command dispatch. Handlers register the command type tags
//! they own at startup; processing looks the handler up by tag and invokes
//! it with a bounded linear-backoff retry. An optional "every command"
//! handler (auditing) runs after the specific one with the same policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::event_store::EventStoreError;
use crate::messages::{Command, Envelope};
use crate::tracer::MessageTracer;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_UNIT: Duration = Duration::from_millis(1000);

/// Command processing errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// A command type tag was registered twice
    #[error("A handler is already registered for command type '{0}'")]
    DuplicateHandler(String),

    /// No handler owns the command's type tag
    #[error("No handler registered for command type '{0}'")]
    NoHandler(String),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Domain handler failure
    #[error("Handler failed: {0}")]
    Handler(String),
}

/// A command handler; registered against one or more command type tags.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: &Envelope<Command>) -> Result<(), ProcessingError>;
}

/// Registry plus retrying dispatch. Registrations happen at startup; the
/// registry is immutable while processing runs.
pub struct CommandProcessor {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    every_command: Option<Arc<dyn CommandHandler>>,
    tracer: Option<Arc<dyn MessageTracer>>,
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            every_command: None,
            tracer: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn MessageTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Associate a handler with the given command type tags.
    pub fn register(
        &mut self,
        command_types: &[&str],
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), ProcessingError> {
        for command_type in command_types {
            if self.handlers.contains_key(*command_type) {
                return Err(ProcessingError::DuplicateHandler(command_type.to_string()));
            }
            self.handlers
                .insert(command_type.to_string(), Arc::clone(&handler));
        }
        Ok(())
    }

    /// Register the single handler that observes every command (auditing).
    pub fn register_every_command(
        &mut self,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), ProcessingError> {
        if self.every_command.is_some() {
            return Err(ProcessingError::DuplicateHandler("*".to_string()));
        }
        self.every_command = Some(handler);
        Ok(())
    }

    /// Dispatch one command to its handler, then to the every-command
    /// handler, each with bounded retry.
    pub async fn process_message(&self, command: &Command) -> Result<(), ProcessingError> {
        let handler = self
            .handlers
            .get(&command.command_type)
            .ok_or_else(|| ProcessingError::NoHandler(command.command_type.clone()))?;

        let trace = format!(
            "Command {} ({}) -> {}",
            command.command_type,
            command.id,
            handler.name()
        );
        if let Some(tracer) = &self.tracer {
            tracer.notify(&trace);
        }
        let envelope = Envelope::for_command(command.clone()).with_trace(trace);

        self.invoke_with_retry(handler.as_ref(), &envelope).await?;

        if let Some(every) = &self.every_command {
            self.invoke_with_retry(every.as_ref(), &envelope).await?;
        }
        Ok(())
    }

    /// Up to 3 attempts with linear backoff; the error reported after the
    /// final failure is the one from the first attempt.
    async fn invoke_with_retry(
        &self,
        handler: &dyn CommandHandler,
        envelope: &Envelope<Command>,
    ) -> Result<(), ProcessingError> {
        let mut original = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(RETRY_UNIT * attempt).await;
            }
            match handler.handle(envelope).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        handler = handler.name(),
                        command = %envelope.message_id,
                        attempt,
                        error = %err,
                        "Command handler failed"
                    );
                    if original.is_none() {
                        original = Some(err);
                    }
                }
            }
        }

        Err(original
            .unwrap_or_else(|| ProcessingError::Handler("retries exhausted".to_string())))
    }
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// Tests
// =========================================================================
