//! Event dispatcher
//!
//! Fans each event out to every handler registered for its type tag, plus
//! the handlers registered for all events, threading message id,
//! correlation id and a trace line into the envelope. Two delivery modes
//! share the registry: serial on the caller's task with no retry, or
//! concurrent with per-handler retry where a concurrency conflict counts
//! as already processed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::event_store::EventStoreError;
use crate::messages::{Envelope, VersionedEvent};
use crate::tracer::MessageTracer;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_UNIT: Duration = Duration::from_millis(50);

/// Event dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Domain handler failure
    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    /// A spawned delivery task died
    #[error("Dispatch task failed: {0}")]
    Task(String),
}

impl DispatchError {
    /// Concurrency conflicts surface when a retried handler already saved
    /// its result; the dispatcher treats them as success.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DispatchError::EventStore(err) if err.is_concurrency_conflict())
    }
}

/// An event handler. Handlers must be idempotent across retries and, in
/// concurrent mode, tolerate siblings handling the same event in parallel.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: &Envelope<VersionedEvent>) -> Result<(), DispatchError>;
}

/// Delivery mode, selected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Every handler on the caller's task, no retry, errors propagate
    Serial,
    /// One task per handler with retry; waits for all before returning
    Concurrent,
}

/// Handler registry plus delivery.
pub struct EventDispatcher {
    registry: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    catch_all: Vec<Arc<dyn EventHandler>>,
    mode: DispatchMode,
    tracer: Option<Arc<dyn MessageTracer>>,
}

impl EventDispatcher {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            registry: HashMap::new(),
            catch_all: Vec::new(),
            mode,
            tracer: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn MessageTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Register a handler for the given event type tags
    pub fn register(&mut self, event_types: &[&str], handler: Arc<dyn EventHandler>) {
        for event_type in event_types {
            self.registry
                .entry(event_type.to_string())
                .or_default()
                .push(Arc::clone(&handler));
        }
    }

    /// Register a handler that observes every event
    pub fn register_catch_all(&mut self, handler: Arc<dyn EventHandler>) {
        self.catch_all.push(handler);
    }

    /// Handlers for one event: specific registrations first, then the
    /// catch-alls, each in registration order.
    fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut handlers: Vec<Arc<dyn EventHandler>> = self
            .registry
            .get(event_type)
            .map(|specific| specific.to_vec())
            .unwrap_or_default();
        handlers.extend(self.catch_all.iter().cloned());
        handlers
    }

    /// Deliver one event to all its handlers.
    pub async fn dispatch(&self, event: &VersionedEvent) -> Result<(), DispatchError> {
        let handlers = self.handlers_for(&event.event_type);
        if handlers.is_empty() {
            tracing::trace!(
                event_type = %event.event_type,
                source = %event.source_id,
                "No handlers registered"
            );
            return Ok(());
        }

        let trace = format!(
            "Event {} v{} from {}/{}",
            event.event_type, event.version, event.source_type, event.source_id
        );
        if let Some(tracer) = &self.tracer {
            tracer.notify(&trace);
        }
        let envelope = Envelope::for_event(event.clone()).with_trace(trace);

        match self.mode {
            DispatchMode::Serial => {
                for handler in handlers {
                    handler.handle(&envelope).await?;
                }
                Ok(())
            }
            DispatchMode::Concurrent => {
                let mut deliveries = JoinSet::new();
                for handler in handlers {
                    let envelope = envelope.clone();
                    deliveries.spawn(async move { deliver_with_retry(handler, envelope).await });
                }

                let mut first_error = None;
                while let Some(joined) = deliveries.join_next().await {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                        }
                        Err(join_err) => {
                            if first_error.is_none() {
                                first_error = Some(DispatchError::Task(join_err.to_string()));
                            }
                        }
                    }
                }
                match first_error {
                    None => Ok(()),
                    Some(err) => Err(err),
                }
            }
        }
    }
}

/// Concurrent-mode delivery: bounded retry with linear backoff; a
/// concurrency conflict means the handler's work is already committed.
async fn deliver_with_retry(
    handler: Arc<dyn EventHandler>,
    envelope: Envelope<VersionedEvent>,
) -> Result<(), DispatchError> {
    let mut last_error = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(RETRY_UNIT * attempt).await;
        }
        match handler.handle(&envelope).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_concurrency_conflict() => {
                tracing::debug!(
                    handler = handler.name(),
                    message_id = %envelope.message_id,
                    "Concurrency conflict: already processed"
                );
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(
                    handler = handler.name(),
                    message_id = %envelope.message_id,
                    attempt,
                    error = %err,
                    "Event handler failed"
                );
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| DispatchError::Task("retries exhausted".to_string())))
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn event(event_type: &str) -> VersionedEvent {
        VersionedEvent {
            source_id: Uuid::new_v4(),
            source_type: "FakeItems".to_string(),
            version: 1,
            event_type: event_type.to_string(),
            payload: serde_json::json!({}),
            correlation_id: Some("C1".to_string()),
            created_at: chrono::Utc::now(),
        }
    }

    struct Recording {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(
            &self,
            envelope: &Envelope<VersionedEvent>,
        ) -> Result<(), DispatchError> {
            self.calls.lock().unwrap().push(format!(
                "{}:{}:{}",
                self.name,
                envelope.body.event_type,
                envelope.correlation_id.clone().unwrap_or_default()
            ));
            Ok(())
        }
    }

    struct Failing {
        attempts: Arc<AtomicU32>,
        failures_before_success: u32,
        conflict: bool,
    }

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(
            &self,
            _envelope: &Envelope<VersionedEvent>,
        ) -> Result<(), DispatchError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.conflict {
                return Err(DispatchError::EventStore(
                    EventStoreError::ConcurrencyConflict {
                        id: Uuid::nil(),
                        expected: 2,
                        found: 2,
                    },
                ));
            }
            if attempt <= self.failures_before_success {
                Err(DispatchError::Handler {
                    handler: "failing".to_string(),
                    message: format!("boom {}", attempt),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_serial_runs_specific_then_catch_all_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new(DispatchMode::Serial);
        dispatcher.register(
            &["item_added"],
            Arc::new(Recording {
                name: "a",
                calls: Arc::clone(&calls),
            }),
        );
        dispatcher.register(
            &["item_added"],
            Arc::new(Recording {
                name: "b",
                calls: Arc::clone(&calls),
            }),
        );
        dispatcher.register_catch_all(Arc::new(Recording {
            name: "all",
            calls: Arc::clone(&calls),
        }));

        dispatcher.dispatch(&event("item_added")).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "a:item_added:C1",
                "b:item_added:C1",
                "all:item_added:C1"
            ]
        );
    }

    #[tokio::test]
    async fn test_serial_error_propagates_without_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut dispatcher = EventDispatcher::new(DispatchMode::Serial);
        dispatcher.register(
            &["item_added"],
            Arc::new(Failing {
                attempts: Arc::clone(&attempts),
                failures_before_success: 10,
                conflict: false,
            }),
        );

        let err = dispatcher.dispatch(&event("item_added")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Handler { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhandled_event_is_fine() {
        let dispatcher = EventDispatcher::new(DispatchMode::Serial);
        dispatcher.dispatch(&event("nobody_cares")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut dispatcher = EventDispatcher::new(DispatchMode::Concurrent);
        dispatcher.register(
            &["item_added"],
            Arc::new(Failing {
                attempts: Arc::clone(&attempts),
                failures_before_success: 2,
                conflict: false,
            }),
        );

        dispatcher.dispatch(&event("item_added")).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_rethrows_after_three_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut dispatcher = EventDispatcher::new(DispatchMode::Concurrent);
        dispatcher.register(
            &["item_added"],
            Arc::new(Failing {
                attempts: Arc::clone(&attempts),
                failures_before_success: 10,
                conflict: false,
            }),
        );

        let err = dispatcher.dispatch(&event("item_added")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Handler { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrency_conflict_reported_as_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut dispatcher = EventDispatcher::new(DispatchMode::Concurrent);
        dispatcher.register(
            &["item_added"],
            Arc::new(Failing {
                attempts: Arc::clone(&attempts),
                failures_before_success: 0,
                conflict: true,
            }),
        );

        dispatcher.dispatch(&event("item_added")).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waits_for_all_handlers() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new(DispatchMode::Concurrent);
        for name in ["a", "b", "c"] {
            dispatcher.register(
                &["item_added"],
                Arc::new(Recording {
                    name,
                    calls: Arc::clone(&calls),
                }),
            );
        }

        dispatcher.dispatch(&event("item_added")).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 3);
    }
}
