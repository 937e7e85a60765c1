//! Message tracer
//!
//! Human-readable trace lines emitted while messages flow through the
//! processor and dispatcher. The notification surface (websocket, console)
//! is an external collaborator; this module holds the interface and an
//! in-process implementation with a bounded buffer and subscriber fan-out.

use std::collections::VecDeque;
use std::sync::{mpsc, Mutex};

/// Sink for trace lines. Implementations must accept concurrent callers.
pub trait MessageTracer: Send + Sync {
    fn notify(&self, text: &str);
}

/// Buffer capacity; the oldest line is dropped when full
const TRACE_CAPACITY: usize = 50;

/// Bounded in-process tracer.
#[derive(Debug, Default)]
pub struct BoundedTracer {
    queue: Mutex<VecDeque<String>>,
    subscribers: Mutex<Vec<mpsc::Sender<String>>>,
}

impl BoundedTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every line notified after this call
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// The buffered lines, oldest first
    pub fn recent(&self) -> Vec<String> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl MessageTracer for BoundedTracer {
    fn notify(&self, text: &str) {
        {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if queue.len() == TRACE_CAPACITY {
                queue.pop_front();
            }
            queue.push_back(text.to_string());
        }

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // drop subscribers that went away
        subscribers.retain(|tx| tx.send(text.to_string()).is_ok());
    }
}
