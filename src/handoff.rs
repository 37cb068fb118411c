//! Delivery of recognition events from the worker to the consumer.
//!
//! The worker side holds a cloneable `Handoff`; the single consumer owns the
//! `ConsumerQueue` and drains it on its own thread. Events arrive in the
//! order they were sent.

use crate::types::{RecognitionError, RecognitionResult};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Queue depth before progress notifications start being dropped
const HANDOFF_CAPACITY: usize = 64;

/// Event delivered to the consumer
#[derive(Debug, Clone)]
pub enum RecognitionEvent {
    /// Recognition is still running after the progress threshold
    Progress { elapsed: Duration },
    Completed(RecognitionResult),
    Failed(RecognitionError),
}

/// Sending half, owned by the orchestrator
#[derive(Clone)]
pub struct Handoff {
    tx: mpsc::Sender<RecognitionEvent>,
}

impl Handoff {
    /// Deliver an outcome, waiting for queue space. Returns false if the
    /// consumer is gone.
    pub async fn deliver(&self, event: RecognitionEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Best-effort notification that never waits
    pub fn notify(&self, event: RecognitionEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropped handoff notification: {}", e);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, owned by the consumer
pub struct ConsumerQueue {
    rx: mpsc::Receiver<RecognitionEvent>,
}

impl ConsumerQueue {
    /// Wait for the next event; `None` once every `Handoff` is dropped
    pub async fn recv(&mut self) -> Option<RecognitionEvent> {
        self.rx.recv().await
    }

    /// Take every event that is already queued
    pub fn try_drain(&mut self) -> Vec<RecognitionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Create a connected handoff pair
pub fn channel() -> (Handoff, ConsumerQueue) {
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    (Handoff { tx }, ConsumerQueue { rx })
}
