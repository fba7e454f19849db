//! Broadcast bus carrying lifecycle events to API streams and tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

const DEFAULT_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    event_count: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            event_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish an envelope to all subscribers.
    ///
    /// Returns the number of receivers; with none the event is dropped.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Wrap `event` in a fresh envelope and publish it.
    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Events published before subscribing are not delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn event_count(&self) -> usize {
        self.event_count.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}
