//! In-memory event sink, used by tests and by the admin API for the
//! recent-events view.

use crate::domain::events::GatewayEvent;
use crate::domain::ports::EventSink;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Bounded ring of recent events, optionally forwarding to another sink.
pub struct MemoryEventSink {
    events: Mutex<VecDeque<GatewayEvent>>,
    capacity: usize,
    next: Option<Arc<dyn EventSink>>,
}

impl MemoryEventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            next: None,
        }
    }

    /// Also forward every event to `next`.
    pub fn chained(capacity: usize, next: Arc<dyn EventSink>) -> Self {
        Self {
            next: Some(next),
            ..Self::new(capacity)
        }
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Recorded events with the given name.
    pub fn named(&self, name: &str) -> Vec<GatewayEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: GatewayEvent) {
        if let Some(next) = &self.next {
            next.emit(event.clone());
        }
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}
