//! Synchronous in-process event bus.
//!
//! Events are delivered on the publishing thread. A publish issued from
//! inside a handler is queued and delivered once the current event has been
//! handled by every subscriber, so each handler observes events in publish
//! order. The outermost [`publish`](EventChannel::publish) returns only after
//! that queue is empty, which makes this bus deterministic for tests.

use std::collections::{HashMap, VecDeque};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use super::channel::{EventChannel, EventHandler, HandlerTable, SubscriptionToken};
use super::types::{CapabilityEvent, EventEnvelope, EventKind};

#[derive(Default)]
pub struct EventBus {
    table: HandlerTable,

    /// Events queued per thread while that thread is dispatching.
    queues: Mutex<HashMap<ThreadId, VecDeque<EventEnvelope>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.table.handler_count(kind)
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.table.clear();
    }
}

impl EventChannel for EventBus {
    fn subscribe(&self, kind: EventKind, name: &str, handler: EventHandler) -> SubscriptionToken {
        self.table.subscribe(kind, name, handler)
    }

    fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.table.unsubscribe(token)
    }

    fn publish(&self, event: CapabilityEvent) {
        let envelope = self.table.stamp(event);
        let thread = thread::current().id();

        {
            let mut queues = self.queues.lock();
            if let Some(queue) = queues.get_mut(&thread) {
                // Re-entrant publish: the outer call delivers it.
                queue.push_back(envelope);
                return;
            }
            queues.insert(thread, VecDeque::new());
        }

        let mut next = Some(envelope);
        while let Some(current) = next {
            self.table.dispatch(&current);

            let mut queues = self.queues.lock();
            next = queues.get_mut(&thread).and_then(VecDeque::pop_front);
            if next.is_none() {
                queues.remove(&thread);
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::capability::CapabilityId;
    use std::sync::{Arc, Mutex as StdMutex};

    fn begin(id: CapabilityId) -> CapabilityEvent {
        CapabilityEvent::CapabilityUpdateBegin { id }
    }

    fn end(id: CapabilityId) -> CapabilityEvent {
        CapabilityEvent::CapabilityUpdateEnd { id }
    }

    #[test]
    fn test_subscribe_publish_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let sink = seen.clone();
        let token = bus.subscribe(
            EventKind::CapabilityUpdateBegin,
            "recorder",
            Arc::new(move |e: &EventEnvelope| sink.lock().unwrap().push(e.meta.sequence)),
        );
        assert_eq!(bus.handler_count(EventKind::CapabilityUpdateBegin), 1);

        let id = CapabilityId::generate();
        bus.publish(begin(id));
        bus.publish(end(id));
        bus.publish(begin(id));
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);

        assert!(bus.unsubscribe(&token));
        assert!(!bus.unsubscribe(&token));
        bus.publish(begin(id));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_reentrant_publish_preserves_order() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(StdMutex::new(Vec::new()));
        let id = CapabilityId::generate();

        // First handler on "begin" publishes "end" from inside dispatch.
        let inner_bus = Arc::downgrade(&bus);
        bus.subscribe(
            EventKind::CapabilityUpdateBegin,
            "republisher",
            Arc::new(move |_: &EventEnvelope| {
                if let Some(bus) = inner_bus.upgrade() {
                    bus.publish(CapabilityEvent::CapabilityUpdateEnd { id });
                }
            }),
        );

        for kind in [EventKind::CapabilityUpdateBegin, EventKind::CapabilityUpdateEnd] {
            let sink = order.clone();
            bus.subscribe(
                kind,
                "recorder",
                Arc::new(move |e: &EventEnvelope| sink.lock().unwrap().push(e.kind())),
            );
        }

        bus.publish(begin(id));

        // The recorder sees "begin" before the "end" published during it.
        assert_eq!(
            *order.lock().unwrap(),
            vec![EventKind::CapabilityUpdateBegin, EventKind::CapabilityUpdateEnd]
        );
    }

    #[test]
    fn test_panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let delivered = Arc::new(StdMutex::new(0));

        bus.subscribe(
            EventKind::CapabilityUpdateEnd,
            "exploding",
            Arc::new(|_: &EventEnvelope| panic!("boom")),
        );
        let sink = delivered.clone();
        bus.subscribe(
            EventKind::CapabilityUpdateEnd,
            "counter",
            Arc::new(move |_: &EventEnvelope| *sink.lock().unwrap() += 1),
        );

        let id = CapabilityId::generate();
        bus.publish(end(id));
        bus.publish(end(id));
        assert_eq!(*delivered.lock().unwrap(), 2);
    }

    #[test]
    fn test_clear_drops_all_handlers() {
        let bus = EventBus::new();
        bus.subscribe(EventKind::CapabilityCreated, "a", Arc::new(|_: &EventEnvelope| {}));
        bus.subscribe(EventKind::CapabilityRemoved, "b", Arc::new(|_: &EventEnvelope| {}));
        bus.clear();
        assert_eq!(bus.handler_count(EventKind::CapabilityCreated), 0);
        assert_eq!(bus.handler_count(EventKind::CapabilityRemoved), 0);
    }
}
