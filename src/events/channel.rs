//! The publish/subscribe contract consumed by conditions and the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::{CapabilityEvent, EventEnvelope, EventKind, EventMeta};

/// Event handler callback.
pub type EventHandler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Process-wide publish/subscribe channel for capability events.
///
/// Implementations deliver events to each handler in publish order and
/// isolate handler panics from the publisher and from other handlers.
pub trait EventChannel: Send + Sync {
    /// Register `handler` for events of `kind`.
    fn subscribe(&self, kind: EventKind, name: &str, handler: EventHandler) -> SubscriptionToken;

    /// Remove a subscription. Returns `false` if it was not registered.
    fn unsubscribe(&self, token: &SubscriptionToken) -> bool;

    fn publish(&self, event: CapabilityEvent);

    /// Wait until every event published so far has been delivered.
    ///
    /// Synchronous channels deliver before `publish` returns, so the default
    /// does nothing. Returns `false` if the channel can no longer deliver.
    fn flush(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// SubscriptionToken
// ---------------------------------------------------------------------------

static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handle identifying one subscription.
#[derive(Clone)]
pub struct SubscriptionToken {
    /// Human-readable handler name.
    pub name: String,
    kind: EventKind,
    id: u64,
}

impl SubscriptionToken {
    fn new(kind: EventKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            id: SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl fmt::Debug for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionToken({}:{})", self.id, self.name)
    }
}

impl PartialEq for SubscriptionToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubscriptionToken {}

impl std::hash::Hash for SubscriptionToken {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// ---------------------------------------------------------------------------
// HandlerTable
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct HandlerEntry {
    token: SubscriptionToken,
    handler: EventHandler,
}

/// Handler registry and dispatch shared by the channel implementations.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: RwLock<HashMap<EventKind, Vec<HandlerEntry>>>,
    sequence: AtomicU64,
}

impl HandlerTable {
    pub(crate) fn subscribe(
        &self,
        kind: EventKind,
        name: &str,
        handler: EventHandler,
    ) -> SubscriptionToken {
        let token = SubscriptionToken::new(kind, name);
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(HandlerEntry {
                token: token.clone(),
                handler,
            });
        token
    }

    pub(crate) fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut map = self.handlers.write();
        let Some(entries) = map.get_mut(&token.kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.token != *token);
        let removed = entries.len() < before;
        if entries.is_empty() {
            map.remove(&token.kind);
        }
        removed
    }

    /// Attach metadata; the sequence is assigned here so it follows publish order.
    pub(crate) fn stamp(&self, event: CapabilityEvent) -> EventEnvelope {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        EventEnvelope {
            meta: EventMeta::new(sequence),
            event,
        }
    }

    /// Deliver to every handler registered for the event's kind.
    ///
    /// Handlers run outside the table lock so they may subscribe, unsubscribe
    /// or publish. A panicking handler is logged and skipped.
    pub(crate) fn dispatch(&self, envelope: &EventEnvelope) {
        let entries: Vec<HandlerEntry> = match self.handlers.read().get(&envelope.kind()) {
            Some(v) => v.clone(),
            None => return,
        };

        for entry in entries {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (entry.handler)(envelope);
            }));
            if let Err(panic) = result {
                tracing::error!(
                    handler = %entry.token.name,
                    event_kind = ?envelope.kind(),
                    sequence = envelope.meta.sequence,
                    panic = panic_message(&*panic),
                    "event handler panicked"
                );
            }
        }
    }

    pub(crate) fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    pub(crate) fn clear(&self) {
        self.handlers.write().clear();
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}
