//! Capability lifecycle event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capabilities::capability::{CapabilityId, CapabilityState, CapabilityType};

/// Event discriminator used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CapabilityCreated,
    CapabilityRemoved,
    CapabilityStateChanged,
    CapabilityUpdateBegin,
    CapabilityUpdateEnd,
}

/// Lifecycle events published by the capability registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CapabilityEvent {
    CapabilityCreated {
        #[serde(rename = "type")]
        capability_type: CapabilityType,
        id: CapabilityId,
    },
    CapabilityRemoved {
        #[serde(rename = "type")]
        capability_type: CapabilityType,
        id: CapabilityId,
    },
    CapabilityStateChanged {
        #[serde(rename = "type")]
        capability_type: CapabilityType,
        id: CapabilityId,
        old_state: CapabilityState,
        new_state: CapabilityState,
    },
    CapabilityUpdateBegin {
        id: CapabilityId,
    },
    CapabilityUpdateEnd {
        id: CapabilityId,
    },
}

impl CapabilityEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CapabilityEvent::CapabilityCreated { .. } => EventKind::CapabilityCreated,
            CapabilityEvent::CapabilityRemoved { .. } => EventKind::CapabilityRemoved,
            CapabilityEvent::CapabilityStateChanged { .. } => EventKind::CapabilityStateChanged,
            CapabilityEvent::CapabilityUpdateBegin { .. } => EventKind::CapabilityUpdateBegin,
            CapabilityEvent::CapabilityUpdateEnd { .. } => EventKind::CapabilityUpdateEnd,
        }
    }

    pub fn capability_id(&self) -> &CapabilityId {
        match self {
            CapabilityEvent::CapabilityCreated { id, .. }
            | CapabilityEvent::CapabilityRemoved { id, .. }
            | CapabilityEvent::CapabilityStateChanged { id, .. }
            | CapabilityEvent::CapabilityUpdateBegin { id }
            | CapabilityEvent::CapabilityUpdateEnd { id } => id,
        }
    }

    /// The capability type, for events that carry it.
    pub fn capability_type(&self) -> Option<&CapabilityType> {
        match self {
            CapabilityEvent::CapabilityCreated { capability_type, .. }
            | CapabilityEvent::CapabilityRemoved { capability_type, .. }
            | CapabilityEvent::CapabilityStateChanged { capability_type, .. } => {
                Some(capability_type)
            }
            CapabilityEvent::CapabilityUpdateBegin { .. }
            | CapabilityEvent::CapabilityUpdateEnd { .. } => None,
        }
    }
}

/// Metadata stamped on every event at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// UUID v4.
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Monotonically increasing per channel.
    pub sequence: u64,
}

impl EventMeta {
    pub fn new(sequence: u64) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            sequence,
        }
    }
}

/// An event as delivered to handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(flatten)]
    pub event: CapabilityEvent,
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}
