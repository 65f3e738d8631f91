//! Capability lifecycle events and the publish/subscribe channel.
//!
//! The registry publishes a [`CapabilityEvent`] after each committed
//! transition; bound conditions subscribe to the kinds they care about.
//! The channel is always passed explicitly, so tests can use the
//! deterministic [`EventBus`] while services run the [`AsyncEventBus`].

pub mod async_bus;
pub mod channel;
pub mod event_bus;
pub mod types;

pub use async_bus::AsyncEventBus;
pub use channel::{EventChannel, EventHandler, SubscriptionToken};
pub use event_bus::EventBus;
pub use types::{CapabilityEvent, EventEnvelope, EventKind, EventMeta};
