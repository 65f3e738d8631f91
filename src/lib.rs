//! # Capability Engine
//!
//! Lifecycle and condition engine for typed, user-configured capabilities.
//!
//! The [`CapabilityRegistry`] owns every capability instance, validates its
//! configuration against a [`CapabilityDescriptor`], and drives it through
//! the NEW, VALIDATING, ACTIVE/PASSIVE, FAILED and REMOVED states. Whether a
//! capability may be ACTIVE is decided by its bound conditions, which react
//! to lifecycle events delivered over an [`EventChannel`].
//!
//! ```
//! use std::sync::Arc;
//! use capabilities::{
//!     CapabilityDescriptor, CapabilityRegistry, CapabilityState, DescriptorRegistry,
//!     EventBus, FieldSpec, Properties,
//! };
//!
//! let descriptors = Arc::new(DescriptorRegistry::new());
//! descriptors.register(
//!     CapabilityDescriptor::new("proxy", "Repository Proxy")
//!         .with_field(FieldSpec::required("url", "Repository URL")),
//! );
//! let registry = CapabilityRegistry::new(Arc::new(EventBus::new()), descriptors);
//!
//! let err = registry.create("proxy", Properties::new(), true).unwrap_err();
//! assert_eq!(err.to_string(), "Validation failed: Repository URL is required");
//!
//! let mut properties = Properties::new();
//! properties.insert("url".into(), "https://repo.example.com".into());
//! let id = registry.create("proxy", properties, true).unwrap();
//! assert_eq!(registry.get(&id).unwrap().state, CapabilityState::Active);
//! ```

pub mod capabilities;
pub mod conditions;
pub mod config;
pub mod events;
pub mod telemetry;

pub use capabilities::{
    ActivationError, BehaviorFactory, CapabilityBehavior, CapabilityDescriptor, CapabilityError,
    CapabilityId, CapabilityLookup, CapabilityRegistry, CapabilityRequest, CapabilitySnapshot,
    CapabilityState, CapabilityType, CapabilityUpdate, ConditionBindError, DescriptorError,
    DescriptorProvider, DescriptorRegistry, FieldError, FieldSpec, Properties, ValidationErrors,
    Validator,
};
pub use conditions::{CapabilityConditions, Condition, ConditionKind};
pub use config::{ConfigError, EngineConfig, EventMode};
pub use events::{
    AsyncEventBus, CapabilityEvent, EventBus, EventChannel, EventEnvelope, EventKind,
    SubscriptionToken,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
