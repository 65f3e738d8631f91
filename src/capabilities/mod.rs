//! # Capabilities
//!
//! Typed, user-configured behavioral units and the registry driving their
//! lifecycle.
//!
//! ## Lifecycle
//!
//! 1. `CapabilityRegistry::create` validates the configuration against the
//!    type's [`CapabilityDescriptor`] and the unique-per-type rule
//! 2. The capability moves NEW -> VALIDATING and its behavior's conditions
//!    are bound to the event channel
//! 3. The composite gate (enabled, not updating, every condition satisfied)
//!    settles it in ACTIVE or PASSIVE
//! 4. Condition flips move it between ACTIVE and PASSIVE until it is removed
//!
//! Behavior failures land the capability in FAILED, which only an explicit
//! `update` or `retry` clears.

pub mod capability;
pub mod descriptor;
pub mod error;
pub mod registry;
pub mod validator;

pub use capability::{
    BehaviorFactory, CapabilityBehavior, CapabilityId, CapabilityLookup, CapabilityRequest,
    CapabilitySnapshot, CapabilityState, CapabilityType, CapabilityUpdate, NoopBehavior,
    Properties,
};
pub use descriptor::{CapabilityDescriptor, DescriptorProvider, DescriptorRegistry, FieldSpec};
pub use error::{
    ActivationError, CapabilityError, ConditionBindError, DescriptorError, ValidationErrors,
};
pub use registry::CapabilityRegistry;
pub use validator::{FieldError, Validator};
