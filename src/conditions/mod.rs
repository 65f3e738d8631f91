//! Conditions gating capability activation.
//!
//! A condition is a boolean predicate bound to the event channel. Binding
//! computes its initial value synchronously; afterwards it recomputes on the
//! events it subscribed to and notifies its owner only when the value flips.
//!
//! Conditions referencing other capabilities hold the target type as a lookup
//! key and query the registry through
//! [`CapabilityLookup`](crate::capabilities::CapabilityLookup); they never
//! hold on to sibling capabilities, which may be removed and recreated at any
//! time.

pub mod condition;
pub mod factory;

pub use condition::{BindContext, ChangeCallback, Condition, ConditionKind};
pub use factory::CapabilityConditions;
