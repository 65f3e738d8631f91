//! Named constructors for the condition variants.

use super::condition::ConditionKind;
use crate::capabilities::capability::CapabilityType;

/// Factory for the conditions capability behaviors commonly declare.
///
/// ```
/// use capabilities::conditions::CapabilityConditions;
///
/// let conditions = CapabilityConditions::new();
/// let gate = conditions.all(vec![
///     conditions.capability_of_type_active("storage"),
///     conditions.passivate_capability_during_update(),
/// ]);
/// assert_eq!(
///     gate.to_string(),
///     "(capability of type 'storage' is active and capability is not being updated)"
/// );
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityConditions;

impl CapabilityConditions {
    pub fn new() -> Self {
        Self
    }

    /// Satisfied while at least one capability of the type exists.
    pub fn capability_of_type_exists(&self, capability_type: impl Into<CapabilityType>) -> ConditionKind {
        ConditionKind::TypeExists(capability_type.into())
    }

    /// Satisfied while at least one capability of the type is active.
    pub fn capability_of_type_active(&self, capability_type: impl Into<CapabilityType>) -> ConditionKind {
        ConditionKind::TypeActive(capability_type.into())
    }

    /// Holds the owning capability passive while it is being reconfigured.
    pub fn passivate_capability_during_update(&self) -> ConditionKind {
        ConditionKind::PassivateDuringUpdate
    }

    pub fn all(&self, conditions: Vec<ConditionKind>) -> ConditionKind {
        ConditionKind::All(conditions)
    }
}
