//! Capability identifiers, lifecycle states and the behavior contract.
//!
//! A capability is a typed, user-configured behavioral unit. The engine only
//! sees its identity, its configuration and its lifecycle state; what the
//! capability actually does is hidden behind [`CapabilityBehavior`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::error::ActivationError;
use crate::conditions::ConditionKind;

/// Capability configuration: string keys to string values.
pub type Properties = HashMap<String, String>;

// ---------------------------------------------------------------------------
// CapabilityType
// ---------------------------------------------------------------------------

/// Interned capability type identifier (e.g. `"proxy"`).
///
/// Cloning is cheap; equality and hashing are by value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityType(Arc<str>);

impl CapabilityType {
    /// Create a type identifier from any string-like value.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityType({})", self.0)
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CapabilityType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CapabilityType {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl Serialize for CapabilityType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CapabilityType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

// ---------------------------------------------------------------------------
// CapabilityId
// ---------------------------------------------------------------------------

/// Opaque, immutable capability instance identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(Uuid);

impl CapabilityId {
    /// Allocate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// CapabilityState
// ---------------------------------------------------------------------------

/// Lifecycle state of a capability instance.
///
/// ```text
/// NEW -> VALIDATING -> { ACTIVE <-> PASSIVE } -> REMOVED
///             \              |         |
///              +-----------> FAILED <--+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityState {
    New,
    Validating,
    Active,
    Passive,
    Failed,
    /// Terminal.
    Removed,
}

impl CapabilityState {
    pub fn is_active(self) -> bool {
        self == CapabilityState::Active
    }

    pub fn is_removed(self) -> bool {
        self == CapabilityState::Removed
    }
}

impl fmt::Display for CapabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityState::New => "NEW",
            CapabilityState::Validating => "VALIDATING",
            CapabilityState::Active => "ACTIVE",
            CapabilityState::Passive => "PASSIVE",
            CapabilityState::Failed => "FAILED",
            CapabilityState::Removed => "REMOVED",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Behavior contract
// ---------------------------------------------------------------------------

/// Pluggable capability logic.
///
/// The registry calls these hooks while it holds the capability's lock, so
/// implementations must be bounded: no blocking network calls. Any `Err`
/// returned from a hook moves the capability to FAILED.
pub trait CapabilityBehavior: Send {
    /// Called once after the capability has been registered.
    fn on_create(&mut self, _properties: &Properties) -> Result<(), ActivationError> {
        Ok(())
    }

    /// Called with the new configuration while the capability is held passive.
    fn on_update(&mut self, _properties: &Properties) -> Result<(), ActivationError> {
        Ok(())
    }

    /// Called once when the capability is removed. Errors are logged only.
    fn on_remove(&mut self) -> Result<(), ActivationError> {
        Ok(())
    }

    fn on_activate(&mut self) -> Result<(), ActivationError> {
        Ok(())
    }

    fn on_passivate(&mut self) -> Result<(), ActivationError> {
        Ok(())
    }

    /// Conditions gating activation, computed at create and at every update.
    fn conditions(&self, _properties: &Properties) -> Vec<ConditionKind> {
        Vec::new()
    }
}

/// Behavior used for capability types with no registered factory.
#[derive(Debug, Default)]
pub struct NoopBehavior;

impl CapabilityBehavior for NoopBehavior {}

/// Creates the behavior for a new capability instance of a given type.
pub type BehaviorFactory =
    Arc<dyn Fn(&CapabilityType) -> Box<dyn CapabilityBehavior> + Send + Sync>;

// ---------------------------------------------------------------------------
// Lookup seam used by conditions and the validator
// ---------------------------------------------------------------------------

/// Read-only view over the live capabilities, keyed by type and id.
///
/// Conditions that reference sibling capabilities go through this trait
/// instead of holding references to them.
pub trait CapabilityLookup: Send + Sync {
    /// Ids and current states of the capabilities of `capability_type`.
    fn capabilities_of_type(
        &self,
        capability_type: &CapabilityType,
    ) -> Vec<(CapabilityId, CapabilityState)>;

    /// Whether the capability is between its update-begin and update-end.
    fn is_updating(&self, id: &CapabilityId) -> bool;

    /// Whether a non-removed capability of the type exists, ignoring `excluding`.
    fn exists_of_type(
        &self,
        capability_type: &CapabilityType,
        excluding: Option<&CapabilityId>,
    ) -> bool {
        self.capabilities_of_type(capability_type)
            .into_iter()
            .any(|(id, state)| !state.is_removed() && Some(&id) != excluding)
    }

    /// Whether at least one capability of the type is ACTIVE.
    fn active_of_type(&self, capability_type: &CapabilityType) -> bool {
        self.capabilities_of_type(capability_type)
            .into_iter()
            .any(|(_, state)| state.is_active())
    }
}

// ---------------------------------------------------------------------------
// Requests and snapshots
// ---------------------------------------------------------------------------

/// Everything needed to create a capability.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub capability_type: CapabilityType,
    pub properties: Properties,
    pub enabled: bool,
    pub notes: Option<String>,
    /// Explicit unique-per-type policy, in addition to the descriptor's flag.
    pub unique_per_type: bool,
}

impl CapabilityRequest {
    pub fn new(capability_type: impl Into<CapabilityType>) -> Self {
        Self {
            capability_type: capability_type.into(),
            properties: Properties::new(),
            enabled: true,
            notes: None,
            unique_per_type: false,
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn unique_per_type(mut self, unique: bool) -> Self {
        self.unique_per_type = unique;
        self
    }
}

/// A reconfiguration of an existing capability.
#[derive(Debug, Clone)]
pub struct CapabilityUpdate {
    pub properties: Properties,
    pub enabled: bool,
    /// `None` keeps the current notes.
    pub notes: Option<String>,
}

/// Point-in-time, owned view of a capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilitySnapshot {
    pub id: CapabilityId,
    #[serde(rename = "type")]
    pub capability_type: CapabilityType,
    pub type_name: String,
    pub properties: Properties,
    pub notes: Option<String>,
    pub enabled: bool,
    pub state: CapabilityState,
    pub last_error: Option<String>,
    pub unique: bool,
}

impl CapabilitySnapshot {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}
