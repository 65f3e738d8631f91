//! Capability engine errors.

use thiserror::Error;

use super::capability::CapabilityId;
use super::validator::FieldError;

/// Errors returned synchronously from registry operations.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Schema or uniqueness violation. Nothing was mutated.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    /// Unknown or removed capability id.
    #[error("Capability not found: {0}")]
    NotFound(CapabilityId),
}

impl CapabilityError {
    /// The field errors, if this is a validation failure.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            CapabilityError::Validation(errors) => errors.errors(),
            CapabilityError::NotFound(_) => &[],
        }
    }
}

/// One or more field-level validation problems, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", join_messages(.0))]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn join_messages(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A condition could not subscribe to the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionBindError {
    #[error("Invalid condition target type: '{0}'")]
    InvalidTarget(String),

    #[error("Capability registry is no longer available")]
    RegistryUnavailable,
}

/// Opaque failure raised by capability behavior.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ActivationError {
    message: String,
}

impl ActivationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Wrap any displayable error.
    pub fn from_error(error: impl std::fmt::Display) -> Self {
        Self::new(error.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Descriptor file loading failed.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
