//! Configuration validation against descriptors and the uniqueness rule.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;

use super::capability::{CapabilityId, CapabilityLookup, CapabilityType, Properties};
use super::descriptor::DescriptorProvider;

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Offending configuration key; `None` for capability-wide problems.
    pub key: Option<String>,
    pub message: String,
}

impl FieldError {
    pub fn for_field(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            key: None,
            message: message.into(),
        }
    }
}

/// Validates proposed capability configurations.
///
/// Unknown keys are accepted. Validation never mutates anything.
#[derive(Clone)]
pub struct Validator {
    descriptors: Arc<dyn DescriptorProvider>,
    /// Compiled field patterns, keyed by source. Shared between clones.
    patterns: Arc<DashMap<String, Regex>>,
}

impl Validator {
    pub fn new(descriptors: Arc<dyn DescriptorProvider>) -> Self {
        Self {
            descriptors,
            patterns: Arc::new(DashMap::new()),
        }
    }

    /// Check `properties` against the descriptor of `capability_type`.
    ///
    /// Returns one error per missing or blank required field and per value
    /// that does not match its field pattern. Types without a descriptor
    /// always validate.
    pub fn validate(&self, capability_type: &CapabilityType, properties: &Properties) -> Vec<FieldError> {
        let Some(descriptor) = self.descriptors.get(capability_type) else {
            return Vec::new();
        };

        let mut errors = Vec::new();
        for field in &descriptor.fields {
            let value = properties
                .get(&field.id)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty());

            match value {
                None if field.required => {
                    errors.push(FieldError::for_field(
                        &field.id,
                        format!("{} is required", field.display_label()),
                    ));
                }
                None => {}
                Some(value) => {
                    if let Some(pattern) = &field.pattern {
                        if let Some(error) = self.check_pattern(&field.id, field.display_label(), pattern, value) {
                            errors.push(error);
                        }
                    }
                }
            }
        }
        errors
    }

    /// True iff no other live capability of `capability_type` exists.
    pub fn validate_uniqueness(
        &self,
        capability_type: &CapabilityType,
        excluding: Option<&CapabilityId>,
        lookup: &dyn CapabilityLookup,
    ) -> bool {
        !lookup.exists_of_type(capability_type, excluding)
    }

    pub fn uniqueness_error(&self, capability_type: &CapabilityType) -> FieldError {
        FieldError::general(format!(
            "Only one capability of type '{}' can be created",
            self.type_name(capability_type)
        ))
    }

    pub fn type_name(&self, capability_type: &CapabilityType) -> String {
        self.descriptors.display_name(capability_type)
    }

    /// Field label for a configuration key, or the key itself.
    pub fn property_name(&self, capability_type: &CapabilityType, key: &str) -> String {
        self.descriptors
            .get(capability_type)
            .map(|d| d.property_name(key).to_string())
            .unwrap_or_else(|| key.to_string())
    }

    pub fn descriptors(&self) -> &Arc<dyn DescriptorProvider> {
        &self.descriptors
    }

    fn check_pattern(&self, key: &str, label: &str, pattern: &str, value: &str) -> Option<FieldError> {
        match self.compiled(pattern) {
            Ok(re) if re.is_match(value) => None,
            Ok(_) => Some(FieldError::for_field(
                key,
                format!("{label} does not match '{pattern}'"),
            )),
            Err(e) => Some(FieldError::for_field(
                key,
                format!("{label} has an invalid pattern '{pattern}': {e}"),
            )),
        }
    }

    /// Invalid patterns are not cached; they fail again on the next call.
    fn compiled(&self, pattern: &str) -> Result<Regex, regex::Error> {
        let cached = self.patterns.get(pattern).map(|re| re.value().clone());
        if let Some(re) = cached {
            return Ok(re);
        }
        let re = Regex::new(pattern)?;
        self.patterns.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator").finish_non_exhaustive()
    }
}
