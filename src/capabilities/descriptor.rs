//! Capability descriptors and the descriptor registry.
//!
//! A descriptor declares the configurable fields of a capability type and its
//! display name. Descriptors can be registered programmatically or loaded from
//! YAML files:
//!
//! ```yaml
//! descriptor:
//!   type: "proxy"
//!   name: "Repository Proxy"
//!   unique: true
//!   fields:
//!     - id: "url"
//!       label: "Repository URL"
//!       required: true
//!       pattern: "^https?://"
//! ```
//!
//! A file may also hold a `descriptors:` list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::capability::CapabilityType;
use super::error::DescriptorError;

/// One configurable field of a capability type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Configuration key.
    pub id: String,

    /// Human-readable name used in validation messages.
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub required: bool,

    /// Regex that non-blank values must match.
    #[serde(default)]
    pub pattern: Option<String>,
}

impl FieldSpec {
    pub fn optional(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            required: false,
            pattern: None,
        }
    }

    pub fn required(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: Some(label.into()),
            required: true,
            pattern: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// The label, or the raw key when no label is set.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// Immutable description of a capability type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    #[serde(rename = "type")]
    pub capability_type: CapabilityType,

    #[serde(rename = "name")]
    pub display_name: String,

    #[serde(default)]
    pub fields: Vec<FieldSpec>,

    /// At most one live capability of this type may exist.
    #[serde(default)]
    pub unique: bool,
}

impl CapabilityDescriptor {
    pub fn new(capability_type: impl Into<CapabilityType>, display_name: impl Into<String>) -> Self {
        Self {
            capability_type: capability_type.into(),
            display_name: display_name.into(),
            fields: Vec::new(),
            unique: false,
        }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn field(&self, id: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Label for a configuration key, falling back to the key itself.
    pub fn property_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.field(key).map_or(key, FieldSpec::display_label)
    }
}

/// Read-only source of descriptors.
pub trait DescriptorProvider: Send + Sync {
    fn get(&self, capability_type: &CapabilityType) -> Option<Arc<CapabilityDescriptor>>;

    /// Descriptor name if registered, otherwise the raw type string.
    fn display_name(&self, capability_type: &CapabilityType) -> String {
        self.get(capability_type)
            .map(|d| d.display_name.clone())
            .unwrap_or_else(|| capability_type.to_string())
    }
}

/// Concurrent registry of capability descriptors, keyed by type.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    descriptors: DashMap<CapabilityType, Arc<CapabilityDescriptor>>,

    /// Directories scanned by [`load_all`](Self::load_all).
    search_paths: Vec<PathBuf>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            descriptors: DashMap::new(),
            search_paths: paths.into_iter().collect(),
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Add or replace the descriptor for its type.
    pub fn register(&self, descriptor: CapabilityDescriptor) {
        tracing::debug!(
            capability_type = %descriptor.capability_type,
            name = %descriptor.display_name,
            "registered capability descriptor"
        );
        self.descriptors
            .insert(descriptor.capability_type.clone(), Arc::new(descriptor));
    }

    pub fn unregister(&self, capability_type: &CapabilityType) -> Option<Arc<CapabilityDescriptor>> {
        self.descriptors.remove(capability_type).map(|(_, d)| d)
    }

    /// Register every descriptor found in a YAML file.
    ///
    /// The file holds a single `descriptor:` or a `descriptors:` list.
    pub fn register_from_file(&self, path: &Path) -> Result<usize, DescriptorError> {
        let content = std::fs::read_to_string(path)?;
        self.register_from_yaml(&content)
    }

    /// Register every descriptor found in a YAML document.
    pub fn register_from_yaml(&self, content: &str) -> Result<usize, DescriptorError> {
        if let Ok(single) = serde_yaml::from_str::<SingleDescriptorFile>(content) {
            self.register(single.descriptor);
            return Ok(1);
        }

        let list: DescriptorListFile = serde_yaml::from_str(content)?;
        let count = list.descriptors.len();
        for descriptor in list.descriptors {
            self.register(descriptor);
        }
        Ok(count)
    }

    /// Load all descriptor YAML files below a directory (recursive).
    ///
    /// Files that fail to parse are skipped with a warning.
    pub fn load_directory(&self, dir: &Path) -> Result<usize, DescriptorError> {
        let mut count = 0;
        if !dir.exists() {
            return Ok(0);
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if path.is_dir() {
                count += self.load_directory(&path)?;
            } else if path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
            {
                match self.register_from_file(&path) {
                    Ok(n) => count += n,
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "failed to load capability descriptor"
                        );
                    }
                }
            }
        }

        Ok(count)
    }

    /// Load descriptors from every configured search path.
    pub fn load_all(&self) -> Result<usize, DescriptorError> {
        let mut count = 0;
        for path in &self.search_paths {
            count += self.load_directory(path)?;
        }
        Ok(count)
    }

    pub fn list(&self) -> Vec<Arc<CapabilityDescriptor>> {
        let mut all: Vec<_> = self.descriptors.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.capability_type.cmp(&b.capability_type));
        all
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl DescriptorProvider for DescriptorRegistry {
    fn get(&self, capability_type: &CapabilityType) -> Option<Arc<CapabilityDescriptor>> {
        self.descriptors.get(capability_type).map(|e| e.value().clone())
    }
}

#[derive(Debug, Deserialize)]
struct SingleDescriptorFile {
    descriptor: CapabilityDescriptor,
}

#[derive(Debug, Deserialize)]
struct DescriptorListFile {
    descriptors: Vec<CapabilityDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> CapabilityDescriptor {
        CapabilityDescriptor::new("proxy", "Repository Proxy")
            .with_field(FieldSpec::required("url", "Repository URL"))
            .with_field(FieldSpec::optional("timeout"))
    }

    #[test]
    fn test_register_and_get() {
        let registry = DescriptorRegistry::new();
        registry.register(proxy());

        let found = registry.get(&"proxy".into()).unwrap();
        assert_eq!(found.display_name, "Repository Proxy");
        assert!(registry.get(&"missing".into()).is_none());
    }

    #[test]
    fn test_register_replaces_existing() {
        let registry = DescriptorRegistry::new();
        registry.register(proxy());
        registry.register(CapabilityDescriptor::new("proxy", "Proxy v2"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.display_name(&"proxy".into()), "Proxy v2");
    }

    #[test]
    fn test_display_name_falls_back_to_type() {
        let registry = DescriptorRegistry::new();
        assert_eq!(registry.display_name(&"raw.type".into()), "raw.type");
    }

    #[test]
    fn test_property_name_uses_label_then_key() {
        let d = proxy();
        assert_eq!(d.property_name("url"), "Repository URL");
        assert_eq!(d.property_name("timeout"), "timeout");
        assert_eq!(d.property_name("unknown"), "unknown");
    }

    #[test]
    fn test_register_from_yaml_single_and_list() {
        let registry = DescriptorRegistry::new();
        let single = r#"
descriptor:
  type: "proxy"
  name: "Repository Proxy"
  unique: true
  fields:
    - id: "url"
      label: "Repository URL"
      required: true
      pattern: "^https?://"
"#;
        assert_eq!(registry.register_from_yaml(single).unwrap(), 1);
        let d = registry.get(&"proxy".into()).unwrap();
        assert!(d.unique);
        assert_eq!(d.fields[0].pattern.as_deref(), Some("^https?://"));

        let list = r#"
descriptors:
  - type: "alpha"
    name: "Alpha"
  - type: "beta"
    name: "Beta"
    fields:
      - id: "x"
"#;
        assert_eq!(registry.register_from_yaml(list).unwrap(), 2);
        assert_eq!(registry.len(), 3);
        assert!(!registry.get(&"beta".into()).unwrap().fields[0].required);
    }

    #[test]
    fn test_load_directory_skips_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();

        std::fs::write(
            dir.path().join("alpha.yaml"),
            "descriptor:\n  type: alpha\n  name: Alpha\n",
        )
        .unwrap();
        std::fs::write(
            nested.join("beta.yml"),
            "descriptors:\n  - type: beta\n    name: Beta\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "descriptor: [not, a, map]\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = DescriptorRegistry::with_search_paths(vec![dir.path().to_path_buf()]);
        assert_eq!(registry.load_all().unwrap(), 2);
        assert_eq!(
            registry
                .list()
                .iter()
                .map(|d| d.capability_type.to_string())
                .collect::<Vec<_>>(),
            vec!["alpha", "beta"]
        );
    }

    #[test]
    fn test_load_missing_directory_is_empty() {
        let registry = DescriptorRegistry::new();
        assert_eq!(
            registry
                .load_directory(Path::new("/definitely/not/here"))
                .unwrap(),
            0
        );
    }
}
