//! Engine configuration.
//!
//! # Example YAML
//!
//! ```yaml
//! events:
//!   mode: async
//!   worker_threads: 2
//!   thread_name: capability-events
//! descriptors:
//!   search_paths:
//!     - /etc/capabilities/descriptors
//! ```
//!
//! Every field is optional. Environment variables override the file:
//! `CAPABILITIES_EVENT_MODE`, `CAPABILITIES_WORKER_THREADS` and
//! `CAPABILITIES_DESCRIPTOR_PATH` (a path list using the platform separator).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{CapabilityRegistry, DescriptorError, DescriptorRegistry};
use crate::events::{AsyncEventBus, EventBus, EventChannel};

pub const ENV_EVENT_MODE: &str = "CAPABILITIES_EVENT_MODE";
pub const ENV_WORKER_THREADS: &str = "CAPABILITIES_WORKER_THREADS";
pub const ENV_DESCRIPTOR_PATH: &str = "CAPABILITIES_DESCRIPTOR_PATH";

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Descriptor loading failed: {0}")]
    Descriptor(#[from] DescriptorError),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// How the event channel delivers events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventMode {
    /// On the publishing thread, before `publish` returns.
    #[default]
    Sync,
    /// On a dedicated dispatch runtime.
    Async,
}

impl FromStr for EventMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sync" => Ok(EventMode::Sync),
            "async" => Ok(EventMode::Async),
            other => Err(ConfigError::Invalid(format!(
                "unknown event mode '{other}' (expected 'sync' or 'async')"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub mode: EventMode,
    /// Tokio worker threads for the async bus.
    pub worker_threads: usize,
    pub thread_name: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            mode: EventMode::Sync,
            worker_threads: 1,
            thread_name: "capability-events".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorsConfig {
    /// Directories scanned recursively for descriptor YAML files.
    pub search_paths: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub events: EventsConfig,
    pub descriptors: DescriptorsConfig,
}

impl EngineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Apply the `CAPABILITIES_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, then re-validate.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(mode) = lookup(ENV_EVENT_MODE) {
            self.events.mode = mode.parse()?;
        }
        if let Some(threads) = lookup(ENV_WORKER_THREADS) {
            self.events.worker_threads = threads.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_WORKER_THREADS} must be a number, got '{threads}'"))
            })?;
        }
        if let Some(paths) = lookup(ENV_DESCRIPTOR_PATH) {
            self.descriptors.search_paths = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.events.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "events.worker_threads must be at least 1".to_string(),
            ));
        }
        if self.events.thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "events.thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured event channel.
    pub fn build_channel(&self) -> Result<Arc<dyn EventChannel>, ConfigError> {
        self.validate()?;
        let channel: Arc<dyn EventChannel> = match self.events.mode {
            EventMode::Sync => Arc::new(EventBus::new()),
            EventMode::Async => Arc::new(AsyncEventBus::new(
                self.events.worker_threads,
                &self.events.thread_name,
            )?),
        };
        tracing::debug!(mode = ?self.events.mode, "event channel started");
        Ok(channel)
    }

    /// A descriptor registry loaded from every search path.
    pub fn build_descriptors(&self) -> Result<DescriptorRegistry, ConfigError> {
        let registry = DescriptorRegistry::with_search_paths(self.descriptors.search_paths.clone());
        let loaded = registry.load_all()?;
        tracing::info!(
            descriptors = loaded,
            search_paths = registry.search_paths().len(),
            "capability descriptors loaded"
        );
        Ok(registry)
    }

    /// Channel, descriptors and registry wired together.
    pub fn build_registry(&self) -> Result<Arc<CapabilityRegistry>, ConfigError> {
        let channel = self.build_channel()?;
        let descriptors = Arc::new(self.build_descriptors()?);
        Ok(CapabilityRegistry::new(channel, descriptors))
    }
}
