//! Runtime configuration and subsystem modules
//!
//! This module provides the `DirectorConfig` shared by the director and its
//! instrumenters, and hosts the actor, sandbox and capability submodules.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

// Submodules
pub mod director;
pub mod error;
pub mod ids;
pub mod instrumenter;
pub mod navigation;
pub mod page;
pub mod realm;
pub mod sandbox;
pub mod transport;

use error::{ConfigError, ConfigResult};

/// What `install` does when the requested id is already registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateIdPolicy {
    /// Fail with `DuplicateId` and leave the registered instrumenter untouched
    #[default]
    Reject,
    /// Swap the registry entry and finalize the previous instrumenter
    Replace,
}

/// What `callMethod` returns when the export does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingMethodPolicy {
    /// Answer with JSON `null`
    #[default]
    ReturnNull,
    /// Fail with `MethodNotFound`
    Error,
}

/// Flags forwarded to the realm factory for every sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmSettings {
    /// Expose page objects through x-ray wrappers
    pub xrays: bool,

    /// Install the realm's export helper functions
    pub export_helpers: bool,

    /// Expose privileged component objects to the realm
    pub components: bool,

    /// Principal recorded in the sandbox metadata
    pub principal: String,
}

impl Default for RealmSettings {
    fn default() -> Self {
        Self {
            xrays: true,
            export_helpers: false,
            components: false,
            principal: "director".to_string(),
        }
    }
}

/// Logging configuration consumed by [`crate::logging::init`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive string
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Configuration for a director and the instrumenters it creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    /// Behaviour of `install` on an id that is already registered
    pub duplicate_ids: DuplicateIdPolicy,

    /// Behaviour of `callMethod` on a missing export
    pub missing_method: MissingMethodPolicy,

    /// Sandbox creation flags
    pub realm: RealmSettings,

    /// URL tag for page evaluations submitted by instrumenters
    pub evaluation_url_prefix: String,

    /// Upper bound on simultaneously installed instrumenters
    pub max_instrumenters: Option<usize>,

    /// Logging setup
    pub log: LogConfig,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            duplicate_ids: DuplicateIdPolicy::Reject,
            missing_method: MissingMethodPolicy::ReturnNull,
            realm: RealmSettings::default(),
            evaluation_url_prefix: "instrumenter@".to_string(),
            max_instrumenters: None,
            log: LogConfig::default(),
        }
    }
}

impl DirectorConfig {
    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: DirectorConfig =
            serde_json::from_slice(&data).context("Failed to deserialize config")?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Check field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_instrumenters == Some(0) {
            return Err(ConfigError::Invalid(
                "max_instrumenters must be at least 1".into(),
            ));
        }
        if self.evaluation_url_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "evaluation_url_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = DirectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.duplicate_ids, DuplicateIdPolicy::Reject);
        assert_eq!(config.missing_method, MissingMethodPolicy::ReturnNull);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("director.json");

        let config = DirectorConfig {
            duplicate_ids: DuplicateIdPolicy::Replace,
            max_instrumenters: Some(4),
            ..DirectorConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = DirectorConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("director.json");
        std::fs::write(&path, r#"{"missing_method": "error"}"#).unwrap();

        let loaded = DirectorConfig::load(&path).unwrap();
        assert_eq!(loaded.missing_method, MissingMethodPolicy::Error);
        assert_eq!(loaded.realm, RealmSettings::default());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = DirectorConfig {
            max_instrumenters: Some(0),
            ..DirectorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
