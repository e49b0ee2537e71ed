//! Configuration types for donut
//!
//! Settings are read from a TOML file by the CLI; the storage section is
//! also consumed directly by the coordinator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Root configuration for a donut domain
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Domain identity
    #[serde(default)]
    pub domain: DomainSettings,
    /// Node name to ordered disk paths
    #[serde(default)]
    pub nodes: BTreeMap<String, Vec<String>>,
    /// Storage tuning
    #[serde(default)]
    pub storage: StorageSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Parse settings from a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Serialize settings back into TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// Domain identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainSettings {
    /// Domain name; becomes the directory created on every disk
    #[serde(default = "default_domain_name")]
    pub name: String,
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            name: default_domain_name(),
        }
    }
}

fn default_domain_name() -> String {
    "donut".to_string()
}

/// Storage tuning shared by every disk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Copy buffer size for streaming object data
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// fsync data and metadata files before renaming them into place
    #[serde(default)]
    pub sync_writes: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            sync_writes: false,
        }
    }
}

fn default_buffer_size() -> usize {
    64 * 1024
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.domain.name, "donut");
        assert_eq!(settings.storage.buffer_size, 64 * 1024);
        assert!(!settings.storage.sync_writes);
        assert_eq!(settings.logging.level, "info");
        assert!(settings.nodes.is_empty());
    }

    #[test]
    fn test_parse_settings() {
        let settings = Settings::from_toml_str(
            r#"
            [domain]
            name = "photos"

            [nodes]
            node1 = ["/mnt/disk0", "/mnt/disk1"]
            node2 = ["/mnt/disk2"]

            [storage]
            sync_writes = true
            "#,
        )
        .unwrap();

        assert_eq!(settings.domain.name, "photos");
        assert_eq!(settings.nodes["node1"], vec!["/mnt/disk0", "/mnt/disk1"]);
        assert_eq!(settings.nodes["node2"].len(), 1);
        assert!(settings.storage.sync_writes);
        assert_eq!(settings.storage.buffer_size, 64 * 1024);
    }

    #[test]
    fn test_load_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("donut.toml");

        let mut settings = Settings::default();
        settings
            .nodes
            .insert("node1".to_string(), vec!["/tmp/d0".to_string()]);
        std::fs::write(&path, settings.to_toml_string().unwrap()).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.nodes, settings.nodes);

        assert!(matches!(
            Settings::load(dir.path().join("missing.toml")),
            Err(Error::Configuration(_))
        ));
        assert!(Settings::from_toml_str("nodes = 3").is_err());
    }
}
