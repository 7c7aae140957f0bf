//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use synceddb_common::{Error, Result};

/// Endpoint paths, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPaths {
    pub create: String,
    pub read: String,
    pub update: String,
    pub delete: String,
    pub read_all: String,
    pub sync: String,
}

impl Default for SyncPaths {
    fn default() -> Self {
        Self {
            create: "/api/create".to_string(),
            read: "/api/read".to_string(),
            update: "/api/update".to_string(),
            delete: "/api/delete".to_string(),
            read_all: "/api/read_all".to_string(),
            sync: "/api/sync".to_string(),
        }
    }
}

impl SyncPaths {
    fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("create", self.create.as_str()),
            ("read", self.read.as_str()),
            ("update", self.update.as_str()),
            ("delete", self.delete.as_str()),
            ("read_all", self.read_all.as_str()),
            ("sync", self.sync.as_str()),
        ]
        .into_iter()
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Primary-key field inside every record.
    pub key_name: String,
    /// Base URL of the remote. Only the HTTP transport reads it.
    pub url: Option<String>,
    /// Endpoint paths.
    pub paths: SyncPaths,
    /// Run `sync()` whenever connectivity comes back.
    pub auto_sync: bool,
    /// Fabricate remote responses instead of calling the network.
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            key_name: "id".to_string(),
            url: None,
            paths: SyncPaths::default(),
            auto_sync: false,
            dry_run: false,
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file. Missing fields take their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = key_name.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_paths(mut self, paths: SyncPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Check the configuration for values no transport could use.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty key name or a path not starting with `/`
    pub fn validate(&self) -> Result<()> {
        if self.key_name.is_empty() {
            return Err(Error::InvalidInput("key_name cannot be empty".to_string()));
        }
        for (name, path) in self.paths.iter() {
            if !path.starts_with('/') {
                return Err(Error::InvalidInput(format!(
                    "path '{}' for {} must start with '/'",
                    path, name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.key_name, "id");
        assert_eq!(config.paths.read_all, "/api/read_all");
        assert!(!config.auto_sync);
        assert!(!config.dry_run);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"key_name": "uuid", "paths": {"sync": "/v2/sync"}}"#)
                .unwrap();
        assert_eq!(config.key_name, "uuid");
        assert_eq!(config.paths.sync, "/v2/sync");
        assert_eq!(config.paths.create, "/api/create");
    }

    #[test]
    fn test_validate_rejects_relative_path() {
        let mut paths = SyncPaths::default();
        paths.delete = "api/delete".to_string();
        let config = SyncConfig::default().with_paths(paths);
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));

        let config = SyncConfig::default().with_key_name("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"url": "http://localhost:8000", "auto_sync": true}}"#
        )
        .unwrap();

        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.url.as_deref(), Some("http://localhost:8000"));
        assert!(config.auto_sync);
    }

    #[test]
    fn test_from_json_file_missing() {
        let result = SyncConfig::from_json_file("/nonexistent/synceddb.json");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
