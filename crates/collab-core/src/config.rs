//! Session configuration.

use crate::shadow::AttributeFilter;
use crate::undo::{DEFAULT_MAX_STEPS, DEFAULT_MERGE_INTERVAL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for one collaboration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollabConfig {
    /// Display name shown next to our cursor on other peers.
    pub name: String,

    /// Cursor color. Derived from the peer id when unset.
    pub color: Option<String>,

    /// Attribute keys to synchronize. `null` synchronizes all of them.
    pub attributes: AttributeFilter,

    /// Seed an empty shared document from the local one on first sync.
    /// Only one peer per document should set this.
    pub bootstrap: bool,

    pub undo: UndoConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            name: "Anonymous".to_string(),
            color: None,
            attributes: AttributeFilter::All,
            bootstrap: false,
            undo: UndoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UndoConfig {
    /// Maximum number of undo steps kept (default: 100)
    pub max_steps: usize,

    /// Local edits closer together than this merge into one step (default: 500 ms)
    pub merge_interval_ms: u64,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            merge_interval_ms: DEFAULT_MERGE_INTERVAL.as_millis() as u64,
        }
    }
}

impl UndoConfig {
    pub fn merge_interval(&self) -> Duration {
        Duration::from_millis(self.merge_interval_ms)
    }
}

impl CollabConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_attributes(mut self, attributes: AttributeFilter) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_undo(mut self, max_steps: usize, merge_interval: Duration) -> Self {
        self.undo = UndoConfig {
            max_steps,
            merge_interval_ms: merge_interval.as_millis() as u64,
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config = CollabConfig::from_json("{}").unwrap();
        assert_eq!(config, CollabConfig::default());
        assert_eq!(config.undo.max_steps, 100);
        assert_eq!(config.undo.merge_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_camel_case() {
        let config = CollabConfig::from_json(
            r##"{
                "name": "ana",
                "color": "#3cb44b",
                "attributes": ["align", "indent"],
                "bootstrap": true,
                "undo": { "maxSteps": 20, "mergeIntervalMs": 0 }
            }"##,
        )
        .unwrap();
        assert_eq!(config.name, "ana");
        assert_eq!(config.color.as_deref(), Some("#3cb44b"));
        assert!(config.attributes.allows("align"));
        assert!(!config.attributes.allows("color"));
        assert!(config.bootstrap);
        assert_eq!(config.undo.max_steps, 20);
        assert_eq!(config.undo.merge_interval(), Duration::ZERO);
    }

    #[test]
    fn test_null_attributes_means_all() {
        let config = CollabConfig::from_json(r#"{"attributes": null}"#).unwrap();
        assert_eq!(config.attributes, AttributeFilter::All);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            CollabConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("collab.json");
        std::fs::write(&path, r#"{"name": "bo", "bootstrap": true}"#).unwrap();
        let config = CollabConfig::load(&path).unwrap();
        assert_eq!(config.name, "bo");
        assert!(config.bootstrap);
        assert_eq!(config.undo, UndoConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            CollabConfig::load("/nonexistent/collab.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
