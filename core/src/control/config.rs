// Node configuration
//
// Persisted as pretty JSON. Keys the node does not know about are carried
// through untouched so operator tooling can store its own settings.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Config JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEntry {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub cache_level: u32,
    pub relay_port: u16,
    pub auto_listen: bool,
    pub logs_enabled: bool,
    pub pubkeys: Vec<String>,
    pub relays: Vec<RelayEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            owner: None,
            cache_level: 3,
            relay_port: 2012,
            auto_listen: true,
            logs_enabled: true,
            pubkeys: Vec::new(),
            relays: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl NodeConfig {
    /// Shallow-merge `patch` over this config
    pub fn merged(&self, patch: &Map<String, Value>) -> Result<Self, ConfigError> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut value {
            for (key, patch_value) in patch {
                fields.insert(key.clone(), patch_value.clone());
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Configuration collaborator
pub trait ConfigStore: Send + Sync {
    fn get(&self) -> NodeConfig;
    /// Merge `patch` and persist; emits `config:updated`
    fn merge(&self, patch: &Map<String, Value>) -> Result<(), ConfigError>;
    fn subscribe(&self) -> broadcast::Receiver<NodeConfig>;
}

/// Config kept in memory, optionally mirrored to a JSON file
pub struct FileConfigStore {
    path: Option<PathBuf>,
    config: RwLock<NodeConfig>,
    updated: broadcast::Sender<NodeConfig>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileConfigStore {
    /// Load from `path`, writing defaults if the file does not exist
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(io_error(&path))?;
            serde_json::from_str(&contents)?
        } else {
            let config = NodeConfig::default();
            write_config(&path, &config)?;
            info!(path = %path.display(), "Created default config");
            config
        };
        Ok(Self::with_path(Some(path), config))
    }

    /// Never touches disk
    pub fn in_memory(config: NodeConfig) -> Self {
        Self::with_path(None, config)
    }

    fn with_path(path: Option<PathBuf>, config: NodeConfig) -> Self {
        let (updated, _) = broadcast::channel(16);
        Self {
            path,
            config: RwLock::new(config),
            updated,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn write_config(path: &Path, config: &NodeConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    std::fs::write(path, contents).map_err(io_error(path))
}

impl ConfigStore for FileConfigStore {
    fn get(&self) -> NodeConfig {
        self.config.read().clone()
    }

    fn merge(&self, patch: &Map<String, Value>) -> Result<(), ConfigError> {
        let merged = {
            let mut config = self.config.write();
            let merged = config.merged(patch)?;
            if let Some(path) = &self.path {
                write_config(path, &merged)?;
            }
            *config = merged.clone();
            merged
        };
        let _ = self.updated.send(merged);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeConfig> {
        self.updated.subscribe()
    }
}
