//! Configuration management for mqtunnel

mod agent;
pub mod serde_utils;

pub use agent::{AgentConfig, DEFAULT_CONTROL_TOPIC};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Where a configuration document comes from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A TOML file on disk
    File(PathBuf),
    /// An in-memory TOML document
    Buffer(String),
}

impl ConfigSource {
    /// Load and deserialize the document
    pub fn load<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConfigError> {
        match self {
            ConfigSource::File(path) => load_config(path),
            ConfigSource::Buffer(content) => load_config_str(content),
        }
    }
}

impl From<PathBuf> for ConfigSource {
    fn from(path: PathBuf) -> Self {
        ConfigSource::File(path)
    }
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    load_config_str(&content)
}

/// Load configuration from an in-memory TOML document
pub fn load_config_str<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, ConfigError> {
    let config: T = toml::from_str(content)?;
    Ok(config)
}
