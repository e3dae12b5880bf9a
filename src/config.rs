//! Configuration handling for wg-relay

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "wg-relay.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Last-applied snapshot, owner read/write only
    pub state_file: PathBuf,
    /// Where relay interface configs are written
    pub upstream_dir: PathBuf,
    /// Record set handed over by the record store
    pub records_file: PathBuf,
    /// Upper bound on any single external command
    pub command_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/var/lib/wg-relay/routing-state.json"),
            upstream_dir: PathBuf::from("/etc/wireguard/upstreams"),
            records_file: PathBuf::from("/var/lib/wg-relay/records.json"),
            command_timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    /// Locations searched when no config file is given, in order
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".wg-relay").join("config.toml"));
        }
        paths.push(PathBuf::from("/etc/wg-relay/config.toml"));
        paths
    }

    /// Load the first config found, or defaults when there is none
    pub fn discover() -> Result<(Self, Option<PathBuf>), ConfigError> {
        Self::discover_in(&Self::search_paths())
    }

    fn discover_in(paths: &[PathBuf]) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match paths.iter().find(|p| p.is_file()) {
            Some(path) => Ok((Self::load(path)?, Some(path.clone()))),
            None => Ok((Self::default(), None)),
        }
    }
}
