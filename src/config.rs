//! Configuration handling for pia-wg
//!
//! Settings come from a TOML file; `main` lays environment variables and
//! command-line flags over the result.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::wireguard::wg_quick::DEFAULT_WIREGUARD_DIR;

pub const DEFAULT_CONFIG_FILE: &str = "pia-wg.toml";
pub const DEFAULT_INTERFACE: &str = "pia";
const APP_DIR: &str = "pia-wg";
const CA_CERT_FILE: &str = "ca.rsa.4096.crt";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Missing required parameter: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub username: Option<String>,
    pub password: Option<String>,
    pub region: Option<String>,
    pub port_forward: bool,
    /// Run when a new port is forwarded; `{port}` is replaced by the port
    pub port_forward_command: Option<String>,
    pub data_file: Option<PathBuf>,
    pub interface: String,
    pub wireguard_dir: PathBuf,
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            region: None,
            port_forward: false,
            port_forward_command: None,
            data_file: None,
            interface: DEFAULT_INTERFACE.to_string(),
            wireguard_dir: PathBuf::from(DEFAULT_WIREGUARD_DIR),
            log_level: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `./pia-wg.toml`, else the per-user config file, else defaults
    pub fn load_default() -> Result<Self, ConfigError> {
        for path in default_locations() {
            if path.exists() {
                debug!("Loading config from {}", path.display());
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn username(&self) -> Result<&str, ConfigError> {
        self.username.as_deref().ok_or(ConfigError::Missing("username"))
    }

    pub fn region(&self) -> Result<&str, ConfigError> {
        self.region.as_deref().ok_or(ConfigError::Missing("region"))
    }

    pub fn data_file(&self) -> PathBuf {
        self.data_file.clone().unwrap_or_else(default_data_file)
    }

    /// The provider CA is cached beside the data file
    pub fn ca_cert_path(&self) -> PathBuf {
        let data_file = self.data_file();
        match data_file.parent() {
            Some(dir) => dir.join(CA_CERT_FILE),
            None => PathBuf::from(CA_CERT_FILE),
        }
    }
}

fn default_locations() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join(APP_DIR).join("config.toml"));
    }
    paths
}

fn default_data_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("data.json")
}
