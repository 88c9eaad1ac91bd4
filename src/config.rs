use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// One monitored host. Loaded once at startup and immutable for the
/// process lifetime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation error: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.refresh_interval < 1 {
            return Err(ConfigError::Validation(
                "refresh_interval must be >= 1".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "command_timeout_ms must be > 0".to_string(),
            ));
        }

        validate_hosts(&self.hosts)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_hosts(hosts: &[HostConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for host in hosts {
        if host.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "hosts[*].name must not be empty".to_string(),
            ));
        }
        if !names.insert(host.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "host name '{}' must be unique",
                host.name
            )));
        }
        if host.hostname.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "host '{}' hostname must not be empty",
                host.name
            )));
        }
        if host.port == 0 {
            return Err(ConfigError::Validation(format!(
                "host '{}' port must be in range 1..65535",
                host.name
            )));
        }
        if host.username.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "host '{}' username must not be empty",
                host.name
            )));
        }
    }
    Ok(())
}

const fn default_refresh_interval() -> u64 {
    5
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_command_timeout_ms() -> u64 {
    15_000
}
