use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = ".hearth/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HearthConfig {
    /// Directory holding every persisted core file (tasks, switches,
    /// kill token, key file, user records).
    pub state_dir: PathBuf,
    pub log_level: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-task scans.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Encryption operations allowed under one key before rotation.
    #[serde(default = "default_rotation_max_operations")]
    pub rotation_max_operations: u64,
    /// Seconds a key may stay installed before rotation.
    #[serde(default = "default_rotation_max_age_secs")]
    pub rotation_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    /// Environment variable holding the pre-hashed reset credential.
    #[serde(default = "default_reset_hash_env")]
    pub reset_hash_env: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rotation_max_operations: default_rotation_max_operations(),
            rotation_max_age_secs: default_rotation_max_age_secs(),
        }
    }
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            reset_hash_env: default_reset_hash_env(),
        }
    }
}

impl Default for HearthConfig {
    fn default() -> Self {
        let state_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hearth/state");

        Self {
            state_dir,
            log_level: "info".to_string(),
            scheduler: SchedulerConfig::default(),
            security: SecurityConfig::default(),
            kill_switch: KillSwitchConfig::default(),
        }
    }
}

fn default_tick_secs() -> u64 {
    1
}

fn default_rotation_max_operations() -> u64 {
    1000
}

fn default_rotation_max_age_secs() -> u64 {
    86_400
}

fn default_reset_hash_env() -> String {
    "HEARTH_KILL_RESET_HASH".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize default config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("config has invalid value: {0}")]
    ValidationFailed(String),
}

impl HearthConfig {
    pub fn resolve_path() -> PathBuf {
        if let Ok(path) = env::var("HEARTH_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, raw).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn load_or_create() -> Result<(Self, PathBuf, bool), ConfigError> {
        let path = Self::resolve_path();
        if path.exists() {
            let cfg = Self::load(&path)?;
            return Ok((cfg, path, false));
        }

        let cfg = Self::default();
        cfg.save(&path)?;
        Ok((cfg, path, true))
    }

    pub fn validate_and_prepare(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "log_level cannot be empty".to_string(),
            ));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "scheduler.tick_secs must be at least 1".to_string(),
            ));
        }
        if self.security.rotation_max_operations == 0 {
            return Err(ConfigError::ValidationFailed(
                "security.rotation_max_operations must be at least 1".to_string(),
            ));
        }
        if self.security.rotation_max_age_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "security.rotation_max_age_secs must be at least 1".to_string(),
            ));
        }
        if self.kill_switch.reset_hash_env.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "kill_switch.reset_hash_env cannot be empty".to_string(),
            ));
        }
        fs::create_dir_all(&self.state_dir).map_err(|source| ConfigError::WriteFailed {
            path: self.state_dir.clone(),
            source,
        })?;
        Ok(())
    }
}
