//! Process configuration loaded from `config.toml`.
//!
//! A missing file yields defaults; every section and field is optional.

pub mod schema;

pub use schema::{Config, GatewayConfig, LogConfig, StorageConfig, SupervisorConfig};

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "whatsmux";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// `<config_dir>/config.toml`, or `./config.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

pub(crate) fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl Config {
    /// Load from `path` (or the default location) and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(default_config_path, Path::to_path_buf);
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.supervisor.interval_secs == 0 {
            bail!("supervisor.interval_secs must be greater than zero");
        }
        if self.gateway.port == 0 {
            bail!("gateway.port must be greater than zero");
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            bail!("storage.data_dir cannot be empty");
        }
        let pairing = self.gateway.pairing_timeout_secs;
        if pairing == 0 || pairing >= crate::gateway::REQUEST_TIMEOUT_SECS {
            bail!(
                "gateway.pairing_timeout_secs must be between 1 and {}",
                crate::gateway::REQUEST_TIMEOUT_SECS - 1
            );
        }
        if self.gateway.admin_username.is_some() != self.gateway.admin_password.is_some() {
            bail!("gateway.admin_username and gateway.admin_password must be set together");
        }
        Ok(())
    }

    /// Admin credentials, when both halves are configured.
    pub fn admin_credentials(&self) -> Option<(String, String)> {
        match (&self.gateway.admin_username, &self.gateway.admin_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}
