use crate::supervisor::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub supervisor: SupervisorConfig,
    pub gateway: GatewayConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the per-user identity and key stores.
    pub data_dir: PathBuf,
    /// Keep key material in its own `user_{id}_keys.db`.
    pub separate_key_store: bool,
    pub users_db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = super::default_data_dir();
        Self {
            data_dir: base.join("storages"),
            separate_key_store: true,
            users_db: base.join("users.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub enabled: bool,
    /// Period of the health sweep.
    pub interval_secs: u64,
    /// Delay before the boot sweep runs.
    pub boot_grace_secs: u64,
    /// Which sessions the boot sweep reconnects.
    pub boot_policy: ReconnectPolicy,
    /// Which sessions the periodic sweep reconnects.
    pub periodic_policy: ReconnectPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            boot_grace_secs: 2,
            boot_policy: ReconnectPolicy::LoggedInOnly,
            periodic_policy: ReconnectPolicy::AnyDisconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    /// How long `/app/login` waits for a pairing code.
    pub pairing_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            admin_username: None,
            admin_password: None,
            pairing_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: Option<String>,
}
