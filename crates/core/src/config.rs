use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connections::{default_config_dir, ConnectionsError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub scheme_retry_delay_ms: u64,
    /// Scheme toggles allowed per connect attempt.
    pub max_scheme_toggles: u32,
    pub password_change_attempts: u32,
    pub password_change_retry_ms: u64,
    /// How often a lost connection is checked while retrying.
    pub health_check_interval_ms: u64,
    pub allowed_schemes: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scheme_retry_delay_ms: 5_000,
            max_scheme_toggles: 1,
            password_change_attempts: 5,
            password_change_retry_ms: 200,
            health_check_interval_ms: 5_000,
            allowed_schemes: ["neo4j", "neo4j+s", "neo4j+ssc", "bolt", "bolt+s", "bolt+ssc"]
                .iter()
                .map(|scheme| (*scheme).to_string())
                .collect(),
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn scheme_retry_delay(&self) -> Duration {
        Duration::from_millis(self.scheme_retry_delay_ms)
    }

    #[must_use]
    pub fn password_change_retry_interval(&self) -> Duration {
        Duration::from_millis(self.password_change_retry_ms)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetadataConfig {
    pub poll_interval_ms: u64,
    pub use_cypher_thread: bool,
    pub tx_metadata_app: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20_000,
            use_cypher_thread: true,
            tx_metadata_app: "cypherdeck".to_string(),
        }
    }
}

impl MetadataConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SysInfoConfig {
    pub refresh_interval_secs: u64,
}

impl Default for SysInfoConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EditorConfig {
    pub cmdchar: String,
    pub init_command: Option<String>,
    pub play_implicit_init_commands: bool,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            cmdchar: ":".to_string(),
            init_command: Some(":play start".to_string()),
            play_implicit_init_commands: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BrowserConfig {
    pub connection: ConnectionConfig,
    pub metadata: MetadataConfig,
    pub sysinfo: SysInfoConfig,
    pub editor: EditorConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to resolve default config path: {0}")]
    Location(#[from] ConnectionsError),
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl BrowserConfig {
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_from_path(default_config_dir()?.join("config.toml"))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
