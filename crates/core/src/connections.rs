use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_USERNAME: &str = "neo4j";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthenticationMethod {
    #[default]
    Native,
    NoAuth,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PasswordSource {
    #[default]
    Inline,
    EnvVar,
    Keyring,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub authentication_method: AuthenticationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_use_db: Option<String>,
    #[serde(default)]
    pub store_credentials: bool,
    #[serde(default)]
    pub password_source: PasswordSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_saved_at_unix_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyring_service: Option<String>,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("authentication_method", &self.authentication_method)
            .field("requested_use_db", &self.requested_use_db)
            .field("store_credentials", &self.store_credentials)
            .field("password_source", &self.password_source)
            .finish_non_exhaustive()
    }
}

impl ConnectionDescriptor {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            username: username.into(),
            password: None,
            authentication_method: AuthenticationMethod::Native,
            requested_use_db: None,
            store_credentials: true,
            password_source: PasswordSource::Inline,
            credentials_saved_at_unix_ms: None,
            keyring_service: None,
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn requested_database(&self) -> Option<&str> {
        self.requested_use_db
            .as_deref()
            .filter(|requested| !requested.is_empty())
    }

    /// `NoAuth` blanks both credentials; switching back to `Native` restores
    /// the default username when none is set.
    pub fn set_authentication_method(&mut self, method: AuthenticationMethod) {
        self.authentication_method = method;
        match method {
            AuthenticationMethod::NoAuth => {
                self.username.clear();
                self.password = Some(String::new());
            }
            AuthenticationMethod::Native => {
                if self.username.is_empty() {
                    self.username = DEFAULT_USERNAME.to_string();
                }
            }
        }
    }

    /// Copy suitable for writing to disk.
    #[must_use]
    pub fn persisted(&self, retain_credentials: bool, now_unix_ms: u64) -> Self {
        let mut persisted = self.clone();
        let keep_password = retain_credentials
            && self.store_credentials
            && self.password_source == PasswordSource::Inline
            && self.password.is_some();
        if keep_password {
            persisted.credentials_saved_at_unix_ms = Some(now_unix_ms);
        } else {
            persisted.password = None;
            persisted.credentials_saved_at_unix_ms = None;
        }
        persisted
    }
}

#[derive(Debug, Error)]
pub enum ConnectionsError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read connections file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse connections file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize connections: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write connections file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConnectionsDocument {
    #[serde(default)]
    connections: Vec<ConnectionDescriptor>,
}

impl ConnectionsDocument {
    fn normalize(&mut self) {
        let mut by_id = std::collections::BTreeMap::new();
        for connection in self.connections.drain(..) {
            by_id.insert(connection.id.clone(), connection);
        }
        self.connections = by_id.into_values().collect();
    }
}

#[derive(Debug, Clone)]
pub struct FileConnectionsStore {
    path: PathBuf,
    connections: Vec<ConnectionDescriptor>,
}

impl FileConnectionsStore {
    pub fn load_default() -> Result<Self, ConnectionsError> {
        let path = default_config_dir()?.join("connections.toml");
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, ConnectionsError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                connections: Vec::new(),
            });
        }

        let raw = fs::read_to_string(&path).map_err(|source| ConnectionsError::Read {
            path: path.clone(),
            source,
        })?;

        if raw.trim().is_empty() {
            return Ok(Self {
                path,
                connections: Vec::new(),
            });
        }

        let mut doc: ConnectionsDocument =
            toml::from_str(&raw).map_err(|source| ConnectionsError::Parse {
                path: path.clone(),
                source,
            })?;
        doc.normalize();

        Ok(Self {
            path,
            connections: doc.connections,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn connections(&self) -> &[ConnectionDescriptor] {
        &self.connections
    }

    #[must_use]
    pub fn connection(&self, id: &str) -> Option<&ConnectionDescriptor> {
        self.connections.iter().find(|connection| connection.id == id)
    }

    pub fn upsert_connection(&mut self, connection: ConnectionDescriptor) {
        if let Some(existing) = self
            .connections
            .iter_mut()
            .find(|existing| existing.id == connection.id)
        {
            *existing = connection;
        } else {
            self.connections.push(connection);
            self.connections.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        }
    }

    /// Stores the descriptor, keeping its password only when retention allows.
    pub fn save_credentials(
        &mut self,
        descriptor: &ConnectionDescriptor,
        retain_credentials: bool,
        now_unix_ms: u64,
    ) -> Result<(), ConnectionsError> {
        self.upsert_connection(descriptor.persisted(retain_credentials, now_unix_ms));
        self.persist()
    }

    /// Drops saved passwords older than `timeout`. A zero timeout never expires.
    /// Returns the ids whose credentials were removed.
    pub fn purge_expired_credentials(
        &mut self,
        now_unix_ms: u64,
        timeout: Duration,
    ) -> Vec<String> {
        if timeout.is_zero() {
            return Vec::new();
        }
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let mut purged = Vec::new();
        for connection in &mut self.connections {
            let Some(saved_at) = connection.credentials_saved_at_unix_ms else {
                continue;
            };
            if now_unix_ms.saturating_sub(saved_at) >= timeout_ms {
                connection.password = None;
                connection.credentials_saved_at_unix_ms = None;
                purged.push(connection.id.clone());
            }
        }
        purged
    }

    pub fn persist(&self) -> Result<(), ConnectionsError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| ConnectionsError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let doc = ConnectionsDocument {
            connections: self.connections.clone(),
        };
        let rendered = toml::to_string_pretty(&doc)
            .map_err(|source| ConnectionsError::Serialize { source })?;

        fs::write(&self.path, rendered).map_err(|source| ConnectionsError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

#[must_use]
pub fn unix_timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

pub fn default_config_dir() -> Result<PathBuf, ConnectionsError> {
    let base_dir = if let Some(custom) = env::var_os("CYPHERDECK_CONFIG_DIR") {
        PathBuf::from(custom)
    } else if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(ConnectionsError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(ConnectionsError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("cypherdeck"))
}
