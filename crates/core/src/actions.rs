use crate::connections::ConnectionDescriptor;
use crate::databases::DatabaseRecord;
use crate::server_info::ServerInfoPatch;
use crate::settings::ServerSettings;
use crate::state::{ConnectionStatus, Features};
use crate::transport::{RecordSet, SessionInfo};

const NOT_LOST_CODES: [&str; 2] = [
    "Neo.TransientError.General.DatabaseUnavailable",
    "Neo.ClientError.Security.AuthorizationExpired",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Auto,
    System,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Warning,
    Error,
}

/// User-visible message raised by the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub code: Option<String>,
    pub message: String,
}

impl Notice {
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            code: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn error(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLoss {
    pub code: String,
    pub message: String,
}

impl ConnectionLoss {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Transient database unavailability and expired authorization keep the
    /// session alive; everything else counts as a lost connection.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        !NOT_LOST_CODES.contains(&self.code.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ConnectionStateChanged(ConnectionStatus),
    /// Credentials currently being tried; kept across `CredentialsExpired`.
    SetPendingConnection(ConnectionDescriptor),
    ConnectionSuccess {
        descriptor: ConnectionDescriptor,
        session: SessionInfo,
    },
    LostConnection(ConnectionLoss),
    DisconnectionSuccess,
    ClearRequestedDatabase {
        id: String,
    },
    UseDb(Option<String>),
    PasswordChangeNeeded(bool),
    UpdateMeta {
        result: Option<RecordSet>,
        context: Option<String>,
    },
    UpdateServerInfo(ServerInfoPatch),
    UpdateClusterRole(String),
    UpdateDatabases(Vec<DatabaseRecord>),
    UpdateSettings(ServerSettings),
    SetRetainCredentials(bool),
    SetAuthEnabled(bool),
    SetClientConfig {
        host: String,
        available: bool,
    },
    SetServerConfigReadable(bool),
    FeatureDetectionDone(Features),
    ForceFetch,
    FetchServerInfo,
    DbMetaDone,
    ServerConfigDone,
    ExecuteCommand {
        command: String,
        source: CommandSource,
    },
    SetEditorContent(String),
    FocusEditor,
    Notify(Notice),
    ClearNotice,
}
