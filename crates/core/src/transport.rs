use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::connections::ConnectionDescriptor;

pub const CREDENTIALS_EXPIRED_CODE: &str = "Neo.ClientError.Security.CredentialsExpired";
pub const UNAUTHORIZED_CODE: &str = "Neo.ClientError.Security.Unauthorized";
pub const PROCEDURE_NOT_FOUND_CODE: &str = "Neo.ClientError.Procedure.ProcedureNotFound";
pub const SERVICE_UNAVAILABLE_CODE: &str = "ServiceUnavailable";
pub const SESSION_EXPIRED_CODE: &str = "SessionExpired";
pub const NO_CONNECTION_CODE: &str = "No connection";

const ROUTING_DISCOVERY_MESSAGES: [&str; 2] = [
    "Could not perform discovery",
    "Unable to retrieve routing information",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CredentialsExpired,
    Unauthorized,
    UnsupportedRoutingScheme,
    ProcedureNotFound,
    ServiceUnavailable,
    NoConnection,
    Unknown,
}

impl ErrorKind {
    /// Maps a server-reported code (and, for routing failures, the message)
    /// onto the kind taxonomy. Matching is exact on the code string.
    #[must_use]
    pub fn classify(code: &str, message: &str) -> Self {
        match code {
            CREDENTIALS_EXPIRED_CODE => Self::CredentialsExpired,
            UNAUTHORIZED_CODE => Self::Unauthorized,
            PROCEDURE_NOT_FOUND_CODE => Self::ProcedureNotFound,
            NO_CONNECTION_CODE => Self::NoConnection,
            SERVICE_UNAVAILABLE_CODE
                if ROUTING_DISCOVERY_MESSAGES
                    .iter()
                    .any(|needle| message.contains(needle)) =>
            {
                Self::UnsupportedRoutingScheme
            }
            SERVICE_UNAVAILABLE_CODE | SESSION_EXPIRED_CODE => Self::ServiceUnavailable,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ConnectError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ConnectError {
    #[must_use]
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        Self {
            kind: ErrorKind::classify(&code, &message),
            code,
            message,
        }
    }

    #[must_use]
    pub fn no_connection() -> Self {
        Self::from_code(NO_CONNECTION_CODE, "No connection available")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct QueryError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl QueryError {
    #[must_use]
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        Self {
            kind: ErrorKind::classify(&code, &message),
            code,
            message,
        }
    }

    #[must_use]
    pub fn no_connection() -> Self {
        Self::from_code(NO_CONNECTION_CODE, "No connection available")
    }
}

impl From<ConnectError> for QueryError {
    fn from(error: ConnectError) -> Self {
        Self {
            kind: error.kind,
            code: error.code,
            message: error.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub server_agent: Option<String>,
    pub supports_multi_db: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Routing {
    #[default]
    Direct,
    Read,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryOptions {
    pub use_db: Option<String>,
    pub routing: Routing,
    /// Opaque hint forwarded to the transport.
    pub use_cypher_thread: bool,
    pub tx_metadata: Option<Value>,
}

impl QueryOptions {
    #[must_use]
    pub fn with_use_db(mut self, use_db: Option<&str>) -> Self {
        self.use_db = use_db.filter(|db| !db.is_empty()).map(str::to_string);
        self
    }

    #[must_use]
    pub fn routed_read(mut self) -> Self {
        self.routing = Routing::Read;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    keys: Vec<String>,
    values: Vec<Value>,
}

impl Record {
    #[must_use]
    pub fn new(keys: Vec<String>, values: Vec<Value>) -> Self {
        Self { keys, values }
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.keys
            .iter()
            .position(|candidate| candidate == key)
            .and_then(|index| self.values.get(index))
    }

    #[must_use]
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        self.keys
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordSet {
    pub records: Vec<Record>,
}

impl RecordSet {
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionLost { code: String, message: String },
    ConnectionRegained,
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost { code, message } => {
                write!(f, "connection lost ({code}): {message}")
            }
            Self::ConnectionRegained => f.write_str("connection regained"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<SessionInfo, ConnectError>;

    async fn verify_credentials(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), ConnectError>;

    async fn change_password(
        &self,
        descriptor: &ConnectionDescriptor,
        new_password: &str,
    ) -> Result<(), ConnectError>;

    async fn run_query(
        &self,
        query: &str,
        params: Map<String, Value>,
        options: &QueryOptions,
    ) -> Result<RecordSet, QueryError>;

    async fn disconnect(&self) {}

    /// Connection-state notifications, when the transport can observe them.
    fn subscribe_events(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        None
    }
}
