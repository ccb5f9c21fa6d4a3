use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cypherdeck_core::connections::{AuthenticationMethod, ConnectionDescriptor};
use cypherdeck_core::metadata::SYSTEM_DB;
use cypherdeck_core::scheme::{get_scheme, DEFAULT_SCHEME};
use cypherdeck_core::transport::{
    ConnectError, ErrorKind, QueryError, QueryOptions, Record, RecordSet, SessionInfo,
    Transport, TransportEvent, SERVICE_UNAVAILABLE_CODE, UNAUTHORIZED_CODE,
};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::keyring::resolve_password;

const HTTP_PORT: u16 = 7474;
const HTTPS_PORT: u16 = 7473;
const BOLT_PORT: u16 = 7687;
const DATABASE_PLACEHOLDER: &str = "{databaseName}";
const DEFAULT_DATABASE: &str = "neo4j";
const PROBE_QUERY: &str = "RETURN 1";
const ALTER_PASSWORD_QUERY: &str = "ALTER CURRENT USER SET PASSWORD FROM $old TO $new";
const LEGACY_CHANGE_PASSWORD_QUERY: &str = "CALL dbms.security.changePassword($password)";
const INVALID_HOST_CODE: &str = "Neo.ClientError.Request.Invalid";
const INVALID_RESPONSE_CODE: &str = "Neo.ClientError.Request.InvalidFormat";

#[derive(Debug, Error)]
pub enum HttpTransportError {
    #[error("`{host}` cannot be mapped to an HTTP endpoint")]
    InvalidHost { host: String },
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("server answered with HTTP {status}")]
    Status { status: u16 },
    #[error("response could not be decoded: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("{code}: {message}")]
    Server { code: String, message: String },
}

impl From<HttpTransportError> for ConnectError {
    fn from(error: HttpTransportError) -> Self {
        match error {
            HttpTransportError::InvalidHost { .. } => {
                Self::from_code(INVALID_HOST_CODE, error.to_string())
            }
            HttpTransportError::Network(_) => {
                Self::from_code(SERVICE_UNAVAILABLE_CODE, error.to_string())
            }
            HttpTransportError::Status { status }
                if status == StatusCode::UNAUTHORIZED.as_u16() =>
            {
                Self::from_code(UNAUTHORIZED_CODE, error.to_string())
            }
            HttpTransportError::Status { status } => {
                Self::from_code(format!("HTTP {status}"), error.to_string())
            }
            HttpTransportError::Decode(_) => {
                Self::from_code(INVALID_RESPONSE_CODE, error.to_string())
            }
            HttpTransportError::Server { code, message } => Self::from_code(code, message),
        }
    }
}

impl From<HttpTransportError> for QueryError {
    fn from(error: HttpTransportError) -> Self {
        ConnectError::from(error).into()
    }
}

/// Maps a `scheme://host:port` connection host onto the server's HTTP
/// endpoint. Encrypted schemes use HTTPS, and the default Bolt port is
/// swapped for the matching HTTP port.
pub fn http_base_from_host(host: &str) -> Result<Url, HttpTransportError> {
    let invalid = || HttpTransportError::InvalidHost {
        host: host.to_string(),
    };
    let scheme = get_scheme(host).unwrap_or(DEFAULT_SCHEME);
    if scheme == "http" || scheme == "https" {
        return Url::parse(host).map_err(|_| invalid());
    }

    let secure = scheme.ends_with("+s") || scheme.ends_with("+ssc");
    let address = host.split_once("://").map_or(host, |(_, address)| address);
    let http_scheme = if secure { "https" } else { "http" };
    let mut url = Url::parse(&format!("{http_scheme}://{address}")).map_err(|_| invalid())?;
    if matches!(url.port(), None | Some(BOLT_PORT)) {
        let port = if secure { HTTPS_PORT } else { HTTP_PORT };
        url.set_port(Some(port)).map_err(|()| invalid())?;
    }
    Ok(url)
}

#[derive(Debug, Clone, Deserialize)]
struct Discovery {
    transaction: String,
    #[serde(default)]
    neo4j_version: Option<String>,
    #[serde(default)]
    neo4j_edition: Option<String>,
}

impl Discovery {
    fn supports_multi_db(&self) -> bool {
        self.transaction.contains(DATABASE_PLACEHOLDER)
    }

    fn commit_url(&self, use_db: Option<&str>) -> String {
        if self.supports_multi_db() {
            let database = use_db.unwrap_or(DEFAULT_DATABASE);
            format!(
                "{}/commit",
                self.transaction.replace(DATABASE_PLACEHOLDER, database)
            )
        } else {
            format!("{}/commit", self.transaction.trim_end_matches('/'))
        }
    }

    fn server_agent(&self) -> Option<String> {
        self.neo4j_version
            .as_ref()
            .map(|version| format!("Neo4j/{version}"))
    }
}

#[derive(Debug, Default, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

impl TxResponse {
    fn into_record_set(self) -> Result<RecordSet, HttpTransportError> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(HttpTransportError::Server {
                code: error.code,
                message: error.message,
            });
        }
        let Some(result) = self.results.into_iter().next() else {
            return Ok(RecordSet::default());
        };
        let records = result
            .data
            .into_iter()
            .map(|row| Record::new(result.columns.clone(), row.row))
            .collect();
        Ok(RecordSet::new(records))
    }
}

#[derive(Clone)]
struct Credentials {
    method: AuthenticationMethod,
    username: String,
    password: Option<String>,
}

impl Credentials {
    fn from_descriptor(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            method: descriptor.authentication_method,
            username: descriptor.username.clone(),
            password: descriptor
                .password
                .clone()
                .or_else(|| resolve_password(descriptor)),
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self.method {
            AuthenticationMethod::Native => {
                request.basic_auth(&self.username, self.password.as_deref())
            }
            AuthenticationMethod::NoAuth => request,
        }
    }
}

#[derive(Clone)]
struct HttpSession {
    discovery: Discovery,
    credentials: Credentials,
}

/// Transport over the server's HTTP transactional endpoint.
///
/// Every query is a single auto-commit transaction. Routing hints are ignored
/// because the endpoint always serves the addressed instance.
pub struct HttpTransport {
    client: Client,
    session: Mutex<Option<HttpSession>>,
    lost: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("connected", &self.lock_session().is_some())
            .finish_non_exhaustive()
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl HttpTransport {
    #[must_use]
    pub fn new(client: Client) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            client,
            session: Mutex::new(None),
            lost: AtomicBool::new(false),
            events,
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<HttpSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn discover(&self, host: &str) -> Result<Discovery, HttpTransportError> {
        let base = http_base_from_host(host)?;
        debug!(%base, "discovering endpoints");
        let response = self
            .client
            .get(base)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(HttpTransportError::Network)?;
        if !response.status().is_success() {
            return Err(HttpTransportError::Status {
                status: response.status().as_u16(),
            });
        }
        response.json().await.map_err(HttpTransportError::Decode)
    }

    async fn commit(
        &self,
        session: &HttpSession,
        use_db: Option<&str>,
        statement: &str,
        parameters: Map<String, Value>,
    ) -> Result<RecordSet, HttpTransportError> {
        let body = json!({
            "statements": [{
                "statement": statement,
                "parameters": parameters,
                "resultDataContents": ["row"],
            }]
        });
        let request = self
            .client
            .post(session.discovery.commit_url(use_db))
            .header("Accept", "application/json")
            .json(&body);
        let response = session
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(HttpTransportError::Network)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let payload: TxResponse = response.json().await.unwrap_or_default();
            payload.into_record_set()?;
            return Err(HttpTransportError::Status {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(HttpTransportError::Status {
                status: status.as_u16(),
            });
        }

        let payload: TxResponse = response.json().await.map_err(HttpTransportError::Decode)?;
        payload.into_record_set()
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<HttpSession, ConnectError> {
        let discovery = self.discover(&descriptor.host).await?;
        let session = HttpSession {
            discovery,
            credentials: Credentials::from_descriptor(descriptor),
        };
        let probe_db = session.discovery.supports_multi_db().then_some(SYSTEM_DB);
        self.commit(&session, probe_db, PROBE_QUERY, Map::new())
            .await?;
        Ok(session)
    }

    fn note_outcome<T>(&self, outcome: &Result<T, QueryError>) {
        match outcome {
            Err(error) if error.kind == ErrorKind::ServiceUnavailable => {
                if !self.lost.swap(true, Ordering::SeqCst) {
                    warn!(code = %error.code, "connection lost");
                    let _ = self.events.send(TransportEvent::ConnectionLost {
                        code: error.code.clone(),
                        message: error.message.clone(),
                    });
                }
            }
            Ok(_) => {
                if self.lost.swap(false, Ordering::SeqCst) {
                    info!("connection regained");
                    let _ = self.events.send(TransportEvent::ConnectionRegained);
                }
            }
            Err(_) => {}
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<SessionInfo, ConnectError> {
        let session = self.open(descriptor).await?;
        let info = SessionInfo {
            server_agent: session.discovery.server_agent(),
            supports_multi_db: session.discovery.supports_multi_db(),
        };
        info!(
            host = %descriptor.host,
            edition = session.discovery.neo4j_edition.as_deref().unwrap_or("unknown"),
            "http session opened"
        );
        *self.lock_session() = Some(session);
        self.lost.store(false, Ordering::SeqCst);
        Ok(info)
    }

    async fn verify_credentials(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), ConnectError> {
        self.open(descriptor).await.map(|_| ())
    }

    async fn change_password(
        &self,
        descriptor: &ConnectionDescriptor,
        new_password: &str,
    ) -> Result<(), ConnectError> {
        let discovery = self.discover(&descriptor.host).await?;
        let session = HttpSession {
            discovery,
            credentials: Credentials::from_descriptor(descriptor),
        };

        let mut params = Map::new();
        if session.discovery.supports_multi_db() {
            params.insert(
                "old".to_string(),
                Value::String(session.credentials.password.clone().unwrap_or_default()),
            );
            params.insert("new".to_string(), Value::String(new_password.to_string()));
            self.commit(&session, Some(SYSTEM_DB), ALTER_PASSWORD_QUERY, params)
                .await?;
        } else {
            params.insert(
                "password".to_string(),
                Value::String(new_password.to_string()),
            );
            self.commit(&session, None, LEGACY_CHANGE_PASSWORD_QUERY, params)
                .await?;
        }
        Ok(())
    }

    async fn run_query(
        &self,
        query: &str,
        params: Map<String, Value>,
        options: &QueryOptions,
    ) -> Result<RecordSet, QueryError> {
        let Some(session) = self.lock_session().clone() else {
            return Err(QueryError::no_connection());
        };
        if options.tx_metadata.is_some() {
            debug!("transaction metadata is not sent over http");
        }

        let outcome = self
            .commit(&session, options.use_db.as_deref(), query, params)
            .await
            .map_err(QueryError::from);
        self.note_outcome(&outcome);
        outcome
    }

    async fn disconnect(&self) {
        if self.lock_session().take().is_some() {
            info!("http session closed");
        }
    }

    fn subscribe_events(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        Some(self.events.subscribe())
    }
}
