use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::{Action, CommandSource, Notice};
use crate::config::{ConnectionConfig, EditorConfig};
use crate::connections::{
    unix_timestamp_millis, ConnectionDescriptor, ConnectionsError, FileConnectionsStore,
};
use crate::scheme::{generate_bolt_url, get_scheme, toggle_scheme_routing};
use crate::state::ConnectionStatus;
use crate::store::Store;
use crate::transport::{ConnectError, ErrorKind, SessionInfo, Transport};

pub type SharedConnections = Arc<Mutex<FileConnectionsStore>>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no connection descriptor is active")]
    NoConnection,
    #[error("current password is required to change it")]
    MissingPassword,
    #[error("credentials expired: {0}")]
    CredentialsExpired(#[source] ConnectError),
    #[error("connect failed: {0}")]
    Connect(#[source] ConnectError),
    #[error("password change failed: {0}")]
    PasswordChange(#[source] ConnectError),
    #[error("failed to persist credentials: {0}")]
    Persist(#[from] ConnectionsError),
    #[error("connect attempt was cancelled")]
    Cancelled,
}

/// Drives connect, scheme fallback, credential expiry and password change.
///
/// This is the only writer of the active descriptor.
#[derive(Debug)]
pub struct ConnectionMachine<T: Transport> {
    store: Store,
    transport: Arc<T>,
    config: ConnectionConfig,
    editor: EditorConfig,
    connections: Option<SharedConnections>,
    retry: Mutex<CancellationToken>,
    /// Cancelled on disconnect; work tied to the live connection hangs off it.
    session: Mutex<CancellationToken>,
}

impl<T: Transport> ConnectionMachine<T> {
    #[must_use]
    pub fn new(
        store: Store,
        transport: Arc<T>,
        config: ConnectionConfig,
        editor: EditorConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            editor,
            connections: None,
            retry: Mutex::new(CancellationToken::new()),
            session: Mutex::new(CancellationToken::new()),
        }
    }

    #[must_use]
    pub fn with_connections(mut self, connections: SharedConnections) -> Self {
        self.connections = Some(connections);
        self
    }

    pub async fn connect(&self, descriptor: ConnectionDescriptor) -> Result<(), ConnectionError> {
        let cancel = self.fresh_retry_token();
        let mut descriptor = descriptor;
        descriptor.host = generate_bolt_url(&self.config.allowed_schemes, &descriptor.host, None);
        self.store.dispatch(Action::ClearNotice);
        self.store
            .dispatch(Action::SetPendingConnection(descriptor.clone()));
        self.store
            .dispatch(Action::ConnectionStateChanged(ConnectionStatus::Connecting));

        let mut toggles = 0;
        loop {
            debug!(id = %descriptor.id, host = %descriptor.host, "connecting");
            let error = match self.transport.connect(&descriptor).await {
                Ok(_) if cancel.is_cancelled() => {
                    self.drop_cancelled_session(&descriptor).await;
                    return Err(ConnectionError::Cancelled);
                }
                Ok(session) => {
                    self.on_connected(descriptor, session);
                    return Ok(());
                }
                Err(error) => error,
            };

            if cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }

            match error.kind {
                ErrorKind::UnsupportedRoutingScheme if toggles < self.config.max_scheme_toggles => {
                    let retry_host = toggle_scheme_routing(&descriptor.host);
                    if retry_host == descriptor.host {
                        return Err(self.fail(error));
                    }
                    toggles += 1;
                    self.announce_scheme_retry(&descriptor.host, &retry_host);
                    descriptor.host = retry_host;
                    self.store
                        .dispatch(Action::SetPendingConnection(descriptor.clone()));
                    self.store
                        .dispatch(Action::ConnectionStateChanged(ConnectionStatus::Retrying));

                    tokio::select! {
                        () = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                        () = tokio::time::sleep(self.config.scheme_retry_delay()) => {}
                    }
                    self.store
                        .dispatch(Action::ConnectionStateChanged(ConnectionStatus::Connecting));
                }
                ErrorKind::CredentialsExpired => {
                    info!(id = %descriptor.id, "credentials expired, password change required");
                    self.store.dispatch(Action::PasswordChangeNeeded(true));
                    self.store.dispatch(Action::ConnectionStateChanged(
                        ConnectionStatus::CredentialsExpired,
                    ));
                    return Err(ConnectionError::CredentialsExpired(error));
                }
                _ => return Err(self.fail(error)),
            }
        }
    }

    /// Changes the password of the pending (or active) descriptor and
    /// reconnects with it, retrying while the server still rejects the new
    /// credentials.
    pub async fn change_password(&self, new_password: &str) -> Result<(), ConnectionError> {
        let descriptor = self
            .store
            .select(|state| state.session.current_descriptor().cloned())
            .ok_or(ConnectionError::NoConnection)?;
        if descriptor.password.is_none() {
            return Err(ConnectionError::MissingPassword);
        }

        if let Err(error) = self
            .transport
            .change_password(&descriptor, new_password)
            .await
        {
            warn!(id = %descriptor.id, code = %error.code, "password change rejected");
            self.store
                .dispatch(Action::Notify(Notice::error(Some(error.code.clone()), &error.message)));
            return Err(ConnectionError::PasswordChange(error));
        }

        let descriptor = descriptor.with_password(new_password);
        self.store
            .dispatch(Action::SetPendingConnection(descriptor.clone()));
        self.store
            .dispatch(Action::ConnectionStateChanged(ConnectionStatus::Connecting));

        let attempts = self.config.password_change_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.connect(&descriptor).await {
                Ok(session) => {
                    self.on_connected(descriptor, session);
                    return Ok(());
                }
                Err(error) if error.kind == ErrorKind::Unauthorized && attempt < attempts => {
                    debug!(attempt, "new password not accepted yet, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.password_change_retry_interval()).await;
                }
                Err(error) => return Err(self.fail(error)),
            }
        }
    }

    /// Checks a password against the current descriptor without touching
    /// connection state.
    pub async fn verify_credentials(&self, password: &str) -> Result<(), ConnectionError> {
        let descriptor = self
            .store
            .select(|state| state.session.current_descriptor().cloned())
            .ok_or(ConnectionError::NoConnection)?
            .with_password(password);
        self.transport
            .verify_credentials(&descriptor)
            .await
            .map_err(ConnectionError::Connect)
    }

    pub async fn disconnect(&self) {
        self.lock_session().cancel();
        self.cancel_pending_retry();
        self.transport.disconnect().await;
        self.store.dispatch(Action::DisconnectionSuccess);
        info!("disconnected");
    }

    pub fn cancel_pending_retry(&self) {
        self.lock_retry().cancel();
    }

    /// Token for the current connection. It is cancelled by [`Self::disconnect`]
    /// and replaced on every successful connect.
    #[must_use]
    pub fn session_token(&self) -> CancellationToken {
        self.lock_session().clone()
    }

    /// Writes the active descriptor to the connections file, dropping the
    /// password unless the server allows retaining it.
    pub fn persist_active_credentials(&self) -> Result<(), ConnectionError> {
        let Some(connections) = &self.connections else {
            return Ok(());
        };
        let (descriptor, retain) = self.store.select(|state| {
            (
                state.session.active_descriptor().cloned(),
                state.session.retain_credentials,
            )
        });
        let Some(descriptor) = descriptor else {
            return Ok(());
        };

        connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .save_credentials(&descriptor, retain, unix_timestamp_millis())?;
        Ok(())
    }

    pub fn purge_expired_credentials(
        &self,
        timeout: Duration,
    ) -> Result<Vec<String>, ConnectionError> {
        let Some(connections) = &self.connections else {
            return Ok(Vec::new());
        };
        let mut connections = connections.lock().unwrap_or_else(PoisonError::into_inner);
        let purged = connections.purge_expired_credentials(unix_timestamp_millis(), timeout);
        if !purged.is_empty() {
            info!(count = purged.len(), "purged expired credentials");
            connections.persist()?;
        }
        Ok(purged)
    }

    /// A connect that completes after a disconnect must not leave a live
    /// transport session behind. A newer connect owns the transport, so it is
    /// left alone.
    async fn drop_cancelled_session(&self, descriptor: &ConnectionDescriptor) {
        debug!(id = %descriptor.id, "connect finished after it was cancelled");
        let disconnected = self
            .store
            .select(|state| state.session.status == ConnectionStatus::Disconnected);
        if disconnected {
            self.transport.disconnect().await;
        }
    }

    fn on_connected(&self, descriptor: ConnectionDescriptor, session: SessionInfo) {
        {
            let mut current = self.lock_session();
            current.cancel();
            *current = CancellationToken::new();
        }
        info!(
            id = %descriptor.id,
            host = %descriptor.host,
            multi_db = session.supports_multi_db,
            "connected"
        );
        self.store
            .dispatch(Action::ConnectionSuccess { descriptor, session });
        self.store.dispatch(Action::FocusEditor);

        if let Err(error) = self.persist_active_credentials() {
            warn!(%error, "could not save connection");
        }

        if self.editor.play_implicit_init_commands {
            if let Some(command) = self
                .editor
                .init_command
                .as_deref()
                .filter(|command| !command.is_empty())
            {
                self.store.dispatch(Action::ExecuteCommand {
                    command: command.to_string(),
                    source: CommandSource::System,
                });
            }
        }
    }

    fn fail(&self, error: ConnectError) -> ConnectionError {
        warn!(code = %error.code, "connect failed");
        self.store
            .dispatch(Action::ConnectionStateChanged(ConnectionStatus::Failed));
        self.store
            .dispatch(Action::Notify(Notice::error(Some(error.code.clone()), &error.message)));
        ConnectionError::Connect(error)
    }

    fn announce_scheme_retry(&self, rejected_host: &str, retry_host: &str) {
        let rejected = get_scheme(rejected_host).unwrap_or_default();
        let retry = get_scheme(retry_host).unwrap_or_default();
        let delay = self.config.scheme_retry_delay().as_secs();
        warn!(rejected, retry, "routing not supported, toggling scheme");
        self.store.dispatch(Action::Notify(Notice::warning(format!(
            "Could not connect with the \"{rejected}://\" scheme. \
             Will try again with \"{retry}://\" in {delay} seconds."
        ))));
    }

    fn fresh_retry_token(&self) -> CancellationToken {
        let mut retry = self.lock_retry();
        retry.cancel();
        *retry = CancellationToken::new();
        retry.clone()
    }

    fn lock_retry(&self) -> MutexGuard<'_, CancellationToken> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_session(&self) -> MutexGuard<'_, CancellationToken> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::Instant;

    use super::{ConnectionError, ConnectionMachine};
    use crate::actions::{CommandSource, NoticeLevel};
    use crate::config::{ConnectionConfig, EditorConfig};
    use crate::connections::{ConnectionDescriptor, FileConnectionsStore};
    use crate::state::ConnectionStatus;
    use crate::store::Store;
    use crate::test_support::{descriptor, settle, FakeTransport};
    use crate::transport::{ConnectError, ErrorKind};

    fn machine(transport: &Arc<FakeTransport>) -> (Store, ConnectionMachine<FakeTransport>) {
        let store = Store::default();
        let machine = ConnectionMachine::new(
            store.clone(),
            Arc::clone(transport),
            ConnectionConfig::default(),
            EditorConfig::default(),
        );
        (store, machine)
    }

    fn routing_error() -> ConnectError {
        ConnectError::from_code("ServiceUnavailable", "Could not perform discovery")
    }

    fn unauthorized() -> ConnectError {
        ConnectError::from_code("Neo.ClientError.Security.Unauthorized", "auth failed")
    }

    fn expired() -> ConnectError {
        ConnectError::from_code("Neo.ClientError.Security.CredentialsExpired", "expired")
    }

    #[tokio::test]
    async fn successful_connect_activates_and_issues_init_command() {
        let transport = Arc::new(FakeTransport::default());
        let (store, machine) = machine(&transport);

        machine.connect(descriptor()).await.expect("connect should succeed");

        let state = store.state();
        assert_eq!(state.session.status, ConnectionStatus::Connected);
        assert!(state.session.supports_multi_db);
        assert_eq!(state.editor.focus_requests, 1);
        assert_eq!(state.session.issued_commands.len(), 1);
        assert_eq!(state.session.issued_commands[0].command, ":play start");
        assert_eq!(state.session.issued_commands[0].source, CommandSource::System);
    }

    #[tokio::test]
    async fn init_command_is_skipped_when_disabled() {
        let transport = Arc::new(FakeTransport::default());
        let store = Store::default();
        let machine = ConnectionMachine::new(
            store.clone(),
            Arc::clone(&transport),
            ConnectionConfig::default(),
            EditorConfig {
                play_implicit_init_commands: false,
                ..EditorConfig::default()
            },
        );

        machine.connect(descriptor()).await.expect("connect should succeed");
        assert!(store.state().session.issued_commands.is_empty());
    }

    #[tokio::test]
    async fn connect_saves_descriptor_without_password_by_default() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("connections.toml");
        let connections = Arc::new(Mutex::new(
            FileConnectionsStore::load_from_path(&path).expect("empty store"),
        ));
        let transport = Arc::new(FakeTransport::default());
        let (_store, machine) = machine(&transport);
        let machine = machine.with_connections(Arc::clone(&connections));

        machine.connect(descriptor()).await.expect("connect should succeed");

        let reloaded = FileConnectionsStore::load_from_path(&path).expect("reload");
        let saved = reloaded.connection("local").expect("saved connection");
        assert_eq!(saved.host, "neo4j://localhost:7687");
        assert!(saved.password.is_none());
    }

    #[tokio::test]
    async fn retained_credentials_are_saved_with_password() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("connections.toml");
        let connections = Arc::new(Mutex::new(
            FileConnectionsStore::load_from_path(&path).expect("empty store"),
        ));
        let transport = Arc::new(FakeTransport::default());
        let (store, machine) = machine(&transport);
        let machine = machine.with_connections(Arc::clone(&connections));

        machine.connect(descriptor()).await.expect("connect should succeed");
        store.dispatch(crate::actions::Action::SetRetainCredentials(true));
        machine
            .persist_active_credentials()
            .expect("persist should succeed");

        let reloaded = FileConnectionsStore::load_from_path(&path).expect("reload");
        let saved = reloaded.connection("local").expect("saved connection");
        assert_eq!(saved.password.as_deref(), Some("secret"));
        assert!(saved.credentials_saved_at_unix_ms.is_some());
    }

    #[tokio::test]
    async fn expired_credentials_keep_descriptor_and_allow_password_change() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(expired()));
        let (store, machine) = machine(&transport);

        let err = machine
            .connect(descriptor())
            .await
            .expect_err("connect should report expiry");
        assert!(matches!(err, ConnectionError::CredentialsExpired(_)));

        let state = store.state();
        assert_eq!(state.session.status, ConnectionStatus::CredentialsExpired);
        assert!(state.session.password_change_needed);
        assert_eq!(
            state.session.pending.as_ref().map(|d| d.id.as_str()),
            Some("local")
        );

        machine
            .change_password("fresh")
            .await
            .expect("password change should reconnect");

        let state = store.state();
        assert_eq!(state.session.status, ConnectionStatus::Connected);
        assert!(!state.session.password_change_needed);
        assert_eq!(
            state
                .session
                .active_descriptor()
                .and_then(|d| d.password.as_deref()),
            Some("fresh")
        );
        let calls = transport
            .change_password_calls
            .lock()
            .expect("calls lock")
            .clone();
        assert_eq!(calls, vec![(Some("secret".to_string()), "fresh".to_string())]);
    }

    #[tokio::test]
    async fn change_password_requires_current_password() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(expired()));
        let (_store, machine) = machine(&transport);

        let without_password =
            ConnectionDescriptor::new("local", "neo4j://localhost:7687", "neo4j");
        let _ = machine.connect(without_password).await;

        let err = machine
            .change_password("fresh")
            .await
            .expect_err("change should need the current password");
        assert!(matches!(err, ConnectionError::MissingPassword));
        assert!(transport
            .change_password_calls
            .lock()
            .expect("calls lock")
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn password_change_retries_while_unauthorized() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(expired()));
        let (store, machine) = machine(&transport);
        let _ = machine.connect(descriptor()).await;

        transport.queue_connect(Err(unauthorized()));
        transport.queue_connect(Err(unauthorized()));
        let started = Instant::now();
        machine
            .change_password("fresh")
            .await
            .expect("third attempt should succeed");

        assert_eq!(transport.connect_hosts().len(), 4);
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(store.state().session.status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn password_change_gives_up_after_bounded_attempts() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(expired()));
        let (store, machine) = machine(&transport);
        let _ = machine.connect(descriptor()).await;

        for _ in 0..5 {
            transport.queue_connect(Err(unauthorized()));
        }
        let err = machine
            .change_password("fresh")
            .await
            .expect_err("attempts should run out");

        assert!(matches!(
            err,
            ConnectionError::Connect(ConnectError { kind: ErrorKind::Unauthorized, .. })
        ));
        assert_eq!(transport.connect_hosts().len(), 6);
        assert_eq!(store.state().session.status, ConnectionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn password_change_stops_on_other_errors() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(expired()));
        let (_store, machine) = machine(&transport);
        let _ = machine.connect(descriptor()).await;

        transport.queue_connect(Err(unauthorized()));
        transport.queue_connect(Err(ConnectError::from_code("ServiceUnavailable", "refused")));
        let err = machine
            .change_password("fresh")
            .await
            .expect_err("service error should halt retries");

        assert!(matches!(
            err,
            ConnectionError::Connect(ConnectError { kind: ErrorKind::ServiceUnavailable, .. })
        ));
        assert_eq!(transport.connect_hosts().len(), 3);
    }

    #[tokio::test]
    async fn rejected_password_change_is_surfaced() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(expired()));
        *transport
            .change_password_error
            .lock()
            .expect("error lock") = Some(ConnectError::from_code(
            "Neo.ClientError.General.InvalidArguments",
            "Old password and new password cannot be the same.",
        ));
        let (store, machine) = machine(&transport);
        let _ = machine.connect(descriptor()).await;

        let err = machine
            .change_password("secret")
            .await
            .expect_err("change should be rejected");
        assert!(matches!(err, ConnectionError::PasswordChange(_)));
        let state = store.state();
        assert_eq!(state.session.status, ConnectionStatus::CredentialsExpired);
        assert_eq!(
            state.session.notice.map(|notice| notice.level),
            Some(NoticeLevel::Error)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_routing_toggles_scheme_once_after_delay() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(routing_error()));
        let (store, machine) = machine(&transport);

        let started = Instant::now();
        machine.connect(descriptor()).await.expect("retry should succeed");

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(
            transport.connect_hosts(),
            vec!["neo4j://localhost:7687", "bolt://localhost:7687"]
        );
        let state = store.state();
        assert_eq!(state.session.status, ConnectionStatus::Connected);
        assert_eq!(
            state.session.active_descriptor().map(|d| d.host.as_str()),
            Some("bolt://localhost:7687")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_routing_failure_does_not_loop() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(routing_error()));
        transport.queue_connect(Err(routing_error()));
        transport.queue_connect(Err(routing_error()));
        let (store, machine) = machine(&transport);

        let err = machine
            .connect(descriptor())
            .await
            .expect_err("second routing failure should be final");

        assert!(matches!(err, ConnectionError::Connect(_)));
        assert_eq!(transport.connect_hosts().len(), 2);
        let state = store.state();
        assert_eq!(state.session.status, ConnectionStatus::Failed);
        assert_eq!(
            state.session.notice.and_then(|notice| notice.code).as_deref(),
            Some("ServiceUnavailable")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheme_retry_warning_names_both_schemes() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(routing_error()));
        let (store, machine) = machine(&transport);
        let machine = Arc::new(machine);

        let task = tokio::spawn({
            let machine = Arc::clone(&machine);
            async move { machine.connect(descriptor()).await }
        });
        settle().await;

        let state = store.state();
        assert_eq!(state.session.status, ConnectionStatus::Retrying);
        let notice = state.session.notice.expect("warning notice");
        assert_eq!(notice.level, NoticeLevel::Warning);
        assert!(notice.message.contains("\"neo4j://\""));
        assert!(notice.message.contains("\"bolt://\""));

        task.await.expect("task").expect("retry should succeed");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_scheme_retry() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(routing_error()));
        let (store, machine) = machine(&transport);
        let machine = Arc::new(machine);

        let task = tokio::spawn({
            let machine = Arc::clone(&machine);
            async move { machine.connect(descriptor()).await }
        });
        settle().await;
        machine.disconnect().await;

        let result = task.await.expect("task");
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_hosts().len(), 1);
        assert_eq!(transport.disconnect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.state().session.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_finishing_after_disconnect_is_dropped() {
        let transport = Arc::new(FakeTransport::default());
        transport.delay_connect(Duration::from_secs(2));
        let (store, machine) = machine(&transport);
        let machine = Arc::new(machine);

        let task = tokio::spawn({
            let machine = Arc::clone(&machine);
            async move { machine.connect(descriptor()).await }
        });
        settle().await;
        machine.disconnect().await;

        let result = task.await.expect("task");
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
        let state = store.state();
        assert_eq!(state.session.status, ConnectionStatus::Disconnected);
        assert!(state.session.active_descriptor().is_none());
        assert_eq!(state.editor.focus_requests, 0);
        assert_eq!(transport.disconnect_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disconnect_cancels_the_session_token() {
        let transport = Arc::new(FakeTransport::default());
        let (_store, machine) = machine(&transport);

        machine.connect(descriptor()).await.expect("connect should succeed");
        let first = machine.session_token();
        assert!(!first.is_cancelled());

        machine.disconnect().await;
        assert!(first.is_cancelled());

        machine.connect(descriptor()).await.expect("reconnect should succeed");
        assert!(!machine.session_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn schemeless_host_gets_default_scheme_and_can_toggle() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(routing_error()));
        let (store, machine) = machine(&transport);
        let mut descriptor = descriptor();
        descriptor.host = "localhost:7687".to_string();

        machine.connect(descriptor).await.expect("retry should succeed");

        assert_eq!(
            transport.connect_hosts(),
            vec!["neo4j://localhost:7687", "bolt://localhost:7687"]
        );
        assert_eq!(store.state().session.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn disallowed_scheme_is_replaced_before_connecting() {
        let transport = Arc::new(FakeTransport::default());
        let store = Store::default();
        let machine = ConnectionMachine::new(
            store.clone(),
            Arc::clone(&transport),
            ConnectionConfig {
                allowed_schemes: vec!["bolt+s".to_string(), "neo4j+s".to_string()],
                ..ConnectionConfig::default()
            },
            EditorConfig::default(),
        );
        let mut descriptor = descriptor();
        descriptor.host = "neo4j://db.example.com:7687".to_string();

        machine.connect(descriptor).await.expect("connect should succeed");

        assert_eq!(transport.connect_hosts(), vec!["bolt+s://db.example.com:7687"]);
        assert_eq!(
            store
                .state()
                .session
                .active_descriptor()
                .map(|d| d.host.clone())
                .as_deref(),
            Some("bolt+s://db.example.com:7687")
        );
    }

    #[tokio::test]
    async fn other_failures_surface_raw_error() {
        let transport = Arc::new(FakeTransport::default());
        transport.queue_connect(Err(unauthorized()));
        let (store, machine) = machine(&transport);

        let err = machine
            .connect(descriptor())
            .await
            .expect_err("connect should fail");
        assert!(matches!(err, ConnectionError::Connect(_)));

        let state = store.state();
        assert_eq!(state.session.status, ConnectionStatus::Failed);
        assert!(state.session.active_descriptor().is_none());
        assert_eq!(
            state.session.pending.as_ref().map(|d| d.host.as_str()),
            Some("neo4j://localhost:7687")
        );
        let notice = state.session.notice.expect("error notice");
        assert_eq!(notice.message, "auth failed");
    }

    #[tokio::test]
    async fn verify_credentials_leaves_state_alone() {
        let transport = Arc::new(FakeTransport::default());
        let (store, machine) = machine(&transport);
        machine.connect(descriptor()).await.expect("connect should succeed");
        let before = store.state();

        machine
            .verify_credentials("secret")
            .await
            .expect("verify should succeed");

        assert_eq!(transport.verify_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.state(), before);
    }
}
