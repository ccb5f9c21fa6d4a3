use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Map;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::{Action, ConnectionLoss};
use crate::config::{BrowserConfig, MetadataConfig};
use crate::connection_machine::{ConnectionError, ConnectionMachine, SharedConnections};
use crate::connections::ConnectionDescriptor;
use crate::editor::populate_editor_from_url;
use crate::poller::{background_options, MetadataPoller};
use crate::server_probe::ServerProbe;
use crate::state::ConnectionStatus;
use crate::store::Store;
use crate::sysinfo::SysInfoMonitor;
use crate::transport::{Transport, TransportEvent};

/// Cheapest statement the server will answer; used to notice a lost
/// connection coming back.
pub const HEALTH_CHECK_QUERY: &str = "RETURN 1";

/// Reacts to actions on the bus: starts and stops the poller, runs the
/// server probes and keeps saved credentials in line with server settings.
#[derive(Debug)]
struct Supervisor<T: Transport> {
    store: Store,
    transport: Arc<T>,
    metadata: MetadataConfig,
    machine: Arc<ConnectionMachine<T>>,
    probe: Arc<ServerProbe<T>>,
    poller: Mutex<Option<CancellationToken>>,
    health: Mutex<Option<CancellationToken>>,
    health_interval: Duration,
    shutdown: CancellationToken,
}

impl<T: Transport> Supervisor<T> {
    async fn run(self: Arc<Self>, mut bus: broadcast::Receiver<Action>) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                action = bus.recv() => match action {
                    Ok(action) => self.handle(&action),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "supervisor fell behind the action bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.stop_poller();
        self.stop_health_check();
        debug!("session supervisor stopped");
    }

    fn handle(&self, action: &Action) {
        match action {
            Action::ConnectionSuccess { .. } => {
                self.stop_health_check();
                self.start_poller();
                let probe = Arc::clone(&self.probe);
                self.spawn(async move { probe.detect_features().await });
            }
            Action::ConnectionStateChanged(ConnectionStatus::Connected) => {
                self.stop_health_check();
                self.start_poller();
            }
            Action::LostConnection(loss) if loss.is_connection_loss() => {
                info!(code = %loss.code, "connection lost, stopping metadata poller");
                self.stop_poller();
                self.machine.cancel_pending_retry();
                let recoverable = self.store.select(|state| {
                    state.session.status == ConnectionStatus::Retrying
                        && state.session.pending.is_none()
                        && state.session.active_descriptor().is_some()
                });
                if recoverable {
                    self.start_health_check();
                }
            }
            Action::DisconnectionSuccess => {
                self.stop_poller();
                self.stop_health_check();
                self.machine.cancel_pending_retry();
            }
            Action::FeatureDetectionDone(_) | Action::DbMetaDone => {
                let probe = Arc::clone(&self.probe);
                self.spawn(async move { probe.fetch_server_config().await });
            }
            Action::FetchServerInfo => {
                let probe = Arc::clone(&self.probe);
                self.spawn(async move { probe.fetch_server_info().await });
            }
            Action::SetRetainCredentials(_) => {
                if let Err(error) = self.machine.persist_active_credentials() {
                    warn!(%error, "could not update saved credentials");
                }
            }
            Action::UpdateSettings(settings) => {
                if let Err(error) = self
                    .machine
                    .purge_expired_credentials(settings.credential_timeout())
                {
                    warn!(%error, "could not purge expired credentials");
                }
            }
            _ => {}
        }
    }

    fn start_poller(&self) {
        let token = self.machine.session_token().child_token();
        if let Some(previous) = self.lock_poller().replace(token.clone()) {
            previous.cancel();
        }
        let poller = MetadataPoller::new(
            self.store.clone(),
            Arc::clone(&self.transport),
            self.metadata.clone(),
        );
        tokio::spawn(poller.run(token));
    }

    fn stop_poller(&self) {
        if let Some(token) = self.lock_poller().take() {
            token.cancel();
        }
    }

    fn start_health_check(&self) {
        let token = self.machine.session_token().child_token();
        if let Some(previous) = self.lock_health().replace(token.clone()) {
            previous.cancel();
        }
        debug!(interval = ?self.health_interval, "checking lost connection");
        self.spawn(run_health_check(
            self.store.clone(),
            Arc::clone(&self.transport),
            self.metadata.clone(),
            self.health_interval,
            token,
        ));
    }

    fn stop_health_check(&self) {
        if let Some(token) = self.lock_health().take() {
            token.cancel();
        }
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = task => {}
            }
        });
    }

    fn lock_poller(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_health(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs [`HEALTH_CHECK_QUERY`] every `period` until it succeeds, then flips a
/// retrying session back to connected.
async fn run_health_check<T: Transport>(
    store: Store,
    transport: Arc<T>,
    metadata: MetadataConfig,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }
        let options = store.select(|state| background_options(state, &metadata));
        let outcome = tokio::select! {
            () = cancel.cancelled() => return,
            outcome = transport.run_query(HEALTH_CHECK_QUERY, Map::new(), &options) => outcome,
        };
        match outcome {
            Ok(_) => {
                mark_regained(&store);
                return;
            }
            Err(error) => debug!(%error, "connection still lost"),
        }
    }
}

fn mark_regained(store: &Store) {
    let regained = store.dispatch_if(
        |state| state.session.status == ConnectionStatus::Retrying,
        Action::ConnectionStateChanged(ConnectionStatus::Connected),
    );
    if regained {
        info!("connection regained");
    }
}

/// Connection and metadata lifecycle of one browser session.
///
/// Owns the [`Store`]; everything else observes it through the action bus.
/// Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct BrowserSession<T: Transport> {
    store: Store,
    config: BrowserConfig,
    machine: Arc<ConnectionMachine<T>>,
    sysinfo: Arc<SysInfoMonitor<T>>,
    shutdown: CancellationToken,
    supervisor: JoinHandle<()>,
    events: Option<JoinHandle<()>>,
}

impl<T: Transport> BrowserSession<T> {
    #[must_use]
    pub fn start(
        transport: Arc<T>,
        config: BrowserConfig,
        connections: Option<SharedConnections>,
    ) -> Self {
        let store = Store::default();
        let shutdown = CancellationToken::new();

        let mut machine = ConnectionMachine::new(
            store.clone(),
            Arc::clone(&transport),
            config.connection.clone(),
            config.editor.clone(),
        );
        if let Some(connections) = connections {
            machine = machine.with_connections(connections);
        }
        let machine = Arc::new(machine);

        let supervisor = Arc::new(Supervisor {
            store: store.clone(),
            transport: Arc::clone(&transport),
            metadata: config.metadata.clone(),
            machine: Arc::clone(&machine),
            probe: Arc::new(ServerProbe::new(
                store.clone(),
                Arc::clone(&transport),
                config.metadata.clone(),
            )),
            poller: Mutex::new(None),
            health: Mutex::new(None),
            health_interval: config.connection.health_check_interval(),
            shutdown: shutdown.clone(),
        });
        let supervisor = tokio::spawn(supervisor.run(store.subscribe()));

        let events = transport.subscribe_events().map(|events| {
            tokio::spawn(forward_transport_events(
                store.clone(),
                events,
                shutdown.clone(),
            ))
        });

        let sysinfo = SysInfoMonitor::new(store.clone(), Arc::clone(&transport), &config.sysinfo);
        info!("browser session started");

        Self {
            store,
            config,
            machine,
            sysinfo,
            shutdown,
            supervisor,
            events,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    #[must_use]
    pub fn sysinfo(&self) -> &Arc<SysInfoMonitor<T>> {
        &self.sysinfo
    }

    pub async fn connect(&self, descriptor: ConnectionDescriptor) -> Result<(), ConnectionError> {
        self.machine.connect(descriptor).await
    }

    pub async fn change_password(&self, new_password: &str) -> Result<(), ConnectionError> {
        self.machine.change_password(new_password).await
    }

    pub async fn verify_credentials(&self, password: &str) -> Result<(), ConnectionError> {
        self.machine.verify_credentials(password).await
    }

    pub async fn disconnect(&self) {
        self.machine.disconnect().await;
    }

    pub fn force_fetch(&self) {
        self.store.dispatch(Action::ForceFetch);
    }

    pub fn populate_editor_from_url(&self, url: &str) -> bool {
        populate_editor_from_url(&self.store, url, &self.config.editor.cmdchar)
    }

    /// Stops every background task owned by the session.
    pub async fn shutdown(self) {
        self.sysinfo.set_auto_refresh(false);
        self.machine.cancel_pending_retry();
        self.shutdown.cancel();
        if let Err(error) = self.supervisor.await {
            warn!(%error, "session supervisor ended abnormally");
        }
        if let Some(events) = self.events {
            let _ = events.await;
        }
        info!("browser session stopped");
    }
}

async fn forward_transport_events(
    store: Store,
    mut events: broadcast::Receiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::ConnectionLost { code, message }) => {
                store.dispatch(Action::LostConnection(ConnectionLoss::new(code, message)));
            }
            Ok(TransportEvent::ConnectionRegained) => mark_regained(&store),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped transport events"),
            Err(RecvError::Closed) => break,
        }
    }
}
