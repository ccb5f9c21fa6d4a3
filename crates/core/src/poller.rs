use std::sync::Arc;

use futures_util::future::join3;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::actions::{Action, CommandSource, ConnectionLoss};
use crate::config::MetadataConfig;
use crate::databases::{
    databases_from_records, resolve_database_selection, SHOW_DATABASES_QUERY,
};
use crate::metadata::{META_QUERY, SYSTEM_DB};
use crate::state::AppState;
use crate::store::Store;
use crate::transport::{ErrorKind, QueryOptions, Routing, Transport};

/// Options for queries the browser runs on its own behalf.
#[must_use]
pub fn background_options(state: &AppState, config: &MetadataConfig) -> QueryOptions {
    let tx_metadata = state
        .session
        .features
        .can_send_tx_metadata
        .then(|| json!({ "type": "system", "app": config.tx_metadata_app }));
    QueryOptions {
        use_db: None,
        routing: Routing::Direct,
        use_cypher_thread: config.use_cypher_thread,
        tx_metadata,
    }
    .with_use_db(state.session.use_db())
}

/// Periodic metadata refresh for one connected session.
///
/// A cycle runs on start, on every interval tick and on `ForceFetch`. At most
/// one cycle is in flight; ticks and force-fetch signals that arrive while a
/// cycle runs are dropped.
#[derive(Debug)]
pub struct MetadataPoller<T: Transport> {
    store: Store,
    transport: Arc<T>,
    config: MetadataConfig,
}

impl<T: Transport> MetadataPoller<T> {
    #[must_use]
    pub fn new(store: Store, transport: Arc<T>, config: MetadataConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.config.poll_interval();
        let mut bus = self.store.subscribe();
        let mut next_tick = Instant::now();
        info!(interval_ms = self.config.poll_interval_ms, "metadata poller started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep_until(next_tick) => {}
                signal = bus.recv() => match signal {
                    Ok(Action::ForceFetch) => {}
                    Ok(action) if ends_connection(&action) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            }

            let started = Instant::now();
            let ended = tokio::select! {
                () = cancel.cancelled() => true,
                () = connection_ended(&mut bus) => true,
                () = self.run_cycle() => false,
            };
            if ended {
                debug!("metadata cycle abandoned");
                break;
            }

            loop {
                match bus.try_recv() {
                    Ok(action) if ends_connection(&action) => {
                        info!("metadata poller stopped");
                        return;
                    }
                    Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
            next_tick = started + interval;
            let now = Instant::now();
            while next_tick <= now {
                next_tick += interval;
            }
        }
        info!("metadata poller stopped");
    }

    /// One full cycle: server info request, the three parallel fetches, then
    /// database selection. `DbMetaDone` is dispatched only after all of them
    /// settled.
    pub async fn run_cycle(&self) {
        debug!("metadata cycle started");
        self.publish(Action::FetchServerInfo);

        join3(
            self.fetch_schema(),
            self.fetch_cluster_role(),
            self.fetch_databases(),
        )
        .await;

        self.switch_to_requested_db().await;
        if self.publish(Action::DbMetaDone) {
            debug!("metadata cycle done");
        }
    }

    /// Results only land while the session is still connected.
    fn publish(&self, action: Action) -> bool {
        self.store
            .dispatch_if(|state| state.session.is_connected(), action)
    }

    async fn fetch_schema(&self) {
        let (use_db, options) = self.store.select(|state| {
            (
                state.session.use_db().map(str::to_string),
                background_options(state, &self.config).routed_read(),
            )
        });

        if use_db.as_deref() == Some(SYSTEM_DB) {
            self.publish(Action::UpdateMeta {
                result: None,
                context: use_db,
            });
            return;
        }

        match self.transport.run_query(META_QUERY, Map::new(), &options).await {
            Ok(result) => {
                self.publish(Action::UpdateMeta {
                    result: Some(result),
                    context: use_db,
                });
            }
            Err(error) => {
                debug!(code = %error.code, "schema fetch failed");
                self.publish(Action::UpdateMeta {
                    result: None,
                    context: use_db,
                });
                if error.kind == ErrorKind::ServiceUnavailable {
                    self.publish(Action::LostConnection(ConnectionLoss::new(
                        error.code,
                        error.message,
                    )));
                }
            }
        }
    }

    async fn fetch_cluster_role(&self) {
        let (query, options) = self.store.select(|state| {
            let features = &state.session.features;
            let query = features
                .causal_cluster
                .then(|| features.cluster_role_query.clone())
                .flatten();
            (query, background_options(state, &self.config))
        });
        let Some(query) = query else {
            return;
        };
        let mut params = Map::new();
        if let Some(use_db) = &options.use_db {
            params.insert("database".to_string(), Value::String(use_db.clone()));
        }

        match self.transport.run_query(&query, params, &options).await {
            Ok(result) => {
                let role = result
                    .records
                    .first()
                    .and_then(|record| record.value(0))
                    .and_then(Value::as_str);
                if let Some(role) = role {
                    self.publish(Action::UpdateClusterRole(role.to_string()));
                }
            }
            Err(error) => debug!(code = %error.code, "cluster role fetch failed"),
        }
    }

    async fn fetch_databases(&self) {
        let (multi_db, options) = self.store.select(|state| {
            (
                state.session.supports_multi_db,
                background_options(state, &self.config).with_use_db(Some(SYSTEM_DB)),
            )
        });
        if !multi_db {
            return;
        }

        match self
            .transport
            .run_query(SHOW_DATABASES_QUERY, Map::new(), &options)
            .await
        {
            Ok(result) => {
                self.publish(Action::UpdateDatabases(databases_from_records(&result)));
            }
            Err(error) => debug!(code = %error.code, "database list fetch failed"),
        }
    }

    async fn switch_to_requested_db(&self) {
        let (selection, connection_id) = self.store.select(|state| {
            let active = state.session.active_descriptor();
            let selection = resolve_database_selection(
                state.session.use_db(),
                active.and_then(|descriptor| descriptor.requested_database()),
                &state.meta.databases,
            );
            (selection, active.map(|descriptor| descriptor.id.clone()))
        });
        if selection.is_noop() {
            return;
        }

        if selection.clear_request {
            if let Some(id) = connection_id {
                self.publish(Action::ClearRequestedDatabase { id });
            }
        }
        if let Some(command) = selection.unknown_database_command {
            info!(%command, "requested database not found");
            self.publish(Action::ExecuteCommand {
                command,
                source: CommandSource::Auto,
            });
        }
        if let Some(use_db) = selection.use_db {
            debug!(%use_db, "selecting database");
            self.publish(Action::UseDb(Some(use_db)));
        }
        if selection.refetch_schema {
            self.fetch_schema().await;
        }
    }
}

/// Disconnects and real connection losses end the poller, even mid-cycle.
fn ends_connection(action: &Action) -> bool {
    match action {
        Action::DisconnectionSuccess => true,
        Action::LostConnection(loss) => loss.is_connection_loss(),
        _ => false,
    }
}

async fn connection_ended(bus: &mut broadcast::Receiver<Action>) {
    loop {
        match bus.recv().await {
            Ok(action) if ends_connection(&action) => return,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}
