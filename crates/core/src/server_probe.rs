use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::actions::Action;
use crate::config::MetadataConfig;
use crate::databases::SHOW_DATABASES_QUERY;
use crate::metadata::SYSTEM_DB;
use crate::poller::background_options;
use crate::server_info::{ServerInfoPatch, SERVER_INFO_QUERY};
use crate::settings::{ServerSettings, CLIENT_CONFIG_QUERY, LIST_CONFIG_QUERY};
use crate::state::Features;
use crate::store::Store;
use crate::transport::{ErrorKind, QueryError, QueryOptions, RecordSet, Transport};

pub const PROCEDURES_QUERY: &str = "CALL dbms.procedures() YIELD name RETURN name";

const CLUSTER_OVERVIEW_PROCEDURE: &str = "dbms.cluster.overview";
const CLUSTER_ROLE_PROCEDURE: &str = "dbms.cluster.role";
const TX_METADATA_PROCEDURES: [&str; 2] = ["tx.setMetaData", "dbms.setTXMetaData"];

/// One-shot fetches of server capabilities, configuration and version.
#[derive(Debug)]
pub struct ServerProbe<T: Transport> {
    store: Store,
    transport: Arc<T>,
    config: MetadataConfig,
}

impl<T: Transport> ServerProbe<T> {
    #[must_use]
    pub fn new(store: Store, transport: Arc<T>, config: MetadataConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Inspects the procedure list and always finishes with
    /// `FeatureDetectionDone`, falling back to no optional features.
    pub async fn detect_features(&self) {
        let (multi_db, options) = self.store.select(|state| {
            (
                state.session.supports_multi_db,
                background_options(state, &self.config),
            )
        });

        let features = match self
            .transport
            .run_query(PROCEDURES_QUERY, Map::new(), &options)
            .await
        {
            Ok(result) => features_from_procedures(&result, multi_db),
            Err(error) => {
                debug!(code = %error.code, "feature detection failed");
                Features::default()
            }
        };
        debug!(?features, "feature detection done");
        self.store.dispatch(Action::FeatureDetectionDone(features));
    }

    /// Reads server settings through `dbms.clientConfig()`, switching to
    /// `dbms.listConfig()` for hosts that lack it. Which procedure works is
    /// remembered per host.
    pub async fn fetch_server_config(&self) {
        let (host, client_config, options) = self.store.select(|state| {
            let use_db = state.session.supports_multi_db.then_some(SYSTEM_DB);
            (
                state.session.active_descriptor().map(|d| d.host.clone()),
                state.session.client_config_available(),
                background_options(state, &self.config).with_use_db(use_db),
            )
        });

        match self.read_config(host, client_config, &options).await {
            Ok(result) => {
                let (settings, effects) = ServerSettings::from_records(&result);
                if let Some(retain) = effects.retain_credentials {
                    self.store.dispatch(Action::SetRetainCredentials(retain));
                }
                if let Some(enabled) = effects.auth_enabled {
                    self.store.dispatch(Action::SetAuthEnabled(enabled));
                }
                self.store.dispatch(Action::SetServerConfigReadable(true));
                self.store.dispatch(Action::UpdateSettings(settings));
            }
            Err(error) => {
                debug!(code = %error.code, "server config is not readable");
                self.store.dispatch(Action::SetServerConfigReadable(false));
            }
        }
        self.store.dispatch(Action::ServerConfigDone);
    }

    async fn read_config(
        &self,
        host: Option<String>,
        client_config: Option<bool>,
        options: &QueryOptions,
    ) -> Result<RecordSet, QueryError> {
        if client_config == Some(false) {
            return self
                .transport
                .run_query(LIST_CONFIG_QUERY, Map::new(), options)
                .await;
        }

        match self
            .transport
            .run_query(CLIENT_CONFIG_QUERY, Map::new(), options)
            .await
        {
            Ok(result) => {
                if let (Some(host), None) = (host, client_config) {
                    self.store.dispatch(Action::SetClientConfig {
                        host,
                        available: true,
                    });
                }
                Ok(result)
            }
            Err(error) if error.kind == ErrorKind::ProcedureNotFound => {
                info!("dbms.clientConfig() unavailable, using dbms.listConfig()");
                if let Some(host) = host {
                    self.store.dispatch(Action::SetClientConfig {
                        host,
                        available: false,
                    });
                }
                self.transport
                    .run_query(LIST_CONFIG_QUERY, Map::new(), options)
                    .await
            }
            Err(error) => Err(error),
        }
    }

    /// Refreshes version and edition. Failures leave the stored info alone.
    pub async fn fetch_server_info(&self) {
        let (query, options) = self.store.select(|state| {
            let query = if state.session.use_db() == Some(SYSTEM_DB) {
                SHOW_DATABASES_QUERY
            } else {
                SERVER_INFO_QUERY
            };
            (query, background_options(state, &self.config))
        });

        match self.transport.run_query(query, Map::new(), &options).await {
            Ok(result) => {
                let patch = ServerInfoPatch::from_components(&result);
                if !patch.is_empty() {
                    self.store.dispatch(Action::UpdateServerInfo(patch));
                }
            }
            Err(error) => debug!(code = %error.code, "server info fetch failed"),
        }
    }
}

fn features_from_procedures(result: &RecordSet, multi_db: bool) -> Features {
    let procedures: BTreeSet<&str> = result
        .records
        .iter()
        .filter_map(|record| record.get("name").and_then(Value::as_str))
        .collect();

    let cluster_role_query = procedures.contains(CLUSTER_ROLE_PROCEDURE).then(|| {
        if multi_db {
            "CALL dbms.cluster.role($database)".to_string()
        } else {
            "CALL dbms.cluster.role()".to_string()
        }
    });

    Features {
        causal_cluster: procedures.contains(CLUSTER_OVERVIEW_PROCEDURE),
        cluster_role_query,
        can_send_tx_metadata: multi_db
            || TX_METADATA_PROCEDURES
                .iter()
                .any(|procedure| procedures.contains(procedure)),
    }
}
