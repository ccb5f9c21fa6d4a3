use std::collections::BTreeMap;

use crate::actions::{Action, CommandSource, Notice};
use crate::connections::ConnectionDescriptor;
use crate::databases::DatabaseRecord;
use crate::metadata::MetadataSnapshot;
use crate::server_info::ServerInfo;
use crate::settings::ServerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    CredentialsExpired,
    Retrying,
    Failed,
}

/// Capabilities reported once feature detection has run against the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Features {
    pub causal_cluster: bool,
    pub cluster_role_query: Option<String>,
    pub can_send_tx_metadata: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCommand {
    pub command: String,
    pub source: CommandSource,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionState {
    pub connections: BTreeMap<String, ConnectionDescriptor>,
    pub active_connection_id: Option<String>,
    pub pending: Option<ConnectionDescriptor>,
    pub status: ConnectionStatus,
    pub use_db: Option<String>,
    pub supports_multi_db: bool,
    pub server_agent: Option<String>,
    pub retain_credentials: bool,
    pub auth_enabled: Option<bool>,
    pub features: Features,
    /// Whether `dbms.clientConfig()` exists, keyed by host.
    pub client_config: BTreeMap<String, bool>,
    pub server_config_readable: Option<bool>,
    pub password_change_needed: bool,
    pub notice: Option<Notice>,
    pub issued_commands: Vec<IssuedCommand>,
}

impl SessionState {
    #[must_use]
    pub fn active_descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.active_connection_id
            .as_ref()
            .and_then(|id| self.connections.get(id))
    }

    /// Credentials in flight, falling back to the active connection.
    #[must_use]
    pub fn current_descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.pending.as_ref().or_else(|| self.active_descriptor())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    #[must_use]
    pub fn use_db(&self) -> Option<&str> {
        self.use_db.as_deref().filter(|db| !db.is_empty())
    }

    #[must_use]
    pub fn client_config_available(&self) -> Option<bool> {
        let host = &self.active_descriptor()?.host;
        self.client_config.get(host).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetaState {
    pub snapshot: MetadataSnapshot,
    pub server: ServerInfo,
    pub databases: Vec<DatabaseRecord>,
    pub settings: ServerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EditorState {
    pub content: String,
    pub focus_requests: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppState {
    pub session: SessionState,
    pub meta: MetaState,
    pub editor: EditorState,
}

impl AppState {
    pub fn apply(&mut self, action: &Action) {
        let session = &mut self.session;
        match action {
            Action::ConnectionStateChanged(status) => session.status = *status,
            Action::SetPendingConnection(descriptor) => {
                session.pending = Some(descriptor.clone());
            }
            Action::ConnectionSuccess {
                descriptor,
                session: info,
            } => {
                session
                    .connections
                    .insert(descriptor.id.clone(), descriptor.clone());
                session.active_connection_id = Some(descriptor.id.clone());
                session.pending = None;
                session.status = ConnectionStatus::Connected;
                session.supports_multi_db = info.supports_multi_db;
                session.server_agent.clone_from(&info.server_agent);
                session.password_change_needed = false;
                session.use_db = None;
            }
            Action::LostConnection(loss) => {
                if loss.is_connection_loss() && session.is_connected() {
                    session.status = ConnectionStatus::Retrying;
                }
            }
            Action::DisconnectionSuccess => {
                session.status = ConnectionStatus::Disconnected;
                session.active_connection_id = None;
                session.pending = None;
                session.use_db = None;
                self.meta = MetaState::default();
            }
            Action::ClearRequestedDatabase { id } => {
                if let Some(descriptor) = session.connections.get_mut(id) {
                    descriptor.requested_use_db = None;
                }
            }
            Action::UseDb(use_db) => session.use_db.clone_from(use_db),
            Action::PasswordChangeNeeded(needed) => session.password_change_needed = *needed,
            Action::UpdateMeta { result, context } => {
                self.meta
                    .snapshot
                    .merge(result.as_ref(), context.as_deref());
            }
            Action::UpdateServerInfo(patch) => self.meta.server.apply(patch),
            Action::UpdateClusterRole(role) => self.meta.server.cluster_role = Some(role.clone()),
            Action::UpdateDatabases(databases) => self.meta.databases.clone_from(databases),
            Action::UpdateSettings(settings) => self.meta.settings = settings.clone(),
            Action::SetRetainCredentials(retain) => session.retain_credentials = *retain,
            Action::SetAuthEnabled(enabled) => {
                session.auth_enabled = Some(*enabled);
                self.meta.server.auth_enabled = Some(*enabled);
            }
            Action::SetClientConfig { host, available } => {
                session.client_config.insert(host.clone(), *available);
            }
            Action::SetServerConfigReadable(readable) => {
                session.server_config_readable = Some(*readable);
            }
            Action::FeatureDetectionDone(features) => session.features = features.clone(),
            Action::ExecuteCommand { command, source } => {
                session.issued_commands.push(IssuedCommand {
                    command: command.clone(),
                    source: *source,
                });
            }
            Action::SetEditorContent(content) => self.editor.content.clone_from(content),
            Action::FocusEditor => self.editor.focus_requests += 1,
            Action::Notify(notice) => session.notice = Some(notice.clone()),
            Action::ClearNotice => session.notice = None,
            Action::ForceFetch
            | Action::FetchServerInfo
            | Action::DbMetaDone
            | Action::ServerConfigDone => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AppState, ConnectionStatus};
    use crate::actions::{Action, ConnectionLoss};
    use crate::connections::ConnectionDescriptor;
    use crate::databases::DatabaseRecord;
    use crate::transport::SessionInfo;

    fn connected_state() -> AppState {
        let mut state = AppState::default();
        let mut descriptor = ConnectionDescriptor::new("local", "neo4j://localhost:7687", "neo4j");
        descriptor.requested_use_db = Some("movies".to_string());
        state.apply(&Action::SetPendingConnection(descriptor.clone()));
        state.apply(&Action::ConnectionSuccess {
            descriptor,
            session: SessionInfo {
                server_agent: Some("Neo4j/4.4.0".to_string()),
                supports_multi_db: true,
            },
        });
        state
    }

    #[test]
    fn connection_success_activates_descriptor() {
        let state = connected_state();
        assert!(state.session.is_connected());
        assert!(state.session.pending.is_none());
        assert!(state.session.supports_multi_db);
        assert_eq!(
            state.session.active_descriptor().map(|d| d.id.as_str()),
            Some("local")
        );
    }

    #[test]
    fn clearing_requested_database_touches_only_that_field() {
        let mut state = connected_state();
        state.apply(&Action::ClearRequestedDatabase {
            id: "local".to_string(),
        });
        let descriptor = state.session.active_descriptor().expect("active descriptor");
        assert!(descriptor.requested_use_db.is_none());
        assert_eq!(descriptor.host, "neo4j://localhost:7687");
    }

    #[test]
    fn transient_loss_keeps_connected_status() {
        let mut state = connected_state();
        state.apply(&Action::LostConnection(ConnectionLoss::new(
            "Neo.TransientError.General.DatabaseUnavailable",
            "busy",
        )));
        assert_eq!(state.session.status, ConnectionStatus::Connected);

        state.apply(&Action::LostConnection(ConnectionLoss::new(
            "ServiceUnavailable",
            "gone",
        )));
        assert_eq!(state.session.status, ConnectionStatus::Retrying);
    }

    #[test]
    fn disconnect_clears_meta_and_selection() {
        let mut state = connected_state();
        state.apply(&Action::UseDb(Some("neo4j".to_string())));
        state.apply(&Action::UpdateDatabases(vec![DatabaseRecord::new("neo4j", true)]));
        state.apply(&Action::DisconnectionSuccess);

        assert_eq!(state.session.status, ConnectionStatus::Disconnected);
        assert!(state.session.use_db().is_none());
        assert!(state.meta.databases.is_empty());
        assert!(state.session.active_descriptor().is_none());
    }

    #[test]
    fn client_config_support_is_tracked_per_host() {
        let mut state = connected_state();
        assert_eq!(state.session.client_config_available(), None);
        state.apply(&Action::SetClientConfig {
            host: "bolt://elsewhere:7687".to_string(),
            available: false,
        });
        assert_eq!(state.session.client_config_available(), None);
        state.apply(&Action::SetClientConfig {
            host: "neo4j://localhost:7687".to_string(),
            available: false,
        });
        assert_eq!(state.session.client_config_available(), Some(false));
    }
}
