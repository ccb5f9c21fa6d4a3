use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cypherdeck_adapters::http::HttpTransport;
use cypherdeck_adapters::keyring::resolve_password;
use cypherdeck_core::actions::Action;
use cypherdeck_core::config::BrowserConfig;
use cypherdeck_core::connections::{ConnectionDescriptor, FileConnectionsStore};
use cypherdeck_core::session::BrowserSession;
use cypherdeck_core::state::AppState;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONNECTION_ENV_VAR: &str = "CYPHERDECK_CONNECTION";
const FIRST_CYCLE_TIMEOUT: Duration = Duration::from_secs(30);

fn select_connection(
    connections: &[ConnectionDescriptor],
    requested: Option<&str>,
) -> Result<ConnectionDescriptor, String> {
    if let Some(id) = requested.filter(|id| !id.is_empty()) {
        return connections
            .iter()
            .find(|connection| connection.id == id)
            .cloned()
            .ok_or_else(|| format!("no saved connection named `{id}`"));
    }
    match connections {
        [only] => Ok(only.clone()),
        [] => Err("no saved connections".to_string()),
        _ => Err(format!(
            "{} saved connections; set {CONNECTION_ENV_VAR} to pick one",
            connections.len()
        )),
    }
}

fn summarize(state: &AppState) -> String {
    let session = &state.session;
    let meta = &state.meta;
    let mut lines = vec![
        format!("status: {:?}", session.status),
        format!(
            "server: {} {}",
            meta.server.version.as_deref().unwrap_or("unknown version"),
            meta.server.edition.as_deref().unwrap_or("")
        )
        .trim_end()
        .to_string(),
        format!("database: {}", session.use_db().unwrap_or("(default)")),
        format!(
            "labels: {}, relationship types: {}, property keys: {}",
            meta.snapshot.labels.len(),
            meta.snapshot.relationship_types.len(),
            meta.snapshot.properties.len()
        ),
    ];
    if !meta.databases.is_empty() {
        let names: Vec<&str> = meta.databases.iter().map(|db| db.name.as_str()).collect();
        lines.push(format!("databases: {}", names.join(", ")));
    }
    if let Some(role) = meta.server.cluster_role.as_deref() {
        lines.push(format!("cluster role: {role}"));
    }
    lines.join("\n")
}

async fn wait_for_first_cycle(bus: &mut broadcast::Receiver<Action>) -> bool {
    let wait = async {
        loop {
            match bus.recv().await {
                Ok(Action::DbMetaDone) => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(FIRST_CYCLE_TIMEOUT, wait)
        .await
        .unwrap_or(false)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BrowserConfig::load_default()?;
    let connections = FileConnectionsStore::load_default()?;
    let requested = std::env::var(CONNECTION_ENV_VAR).ok();
    let mut descriptor = select_connection(connections.connections(), requested.as_deref())?;
    if descriptor.password.is_none() {
        descriptor.password = resolve_password(&descriptor);
    }

    let session = BrowserSession::start(
        Arc::new(HttpTransport::default()),
        config,
        Some(Arc::new(Mutex::new(connections))),
    );
    let mut bus = session.store().subscribe();

    info!(id = %descriptor.id, host = %descriptor.host, "connecting");
    let outcome = session.connect(descriptor).await;
    if outcome.is_ok() {
        if !wait_for_first_cycle(&mut bus).await {
            warn!("metadata did not arrive in time");
        }
        println!("{}", summarize(&session.store().state()));
        session.disconnect().await;
    }
    session.shutdown().await;
    outcome?;
    Ok(())
}
