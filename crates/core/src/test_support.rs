use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use crate::actions::Action;
use crate::connections::ConnectionDescriptor;
use crate::transport::{
    ConnectError, QueryError, QueryOptions, Record, RecordSet, SessionInfo, Transport,
    TransportEvent,
};

#[derive(Debug)]
pub(crate) struct FakeTransport {
    pub multi_db: AtomicBool,
    pub connect_results: Mutex<VecDeque<Result<SessionInfo, ConnectError>>>,
    pub connect_attempts: Mutex<Vec<ConnectionDescriptor>>,
    pub verify_calls: AtomicUsize,
    pub change_password_error: Mutex<Option<ConnectError>>,
    pub change_password_calls: Mutex<Vec<(Option<String>, String)>>,
    pub disconnect_calls: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    responses: Mutex<HashMap<String, Result<RecordSet, QueryError>>>,
    delays: Mutex<HashMap<String, Duration>>,
    queries: Mutex<Vec<(String, QueryOptions)>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            multi_db: AtomicBool::new(true),
            connect_results: Mutex::default(),
            connect_attempts: Mutex::default(),
            verify_calls: AtomicUsize::new(0),
            change_password_error: Mutex::default(),
            change_password_calls: Mutex::default(),
            disconnect_calls: AtomicUsize::new(0),
            connect_delay: Mutex::default(),
            responses: Mutex::default(),
            delays: Mutex::default(),
            queries: Mutex::default(),
            in_flight: Mutex::default(),
            max_in_flight: Mutex::default(),
            events,
        }
    }
}

impl FakeTransport {
    pub fn queue_connect(&self, result: Result<SessionInfo, ConnectError>) {
        self.connect_results
            .lock()
            .expect("connect results lock")
            .push_back(result);
    }

    pub fn delay_connect(&self, delay: Duration) {
        *self.connect_delay.lock().expect("connect delay lock") = Some(delay);
    }

    pub fn respond(&self, query: &str, result: Result<RecordSet, QueryError>) {
        self.responses
            .lock()
            .expect("responses lock")
            .insert(query.to_string(), result);
    }

    pub fn delay(&self, query: &str, delay: Duration) {
        self.delays
            .lock()
            .expect("delays lock")
            .insert(query.to_string(), delay);
    }

    pub fn query_count(&self, query: &str) -> usize {
        self.queries
            .lock()
            .expect("queries lock")
            .iter()
            .filter(|(candidate, _)| candidate == query)
            .count()
    }

    pub fn queries_for(&self, query: &str) -> Vec<QueryOptions> {
        self.queries
            .lock()
            .expect("queries lock")
            .iter()
            .filter(|(candidate, _)| candidate == query)
            .map(|(_, options)| options.clone())
            .collect()
    }

    pub fn max_in_flight(&self, query: &str) -> usize {
        self.max_in_flight
            .lock()
            .expect("max in flight lock")
            .get(query)
            .copied()
            .unwrap_or(0)
    }

    pub fn connect_hosts(&self) -> Vec<String> {
        self.connect_attempts
            .lock()
            .expect("connect attempts lock")
            .iter()
            .map(|descriptor| descriptor.host.clone())
            .collect()
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            server_agent: Some("Neo4j/4.4.0".to_string()),
            supports_multi_db: self.multi_db.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the in-flight count even when the query future is dropped.
struct InFlight<'a> {
    counts: &'a Mutex<HashMap<String, usize>>,
    query: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(current) = self
            .counts
            .lock()
            .expect("in flight lock")
            .get_mut(self.query)
        {
            *current -= 1;
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<SessionInfo, ConnectError> {
        self.connect_attempts
            .lock()
            .expect("connect attempts lock")
            .push(descriptor.clone());
        let delay = *self.connect_delay.lock().expect("connect delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .connect_results
            .lock()
            .expect("connect results lock")
            .pop_front();
        scripted.unwrap_or_else(|| Ok(self.session_info()))
    }

    async fn verify_credentials(
        &self,
        _descriptor: &ConnectionDescriptor,
    ) -> Result<(), ConnectError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn change_password(
        &self,
        descriptor: &ConnectionDescriptor,
        new_password: &str,
    ) -> Result<(), ConnectError> {
        self.change_password_calls
            .lock()
            .expect("change password lock")
            .push((descriptor.password.clone(), new_password.to_string()));
        match self
            .change_password_error
            .lock()
            .expect("change password lock")
            .clone()
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn run_query(
        &self,
        query: &str,
        _params: Map<String, Value>,
        options: &QueryOptions,
    ) -> Result<RecordSet, QueryError> {
        self.queries
            .lock()
            .expect("queries lock")
            .push((query.to_string(), options.clone()));
        {
            let mut in_flight = self.in_flight.lock().expect("in flight lock");
            let current = in_flight.entry(query.to_string()).or_insert(0);
            *current += 1;
            let mut max = self.max_in_flight.lock().expect("max in flight lock");
            let peak = max.entry(query.to_string()).or_insert(0);
            *peak = (*peak).max(*current);
        }

        let _in_flight = InFlight {
            counts: &self.in_flight,
            query,
        };

        let delay = self.delays.lock().expect("delays lock").get(query).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .lock()
            .expect("responses lock")
            .get(query)
            .cloned()
            .unwrap_or_else(|| Ok(RecordSet::default()))
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe_events(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        Some(self.events.subscribe())
    }
}

pub(crate) fn descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor::new("local", "neo4j://localhost:7687", "neo4j").with_password("secret")
}

pub(crate) fn meta_result(labels: &[&str]) -> RecordSet {
    let section = |name: &str, data: Value| {
        Record::new(
            vec!["result".to_string()],
            vec![json!({ "name": name, "data": data })],
        )
    };
    RecordSet::new(vec![
        section("labels", json!(labels)),
        section("relationshipTypes", json!([])),
        section("propertyKeys", json!([])),
        section("functions", json!([])),
        section("procedures", json!([])),
        section("nodes", json!(labels.len())),
        section("relationships", json!(0)),
    ])
}

pub(crate) fn show_databases(databases: &[(&str, bool)]) -> RecordSet {
    RecordSet::new(
        databases
            .iter()
            .map(|(name, default)| {
                Record::new(
                    vec![
                        "name".to_string(),
                        "currentStatus".to_string(),
                        "default".to_string(),
                    ],
                    vec![json!(name), json!("online"), json!(default)],
                )
            })
            .collect(),
    )
}

pub(crate) fn config_records(entries: &[(&str, Value)]) -> RecordSet {
    RecordSet::new(
        entries
            .iter()
            .map(|(name, value)| {
                Record::new(
                    vec!["name".to_string(), "value".to_string()],
                    vec![json!(name), value.clone()],
                )
            })
            .collect(),
    )
}

/// Lets spawned tasks run; with paused time this also advances the clock.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

pub(crate) async fn wait_for(
    bus: &mut broadcast::Receiver<Action>,
    mut predicate: impl FnMut(&Action) -> bool,
) -> Action {
    let wait = async {
        loop {
            match bus.recv().await {
                Ok(action) if predicate(&action) => return action,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("action bus closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), wait)
        .await
        .expect("timed out waiting for action")
}
