use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Map;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::config::SysInfoConfig;
use crate::connections::unix_timestamp_millis;
use crate::store::Store;
use crate::transport::{QueryError, QueryOptions, RecordSet, Transport};

pub const CLUSTER_OVERVIEW_QUERY: &str = "CALL dbms.cluster.overview";

#[must_use]
pub fn sysinfo_query(use_db: Option<&str>, multi_db: bool) -> String {
    let pattern = match use_db {
        Some(database) if multi_db => format!("org.neo4j:database={database},*"),
        _ => "org.neo4j:*".to_string(),
    };
    format!("CALL dbms.queryJmx(\"{pattern}\") YIELD name, attributes RETURN name, attributes")
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SysInfoSnapshot {
    pub last_fetch_unix_ms: Option<u64>,
    pub results: Option<RecordSet>,
    pub cluster: Option<RecordSet>,
    pub error: Option<String>,
}

/// On-demand and periodic system information for the active database.
#[derive(Debug)]
pub struct SysInfoMonitor<T: Transport> {
    store: Store,
    transport: Arc<T>,
    interval: Duration,
    snapshot: Mutex<SysInfoSnapshot>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> SysInfoMonitor<T> {
    #[must_use]
    pub fn new(store: Store, transport: Arc<T>, config: &SysInfoConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            interval: Duration::from_secs(config.refresh_interval_secs.max(1)),
            snapshot: Mutex::default(),
            timer: Mutex::default(),
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> SysInfoSnapshot {
        self.lock_snapshot().clone()
    }

    #[must_use]
    pub fn is_auto_refreshing(&self) -> bool {
        self.lock_timer().is_some()
    }

    pub async fn refresh(&self) -> Result<(), QueryError> {
        let (connected, use_db, multi_db, cluster) = self.store.select(|state| {
            (
                state.session.is_connected(),
                state.session.use_db().map(str::to_string),
                state.session.supports_multi_db,
                state.session.features.causal_cluster,
            )
        });
        if !connected {
            let error = QueryError::no_connection();
            self.lock_snapshot().error = Some(error.message.clone());
            return Err(error);
        }

        self.lock_snapshot().last_fetch_unix_ms = Some(unix_timestamp_millis());
        let options = QueryOptions::default().with_use_db(use_db.as_deref());
        let query = sysinfo_query(use_db.as_deref(), multi_db);

        let outcome = self.transport.run_query(&query, Map::new(), &options).await;
        let cluster_outcome = if cluster {
            Some(
                self.transport
                    .run_query(CLUSTER_OVERVIEW_QUERY, Map::new(), &options)
                    .await,
            )
        } else {
            None
        };

        let mut snapshot = self.lock_snapshot();
        match cluster_outcome {
            Some(Ok(result)) => snapshot.cluster = Some(result),
            Some(Err(error)) => debug!(code = %error.code, "cluster overview failed"),
            None => snapshot.cluster = None,
        }
        match outcome {
            Ok(result) => {
                snapshot.results = Some(result);
                snapshot.error = None;
                Ok(())
            }
            Err(error) => {
                snapshot.error = Some(error.message.clone());
                Err(error)
            }
        }
    }

    /// Turning refresh on fetches immediately and then on every interval;
    /// turning it off tears the timer down.
    pub fn set_auto_refresh(self: &Arc<Self>, enabled: bool) {
        let mut timer = self.lock_timer();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        if !enabled {
            debug!("sysinfo auto-refresh off");
            return;
        }

        let monitor = Arc::downgrade(self);
        let period = self.interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let Some(monitor) = Weak::upgrade(&monitor) else {
                    break;
                };
                if let Err(error) = monitor.refresh().await {
                    debug!(code = %error.code, "sysinfo refresh failed");
                }
            }
        }));
        debug!(interval_secs = period.as_secs(), "sysinfo auto-refresh on");
    }

    fn lock_snapshot(&self) -> MutexGuard<'_, SysInfoSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> Drop for SysInfoMonitor<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_timer().take() {
            handle.abort();
        }
    }
}
