use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::trace;

use crate::actions::Action;
use crate::state::AppState;

const BUS_CAPACITY: usize = 256;

#[derive(Debug)]
struct StoreInner {
    state: Mutex<AppState>,
    bus: broadcast::Sender<Action>,
}

/// Single state container for a browser session.
///
/// Every mutation goes through [`Store::dispatch`], which applies the action
/// to the state and then publishes it on the bus, so subscribers always see
/// actions in the order they were applied. The lock is never held across an
/// await point.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(AppState::default())
    }
}

impl Store {
    #[must_use]
    pub fn new(state: AppState) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(state),
                bus,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AppState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatch(&self, action: Action) {
        trace!(?action, "dispatch");
        let mut state = self.lock();
        state.apply(&action);
        // Publishing under the lock keeps bus order identical to apply order.
        let _ = self.inner.bus.send(action);
    }

    /// Applies `action` only while `guard` holds. The check and the apply
    /// happen under the same lock, so no other action can slip in between.
    pub fn dispatch_if(&self, guard: impl FnOnce(&AppState) -> bool, action: Action) -> bool {
        let mut state = self.lock();
        if !guard(&state) {
            trace!(?action, "dispatch skipped");
            return false;
        }
        state.apply(&action);
        let _ = self.inner.bus.send(action);
        true
    }

    #[must_use]
    pub fn state(&self) -> AppState {
        self.lock().clone()
    }

    pub fn select<R>(&self, selector: impl FnOnce(&AppState) -> R) -> R {
        selector(&self.lock())
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Action> {
        self.inner.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::Store;
    use crate::actions::Action;
    use crate::state::ConnectionStatus;

    #[tokio::test]
    async fn dispatch_applies_then_publishes() {
        let store = Store::default();
        let mut bus = store.subscribe();

        store.dispatch(Action::ConnectionStateChanged(ConnectionStatus::Connecting));
        store.dispatch(Action::ForceFetch);

        assert_eq!(
            store.select(|state| state.session.status),
            ConnectionStatus::Connecting
        );
        assert_eq!(
            bus.recv().await.expect("first action"),
            Action::ConnectionStateChanged(ConnectionStatus::Connecting)
        );
        assert_eq!(bus.recv().await.expect("second action"), Action::ForceFetch);
    }

    #[test]
    fn dispatch_without_subscribers_still_updates_state() {
        let store = Store::default();
        store.dispatch(Action::UseDb(Some("neo4j".to_string())));
        assert_eq!(store.state().session.use_db(), Some("neo4j"));
    }
}
