//! Session registry - concurrent map from call id to live session

use crate::application::timers::{SessionTimers, TimerEvent};
use crate::domain::call::aggregate::{CallSession, SessionSummary};
use crate::domain::shared::value_objects::CallId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, watch, Mutex, MutexGuard, RwLock};
use tracing::debug;

/// Session plus the timers it owns, guarded together
#[derive(Debug)]
pub struct SessionState {
    pub session: CallSession,
    pub timers: SessionTimers,
    /// The call row exists in the repository
    pub record_saved: bool,
}

/// Shared handle to one live session.
///
/// Webhook operations on the same call serialize on `state`; the registry map
/// itself is only locked for lookup and insert/remove. `expired` is readable
/// without the lock so work parked on a collaborator can give way to the
/// deadline.
#[derive(Debug)]
pub struct SessionHandle {
    call_id: CallId,
    state: Mutex<SessionState>,
    expired: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn new(session: CallSession, timer_tx: UnboundedSender<TimerEvent>) -> Self {
        let call_id = session.id().clone();
        let timers = SessionTimers::new(call_id.clone(), timer_tx);
        Self {
            call_id,
            state: Mutex::new(SessionState {
                session,
                timers,
                record_saved: false,
            }),
            expired: watch::Sender::new(false),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Deadline fired; results of collaborator calls still in flight are discarded
    pub fn mark_expired(&self) {
        self.expired.send_replace(true);
    }

    pub fn is_expired(&self) -> bool {
        *self.expired.borrow()
    }

    /// Resolves once the deadline has fired
    pub async fn expired(&self) {
        let mut rx = self.expired.subscribe();
        // the sender lives as long as the handle, so this only ends on `true`
        let _ = rx.wait_for(|expired| *expired).await;
    }

    pub async fn summary(&self) -> SessionSummary {
        self.state.lock().await.session.summary()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<CallId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, call_id: &CallId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(call_id).cloned()
    }

    /// Insert `create()` unless a session already exists. Returns the stored
    /// handle and whether it was created by this call.
    pub async fn get_or_insert_with<F>(&self, call_id: &CallId, create: F) -> (Arc<SessionHandle>, bool)
    where
        F: FnOnce() -> SessionHandle,
    {
        if let Some(existing) = self.get(call_id).await {
            return (existing, false);
        }
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(call_id) {
            return (existing.clone(), false);
        }
        let handle = Arc::new(create());
        sessions.insert(call_id.clone(), handle.clone());
        metrics::gauge!("call_sessions_active").set(sessions.len() as f64);
        (handle, true)
    }

    /// Insert a freshly created session; `false` if the id is taken
    pub async fn insert(&self, handle: Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(handle.call_id()) {
            return false;
        }
        sessions.insert(handle.call_id().clone(), handle);
        metrics::gauge!("call_sessions_active").set(sessions.len() as f64);
        true
    }

    pub async fn remove(&self, call_id: &CallId) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(call_id);
        if removed.is_some() {
            debug!(call_id = %call_id, "Session evicted from registry");
            metrics::gauge!("call_sessions_active").set(sessions.len() as f64);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of all handles; the map lock is released before the caller
    /// touches any session
    pub async fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
