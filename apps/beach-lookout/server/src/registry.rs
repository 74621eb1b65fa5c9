use std::sync::Arc;
use std::time::Duration;

use beach_lookout_core::ServerEnvelope;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::session::{Session, SessionConfig};
use crate::supervisor::{ExecutionState, ExecutionSupervisor};
use crate::telemetry;
use crate::transport::Target;

/// Every live session, keyed by its connection id.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    sessions: DashMap<Uuid, Session>,
    config: SessionConfig,
    supervisor: ExecutionSupervisor,
    emptied: Notify,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub target: String,
    pub executing: bool,
    /// Lifecycle state of the session's latest execution.
    pub execution_state: Option<&'static str>,
    pub dropped_messages: u64,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, supervisor: ExecutionSupervisor) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                sessions: DashMap::new(),
                config,
                supervisor,
                emptied: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn supervisor(&self) -> &ExecutionSupervisor {
        &self.inner.supervisor
    }

    /// Creates and registers a session for a freshly upgraded connection.
    pub fn open(&self, target: Target) -> (Session, mpsc::Receiver<ServerEnvelope>) {
        let (session, outbound) = Session::new(
            target,
            self.inner.config.clone(),
            self.inner.supervisor.clone(),
        );
        self.inner.sessions.insert(session.id(), session.clone());
        counter!(telemetry::SESSIONS_OPENED, 1);
        gauge!(telemetry::SESSIONS_ACTIVE, self.len() as f64);
        (session, outbound)
    }

    pub fn remove(&self, session_id: Uuid) -> Option<Session> {
        let removed = self.inner.sessions.remove(&session_id).map(|(_, s)| s);
        gauge!(telemetry::SESSIONS_ACTIVE, self.len() as f64);
        if self.inner.sessions.is_empty() {
            self.inner.emptied.notify_waiters();
        }
        removed
    }

    pub fn get(&self, session_id: Uuid) -> Option<Session> {
        self.inner
            .sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Closes every registered session. Sessions unregister themselves once
    /// their tasks finish.
    pub fn close_all(&self) -> usize {
        let sessions: Vec<Session> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let closed = sessions.iter().filter(|session| session.close()).count();
        info!(closed, "closed all sessions");
        closed
    }

    /// Waits until no session is registered. Returns `false` if `grace`
    /// elapsed first.
    pub async fn wait_empty(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let emptied = self.inner.emptied.notified();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, emptied).await.is_err() {
                return self.is_empty();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .inner
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionSnapshot {
                    session_id: session.id(),
                    target: session.target().to_string(),
                    executing: session.has_running_execution(),
                    execution_state: session.execution_state().map(ExecutionState::as_str),
                    dropped_messages: session.dropped_messages(),
                }
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.session_id);
        snapshots
    }
}
