use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{AgentError, Result};
use crate::fanout::EventFanout;
use crate::supervisor::{RunHandle, SessionState, Supervisor};
use crate::types::{AutomationRequest, ClientInfo};

/// Extra time allowed on detach beyond the stop grace period.
const DETACH_SLACK: Duration = Duration::from_secs(3);

/// One connected client and its slot for a single automation.
pub struct Session {
    info: ClientInfo,
    supervisor: Arc<Supervisor>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.info.client_id
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn fanout(&self) -> &EventFanout {
        self.supervisor.fanout()
    }

    pub fn state(&self) -> SessionState {
        self.supervisor.state()
    }
}

/// Maps connection ids to sessions. The busy check itself lives in each
/// [`Supervisor`], which flips idle to running under its own lock.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    worker: Arc<WorkerConfig>,
    event_capacity: usize,
}

impl SessionRegistry {
    pub fn new(worker: WorkerConfig, event_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::with_capacity(16)),
            worker: Arc::new(worker),
            event_capacity,
        }
    }

    /// Registers `info.client_id` in the idle state. Attaching an id that is
    /// already present returns the existing session untouched.
    pub async fn attach(&self, info: ClientInfo) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&info.client_id) {
            debug!(session_id = %info.client_id, "session already attached");
            return Arc::clone(existing);
        }

        let id = info.client_id.clone();
        let fanout = EventFanout::new(id.clone(), self.event_capacity);
        let supervisor = Supervisor::new(id.clone(), Arc::clone(&self.worker), fanout);
        let session = Arc::new(Session { info, supervisor });
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(session_id = %id, sessions = sessions.len(), "session attached");
        session
    }

    /// Stops any running worker and removes the session. Returns once the
    /// worker has been reaped, or the detach deadline has passed.
    pub async fn detach(&self, session_id: &str) -> bool {
        let session = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.remove(session_id) else {
                return false;
            };
            // Closing under the supervisor lock means a submit that already
            // looked the session up either started first, and is stopped here,
            // or is refused.
            session.supervisor.close();
            session
        };

        if session.supervisor.is_active() {
            let deadline = self.worker.stop_grace + DETACH_SLACK;
            if tokio::time::timeout(deadline, session.supervisor.wait_idle())
                .await
                .is_err()
            {
                warn!(session_id, "worker still running after detach deadline");
            }
        }
        info!(session_id, "session detached");
        true
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Supervisor>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|session| Arc::clone(&session.supervisor))
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn submit(&self, session_id: &str, request: AutomationRequest) -> Result<RunHandle> {
        let supervisor = self
            .get(session_id)
            .await
            .ok_or_else(|| AgentError::UnknownSession(session_id.to_string()))?;
        supervisor.start(request)
    }

    /// Stops the session's worker. `Ok(false)` when nothing was running.
    pub async fn cancel(&self, session_id: &str) -> Result<bool> {
        let supervisor = self
            .get(session_id)
            .await
            .ok_or_else(|| AgentError::UnknownSession(session_id.to_string()))?;
        Ok(supervisor.stop())
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        let sessions = self.sessions.read().await;
        let mut clients: Vec<ClientInfo> = sessions.values().map(|s| s.info.clone()).collect();
        clients.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        clients
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn active_automations(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.supervisor.is_active())
            .count()
    }
}
