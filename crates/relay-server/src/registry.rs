//! Connection → session map.
//!
//! Every connection owns at most one [`AgentSession`]. Teardown always runs
//! persistence end, then engine stop, then map removal.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use relay_core::ids::ConnectionId;
use relay_core::persistence::PersistenceSink;
use relay_core::EngineError;

use crate::session::AgentSession;

pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Arc<AgentSession>>,
    persistence: Arc<dyn PersistenceSink>,
}

impl SessionRegistry {
    pub fn new(persistence: Arc<dyn PersistenceSink>) -> Self {
        Self {
            sessions: DashMap::new(),
            persistence,
        }
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<AgentSession>> {
        self.sessions.get(connection_id).map(|s| Arc::clone(s.value()))
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Tear down any existing session for `connection_id`, then install the
    /// one produced by `start`.
    ///
    /// The old session is fully stopped before `start` runs.
    pub async fn replace<F, Fut>(
        &self,
        connection_id: &ConnectionId,
        start: F,
    ) -> Result<Arc<AgentSession>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<AgentSession>, EngineError>>,
    {
        if self.remove(connection_id).await {
            debug!(connection_id = %connection_id, "replaced previous session");
        }

        let session = start().await?;
        if let Some(displaced) = self.sessions.insert(connection_id.clone(), Arc::clone(&session)) {
            self.teardown(&displaced).await;
        }
        Ok(session)
    }

    /// Tear down and forget the session for `connection_id`.
    /// Returns `false` if there was none.
    pub async fn remove(&self, connection_id: &ConnectionId) -> bool {
        let Some(session) = self.get(connection_id) else {
            return false;
        };
        self.teardown(&session).await;
        let _ = self
            .sessions
            .remove_if(connection_id, |_, current| Arc::ptr_eq(current, &session));
        info!(connection_id = %connection_id, active = self.count(), "session removed");
        true
    }

    /// Tear down every session. Used on server shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.remove(&id).await;
        }
    }

    async fn teardown(&self, session: &AgentSession) {
        session.teardown(self.persistence.as_ref()).await;
    }
}
