//! Agent registry -- the identity → session map shared by the acceptor, the
//! disconnect handler and the probe API.
//!
//! The lock is held only around map operations. Lookups hand out an
//! `Arc<AgentSession>` clone so callers do network I/O after the lock is
//! released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::session::{AgentSession, AgentSummary};

/// The set of live agent sessions, keyed by agent identity.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, Arc<AgentSession>>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<String, Arc<AgentSession>>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session under its identity.
    ///
    /// If a session with the same identity is already registered, it is
    /// replaced and the old one is returned so the caller can close it.
    pub fn register(&self, session: Arc<AgentSession>) -> Option<Arc<AgentSession>> {
        let id = session.id().to_string();
        self.agents().insert(id, session)
    }

    /// Look up a session by identity.
    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.agents().get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents().contains_key(agent_id)
    }

    /// Remove `agent_id` only while it still refers to `connection_id`.
    ///
    /// Returns `false` when the identity is absent or already belongs to a
    /// newer connection.
    pub fn remove_connection(&self, agent_id: &str, connection_id: u64) -> bool {
        let mut agents = self.agents();
        match agents.get(agent_id) {
            Some(current) if current.connection_id() == connection_id => {
                agents.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every registered agent, sorted by identity.
    pub fn list(&self) -> Vec<AgentSummary> {
        let mut summaries: Vec<AgentSummary> =
            self.agents().values().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Close every registered session and empty the registry.
    pub fn close_all(&self) {
        let drained: Vec<Arc<AgentSession>> = self.agents().drain().map(|(_, s)| s).collect();
        for session in drained {
            session.close();
        }
    }

    /// Return the number of registered agents.
    pub fn len(&self) -> usize {
        self.agents().len()
    }

    /// Return `true` if no agents are registered.
    pub fn is_empty(&self) -> bool {
        self.agents().is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<String> = self.agents().keys().cloned().collect();
        ids.sort();
        f.debug_struct("AgentRegistry")
            .field("agents", &ids)
            .finish()
    }
}
