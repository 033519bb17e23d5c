//! Process-wide registry of live tunnel sessions.
//!
//! The registry is an explicitly constructed, dependency-injected instance;
//! there is no ambient singleton. A single mutex guards the session map and
//! is never held across an await point: subprocess termination happens
//! between two short critical sections.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::session::{SessionSummary, TunnelSession};
use super::{TunnelError, terminate_child};

/// Table of active tunnel sessions keyed by session identifier.
///
/// The registry is the sole arbiter of local port uniqueness and the only
/// component allowed to mutate shared tunnel state.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    sessions: Mutex<HashMap<Uuid, TunnelSession>>,
}

impl TunnelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, TunnelSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session, enforcing port uniqueness across live sessions.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::PortConflict`] when another live session holds
    /// the same local port. The rejected session is dropped, which reaps its
    /// subprocess through `kill_on_drop`.
    pub fn register(&self, session: TunnelSession) -> Result<Uuid, TunnelError> {
        let mut sessions = self.sessions();
        let port = session.local_port();
        if sessions
            .values()
            .any(|existing| existing.is_live() && existing.local_port() == port)
        {
            return Err(TunnelError::PortConflict { port });
        }

        let id = session.id();
        debug!(session = %id, port, "tunnel session registered");
        sessions.insert(id, session);
        Ok(id)
    }

    /// Returns `true` when a live session holds the given port.
    #[must_use]
    pub fn port_in_use(&self, port: u16) -> bool {
        self.sessions()
            .values()
            .any(|session| session.is_live() && session.local_port() == port)
    }

    /// Lists summaries of every registered session.
    #[must_use]
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions()
            .values()
            .map(TunnelSession::summary)
            .collect();
        summaries.sort_by_key(|summary| summary.local_port);
        summaries
    }

    /// Records that the caller dialed through the session successfully.
    ///
    /// Informational only; returns `false` when the session is unknown.
    #[must_use]
    pub fn mark_active(&self, id: Uuid) -> bool {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(&id) else {
            return false;
        };
        session.mark_active();
        true
    }

    /// Returns the number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    /// Returns `true` when no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Tears a session down and removes it from the registry.
    ///
    /// This is the single cleanup path: explicit closes, shutdown draining,
    /// and abort handling all converge here. Idempotent; closing an unknown
    /// or already-closed session is a no-op.
    pub async fn close_session(&self, id: Uuid, grace: Duration) {
        let child = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(&id) else {
                return;
            };
            session.begin_terminate()
        };

        if let Some(child) = child {
            terminate_child(child, grace).await;
        }

        let mut sessions = self.sessions();
        if let Some(session) = sessions.get_mut(&id) {
            session.mark_closed();
        }
        // Closed is the only state eligible for removal.
        sessions.remove(&id);
        debug!(session = %id, "tunnel session closed");
    }

    /// Force-closes every registered session.
    ///
    /// Invoked once at process shutdown regardless of the exit path, so no
    /// tunnel subprocess outlives the controlling process.
    pub async fn drain_all(&self, grace: Duration) {
        let ids: Vec<Uuid> = self.sessions().keys().copied().collect();
        if !ids.is_empty() {
            warn!(count = ids.len(), "draining tunnel sessions");
        }
        for id in ids {
            self.close_session(id, grace).await;
        }
    }
}
