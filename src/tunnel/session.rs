//! Tunnel session state and summaries.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::process::Child;
use uuid::Uuid;

/// Lifecycle states of a tunnel session.
///
/// Sessions move `Created → Listening → Active → Terminating → Closed`.
/// `Closed` is terminal and reachable from every other state; no state is
/// re-enterable afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Constructed; the subprocess may not have bound its port yet.
    Created,
    /// The loopback port was observed accepting connections.
    Listening,
    /// The caller reported a successful dial through the tunnel.
    Active,
    /// Teardown has begun.
    Terminating,
    /// Fully torn down; the only state eligible for registry removal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Listening => "listening",
            Self::Active => "active",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// A single supervised tunnel subprocess.
///
/// Owned exclusively by the [`TunnelRegistry`](crate::tunnel::TunnelRegistry)
/// for its entire lifetime; every mutation happens under the registry lock.
#[derive(Debug)]
pub struct TunnelSession {
    id: Uuid,
    local_port: u16,
    target_id: String,
    bastion_id: String,
    owner: String,
    created_at: Instant,
    state: SessionState,
    child: Option<Child>,
}

impl TunnelSession {
    /// Constructs a session in `Created` state.
    ///
    /// The child carries `kill_on_drop`, so a session dropped before
    /// registration cannot leak its subprocess.
    #[must_use]
    pub fn new(
        local_port: u16,
        target_id: impl Into<String>,
        bastion_id: impl Into<String>,
        owner: impl Into<String>,
        child: Option<Child>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_port,
            target_id: target_id.into(),
            bastion_id: bastion_id.into(),
            owner: owner.into(),
            created_at: Instant::now(),
            state: SessionState::Created,
            child,
        }
    }

    /// Returns the session identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the assigned loopback port.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the identity that owns the session.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns `true` when the session still counts towards port uniqueness.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !matches!(self.state, SessionState::Closed)
    }

    /// Records that the loopback port was observed bound.
    ///
    /// Only meaningful from `Created`; any other state is left untouched.
    pub(crate) fn mark_listening(&mut self) {
        if matches!(self.state, SessionState::Created) {
            self.state = SessionState::Listening;
        }
    }

    /// Records a successful dial through the tunnel. Informational only.
    pub(crate) fn mark_active(&mut self) {
        if matches!(self.state, SessionState::Listening) {
            self.state = SessionState::Active;
        }
    }

    /// Begins teardown, handing the subprocess to the caller for
    /// termination outside the registry lock.
    ///
    /// Returns `None` when the session is already terminating or closed.
    pub(crate) fn begin_terminate(&mut self) -> Option<Child> {
        if matches!(
            self.state,
            SessionState::Terminating | SessionState::Closed
        ) {
            return None;
        }
        self.state = SessionState::Terminating;
        self.child.take()
    }

    /// Marks the session closed. Terminal; idempotent.
    pub(crate) fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
        self.child = None;
    }

    /// Produces an introspection snapshot for status displays.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            local_port: self.local_port,
            target_id: self.target_id.clone(),
            bastion_id: self.bastion_id.clone(),
            state: self.state,
            age: self.created_at.elapsed(),
        }
    }
}

/// Introspection snapshot of a registered session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: Uuid,
    /// Assigned loopback port.
    pub local_port: u16,
    /// Target instance identifier.
    pub target_id: String,
    /// Mediating host identifier.
    pub bastion_id: String,
    /// Lifecycle state at snapshot time.
    pub state: SessionState,
    /// Time elapsed since the session was constructed.
    pub age: Duration,
}
