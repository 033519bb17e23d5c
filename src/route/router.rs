//! The connection façade.
//!
//! [`ConnectionRouter::connect`] is the single entry point callers use: it
//! resolves a plan, drives the tunnel manager when the plan is mediated, and
//! hands back a dialable endpoint. On failure at any stage the chosen plan is
//! discarded and no partial state is left behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::affinity::AffinityHints;
use crate::audit::{AuditEvent, AuditOutcome, AuditSink, TransportKind};
use crate::bastion::BastionHost;
use crate::credential::CredentialStatus;
use crate::exec::CommandRunner;
use crate::target::{Endpoint, RemoteTarget, RoutePreferences};
use crate::tunnel::{ProxySpawner, TunnelError, TunnelHandle, TunnelManager, TunnelRegistry};

use super::resolver::{AccessResolver, ConnectionPlan, RouteError};

const DEFAULT_OPEN_ATTEMPTS: u32 = 3;
const DEFAULT_OPEN_BACKOFF: Duration = Duration::from_millis(500);

/// Tuning knobs for the connect flow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouterSettings {
    /// Bounded number of tunnel open attempts for timeouts.
    pub open_attempts: u32,
    /// Base backoff between open attempts; doubles per attempt.
    pub open_backoff: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            open_backoff: DEFAULT_OPEN_BACKOFF,
        }
    }
}

/// Result of a successful connect: where to dial, and which session backs it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Connection {
    /// Endpoint ready to accept the caller's dial.
    pub endpoint: Endpoint,
    /// Backing tunnel session for mediated transports; `None` when direct.
    pub session: Option<Uuid>,
}

/// Orchestrates resolution, tunnel lifecycle, affinity, and auditing.
#[derive(Clone, Debug)]
pub struct ConnectionRouter<R, S, P, H, A>
where
    R: CommandRunner,
    S: CredentialStatus,
    P: ProxySpawner,
    H: AffinityHints,
    A: AuditSink,
{
    resolver: AccessResolver<R, S>,
    tunnels: TunnelManager<P>,
    affinity: H,
    audit: A,
    settings: RouterSettings,
}

impl<R, S, P, H, A> ConnectionRouter<R, S, P, H, A>
where
    R: CommandRunner,
    S: CredentialStatus,
    P: ProxySpawner,
    H: AffinityHints,
    A: AuditSink,
{
    /// Creates a router over the given collaborators.
    #[must_use]
    pub const fn new(
        resolver: AccessResolver<R, S>,
        tunnels: TunnelManager<P>,
        affinity: H,
        audit: A,
        settings: RouterSettings,
    ) -> Self {
        Self {
            resolver,
            tunnels,
            affinity,
            audit,
            settings,
        }
    }

    /// Returns the registry backing this router's tunnels.
    #[must_use]
    pub const fn registry(&self) -> &Arc<TunnelRegistry> {
        self.tunnels.registry()
    }

    /// Resolves a plan for `target` without opening anything.
    ///
    /// # Errors
    ///
    /// Propagates [`RouteError`] from resolution.
    pub async fn route(
        &self,
        target: &RemoteTarget,
        prefs: &RoutePreferences,
    ) -> Result<ConnectionPlan, RouteError> {
        let hint = self.affinity_hint(target);
        self.resolver.resolve(target, prefs, hint.as_deref()).await
    }

    /// Resolves and, when mediated, opens a tunnel; returns the endpoint.
    ///
    /// The endpoint is guaranteed to be accepting connections when handed
    /// back. Only tunnel readiness timeouts are retried, with a bounded
    /// exponential backoff; every other failure surfaces immediately.
    ///
    /// # Errors
    ///
    /// Propagates [`RouteError`] from resolution and wraps [`TunnelError`]
    /// from tunnel establishment.
    pub async fn connect(
        &self,
        target: &RemoteTarget,
        prefs: &RoutePreferences,
    ) -> Result<Connection, RouteError> {
        let hint = self.affinity_hint(target);
        let plan = match self.resolver.resolve(target, prefs, hint.as_deref()).await {
            Ok(plan) => plan,
            Err(err) => {
                self.record_refusal(target, None, None, &err);
                return Err(err);
            }
        };

        match plan {
            ConnectionPlan::Direct => {
                let endpoint = direct_endpoint(target);
                self.record_connected(target, TransportKind::Direct, None);
                Ok(Connection {
                    endpoint,
                    session: None,
                })
            }
            ConnectionPlan::Mediated { host } => match self.open_with_retry(target, &host).await {
                Ok(handle) => {
                    if let Err(err) = self.affinity.record(&target.id, &host.id) {
                        warn!(target = %target.id, error = %err, "failed to record affinity hint");
                    }
                    self.record_connected(target, TransportKind::Mediated, Some(&host.id));
                    Ok(Connection {
                        endpoint: handle.endpoint,
                        session: Some(handle.id),
                    })
                }
                Err(err) => {
                    // The plan is discarded; nothing is retried beyond the
                    // bounded backoff above this point.
                    let wrapped = RouteError::Tunnel(err);
                    self.record_refusal(
                        target,
                        Some(TransportKind::Mediated),
                        Some(&host.id),
                        &wrapped,
                    );
                    Err(wrapped)
                }
            },
        }
    }

    /// Closes the tunnel backing a connection. Idempotent.
    pub async fn disconnect(&self, session: Uuid) {
        self.tunnels.close(session).await;
    }

    fn affinity_hint(&self, target: &RemoteTarget) -> Option<String> {
        self.affinity.hint_for(&target.id).unwrap_or_else(|err| {
            warn!(target = %target.id, error = %err, "failed to read affinity hint");
            None
        })
    }

    async fn open_with_retry(
        &self,
        target: &RemoteTarget,
        host: &BastionHost,
    ) -> Result<TunnelHandle, TunnelError> {
        let mut backoff = self.settings.open_backoff;
        let mut attempt = 1;
        loop {
            match self.tunnels.open(target, host).await {
                Ok(handle) => return Ok(handle),
                Err(err @ TunnelError::Timeout { .. })
                    if attempt < self.settings.open_attempts =>
                {
                    warn!(attempt, error = %err, "tunnel open timed out; retrying");
                    sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn record_connected(
        &self,
        target: &RemoteTarget,
        transport: TransportKind,
        bastion_id: Option<&str>,
    ) {
        self.audit.record(&AuditEvent {
            target_id: target.id.clone(),
            transport: Some(transport),
            bastion_id: bastion_id.map(str::to_owned),
            outcome: AuditOutcome::Connected,
        });
    }

    fn record_refusal(
        &self,
        target: &RemoteTarget,
        transport: Option<TransportKind>,
        bastion_id: Option<&str>,
        err: &RouteError,
    ) {
        self.audit.record(&AuditEvent {
            target_id: target.id.clone(),
            transport,
            bastion_id: bastion_id.map(str::to_owned),
            outcome: AuditOutcome::Refused {
                reason: err.to_string(),
            },
        });
    }
}

/// Endpoint for a direct plan: the public address when present, otherwise
/// the private address the caller explicitly forced.
fn direct_endpoint(target: &RemoteTarget) -> Endpoint {
    Endpoint {
        host: target.public_ip.unwrap_or(target.private_ip),
        port: target.ssh_port,
    }
}
