//! Access strategy resolution.
//!
//! The resolver decides, once per connection attempt, whether a target is
//! reached directly or through a bastion. The decision is produced as a
//! [`ConnectionPlan`] and consumed immutably downstream; flags are never
//! re-evaluated at other call sites.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::bastion::{BastionDirectory, BastionHost};
use crate::credential::{AuthError, CredentialGuard, CredentialStatus};
use crate::exec::CommandRunner;
use crate::target::{NetworkScope, RemoteTarget, RoutePreferences};
use crate::tunnel::TunnelError;

const DEFAULT_CREDENTIAL_MARGIN: Duration = Duration::from_secs(300);
const DEFAULT_DISCOVERY_ATTEMPTS: u32 = 3;
const DEFAULT_DISCOVERY_BACKOFF: Duration = Duration::from_millis(200);

/// Transport decision for one connection attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionPlan {
    /// Dial the target's own address; no tunnel involved.
    Direct,
    /// Tunnel through the selected bastion.
    Mediated {
        /// The chosen mediating host.
        host: BastionHost,
    },
}

/// Errors raised while resolving or executing a connection.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RouteError {
    /// Raised when mediation is required but no usable bastion exists.
    ///
    /// This is the fail-secure outcome: a private-only target is never
    /// dialled directly as a fallback.
    #[error("no usable bastion serves network {scope} and the target has no public address")]
    NoPathAvailable {
        /// Network scope that was searched.
        scope: NetworkScope,
        /// Whether the caller asked for creation to be offered.
        auto_create_requested: bool,
    },
    /// Raised when the selected bastion does not serve the target's network.
    #[error(
        "target network {target_scope} is not served by the selected bastion (attached to {host_scopes:?})"
    )]
    NetworkMismatch {
        /// Network the target belongs to.
        target_scope: NetworkScope,
        /// Networks the selected bastion is attached to.
        host_scopes: Vec<String>,
    },
    /// Raised when a pinned bastion is absent or unusable.
    #[error("bastion '{name}' was requested but is not usable in network {scope}")]
    NamedHostUnavailable {
        /// Name or identifier the caller pinned.
        name: String,
        /// Network scope that was searched.
        scope: NetworkScope,
    },
    /// Raised when a target has neither a public address nor a network.
    #[error("target {target_id} has neither a public address nor a network to mediate through")]
    Unroutable {
        /// Target instance identifier.
        target_id: String,
    },
    /// Raised when the credential freshness check fails.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Raised when tunnel establishment fails.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Tuning knobs for resolution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolverSettings {
    /// Minimum remaining credential validity before a tunnel may open.
    pub credential_margin: Duration,
    /// Bounded number of discovery attempts for transient failures.
    pub discovery_attempts: u32,
    /// Base backoff between discovery attempts; doubles per attempt.
    pub discovery_backoff: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            credential_margin: DEFAULT_CREDENTIAL_MARGIN,
            discovery_attempts: DEFAULT_DISCOVERY_ATTEMPTS,
            discovery_backoff: DEFAULT_DISCOVERY_BACKOFF,
        }
    }
}

enum Selection {
    Direct,
    Host(BastionHost),
}

/// Decides the transport for a connection attempt.
#[derive(Clone, Debug)]
pub struct AccessResolver<R: CommandRunner, S: CredentialStatus> {
    directory: BastionDirectory<R>,
    guard: CredentialGuard<S>,
    settings: ResolverSettings,
}

impl<R: CommandRunner, S: CredentialStatus> AccessResolver<R, S> {
    /// Creates a resolver over the given collaborators.
    #[must_use]
    pub const fn new(
        directory: BastionDirectory<R>,
        guard: CredentialGuard<S>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            directory,
            guard,
            settings,
        }
    }

    /// Resolves the transport for `target` under the caller's preferences.
    ///
    /// `hint` is an optional bastion identifier from the affinity store; it
    /// is honoured only when the hinted host appears in the fresh discovery
    /// result, and silently ignored otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NoPathAvailable`] when mediation is required but
    /// unavailable, [`RouteError::NetworkMismatch`] when the selected host
    /// does not serve the target's network, [`RouteError::NamedHostUnavailable`]
    /// when a pinned host is unusable, and propagates [`AuthError`] from the
    /// freshness check unchanged.
    pub async fn resolve(
        &self,
        target: &RemoteTarget,
        prefs: &RoutePreferences,
        hint: Option<&str>,
    ) -> Result<ConnectionPlan, RouteError> {
        // Explicit override always wins; the caller accepted responsibility.
        if prefs.force_direct {
            return Ok(ConnectionPlan::Direct);
        }

        if target.public_ip.is_some() && prefs.prefer_direct {
            return Ok(ConnectionPlan::Direct);
        }

        let Some(scope) = target.network.as_ref() else {
            if target.public_ip.is_some() {
                return Ok(ConnectionPlan::Direct);
            }
            return Err(RouteError::Unroutable {
                target_id: target.id.clone(),
            });
        };

        let candidates = self.discover_with_retry(scope).await;
        let selected = match Self::select_host(&candidates, target, prefs, hint, scope)? {
            Selection::Direct => return Ok(ConnectionPlan::Direct),
            Selection::Host(host) => host,
        };

        if !selected.serves(scope) {
            return Err(RouteError::NetworkMismatch {
                target_scope: scope.clone(),
                host_scopes: selected
                    .networks
                    .iter()
                    .map(|network| network.as_str().to_owned())
                    .collect(),
            });
        }

        self.guard.ensure_fresh(self.settings.credential_margin)?;

        debug!(target = %target.id, bastion = %selected.id, "mediated plan selected");
        Ok(ConnectionPlan::Mediated { host: selected })
    }

    fn select_host(
        candidates: &[BastionHost],
        target: &RemoteTarget,
        prefs: &RoutePreferences,
        hint: Option<&str>,
        scope: &NetworkScope,
    ) -> Result<Selection, RouteError> {
        if let Some(name) = prefs.named_host.as_deref() {
            return candidates
                .iter()
                .find(|host| host.name == name || host.id == name)
                .cloned()
                .map(Selection::Host)
                .ok_or_else(|| RouteError::NamedHostUnavailable {
                    name: name.to_owned(),
                    scope: scope.clone(),
                });
        }

        if let Some(hinted) = hint.and_then(|id| candidates.iter().find(|host| host.id == id)) {
            return Ok(Selection::Host(hinted.clone()));
        }

        let Some(first) = candidates.first() else {
            if target.public_ip.is_some() {
                // Fail-secure forbids the fallback only for private-only targets.
                return Ok(Selection::Direct);
            }
            return Err(RouteError::NoPathAvailable {
                scope: scope.clone(),
                auto_create_requested: prefs.auto_create,
            });
        };
        Ok(Selection::Host(first.clone()))
    }

    /// Queries the directory with a bounded, capped backoff. A query that
    /// keeps failing is absorbed as "no candidates"; policy stays with the
    /// resolution algorithm.
    async fn discover_with_retry(&self, scope: &NetworkScope) -> Vec<BastionHost> {
        let mut backoff = self.settings.discovery_backoff;
        for attempt in 1..=self.settings.discovery_attempts {
            match self.directory.discover(scope) {
                Ok(hosts) => return hosts,
                Err(err) => {
                    warn!(%scope, attempt, error = %err, "bastion discovery failed");
                    if attempt < self.settings.discovery_attempts {
                        sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
        Vec::new()
    }
}
