//! Core library for the Mist connection routing tool.
//!
//! The crate decides whether a remote development instance is reached
//! directly or through a mediating bastion, and owns the lifecycle of the
//! local tunnel subprocesses that make mediated access possible (resolve →
//! open → supervise → drain). Provisioning, cost estimation, and the remote
//! shell dial itself stay with external collaborators.

pub mod affinity;
pub mod audit;
pub mod bastion;
pub mod config;
pub mod credential;
pub mod exec;
pub mod inventory;
pub mod route;
pub mod target;
pub mod test_support;
pub mod tunnel;

pub use affinity::{AffinityHints, AffinityStore, AffinityStoreError};
pub use audit::{AuditEvent, AuditOutcome, AuditSink, TracingAuditSink, TransportKind};
pub use bastion::{BastionDirectory, BastionHost, BastionState, BastionTier, DiscoveryError};
pub use config::{ConfigError, MistConfig};
pub use credential::{
    AuthError, CliCredentialStatus, CredentialGuard, CredentialReport, CredentialStatus,
};
pub use exec::{CloudQueryConfig, CommandOutput, CommandRunner, ExecError, ProcessCommandRunner};
pub use inventory::{InstanceInventory, InventoryError};
pub use route::{
    AccessResolver, Connection, ConnectionPlan, ConnectionRouter, ResolverSettings, RouteError,
    RouterSettings,
};
pub use target::{DEFAULT_SSH_PORT, Endpoint, NetworkScope, RemoteTarget, RoutePreferences};
pub use tunnel::{
    EPHEMERAL_PORT_RANGE, ForwardSpec, ProxySpawner, SessionState, SessionSummary, SshOptions,
    SshProxySpawner, TunnelError, TunnelHandle, TunnelManager, TunnelRegistry, TunnelSession,
    TunnelSettings,
};
