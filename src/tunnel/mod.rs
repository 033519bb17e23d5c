//! Tunnel lifecycle: opening, supervising, and tearing down the loopback
//! proxy subprocesses that make mediated access possible.
//!
//! A tunnel binds a randomly drawn ephemeral port on the loopback interface
//! only and forwards it to the target's private endpoint through the chosen
//! bastion. Tunnels live for the duration of the controlling process; nothing
//! is persisted across sessions.

use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::debug;
use uuid::Uuid;

use crate::bastion::BastionHost;
use crate::target::{Endpoint, RemoteTarget};

mod registry;
mod session;

pub use registry::TunnelRegistry;
pub use session::{SessionState, SessionSummary, TunnelSession};

/// Conventional ephemeral port range for short-lived local listeners.
pub const EPHEMERAL_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_BASTION_PORT: u16 = 61000;
const PORT_DRAW_ATTEMPTS: usize = 16;

/// Errors raised while opening or supervising tunnels.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TunnelError {
    /// Raised when the proxy never reaches a listening state in time.
    #[error("tunnel on port {port} did not start listening within {timeout_secs}s")]
    Timeout {
        /// Loopback port the proxy was asked to bind.
        port: u16,
        /// Readiness timeout that elapsed.
        timeout_secs: u64,
    },
    /// Raised when another live session already holds the chosen port.
    #[error("local port {port} is already held by a live tunnel session")]
    PortConflict {
        /// Conflicting loopback port.
        port: u16,
    },
    /// Raised when the proxy subprocess is not owned by the caller.
    #[error("tunnel process is owned by uid {actual}, expected uid {expected}")]
    OwnershipViolation {
        /// Effective uid of the controlling process.
        expected: u32,
        /// Owner uid observed on the subprocess.
        actual: u32,
    },
    /// Raised when the proxy subprocess cannot be spawned.
    #[error("failed to spawn tunnel process: {message}")]
    Spawn {
        /// Operating system error message.
        message: String,
    },
    /// Raised when no unused port could be drawn from the configured range.
    #[error("unable to draw an unused local port after {attempts} attempts")]
    PortsExhausted {
        /// Number of draws attempted.
        attempts: usize,
    },
}

/// Parameters describing one local forward through a bastion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForwardSpec {
    /// Loopback port to bind locally.
    pub local_port: u16,
    /// Private address of the target instance.
    pub target_host: IpAddr,
    /// SSH port on the target instance.
    pub target_port: u16,
    /// Public address of the bastion.
    pub bastion_host: IpAddr,
    /// Port the bastion's SSH endpoint listens on.
    pub bastion_port: u16,
    /// User account presented to the bastion.
    pub bastion_user: String,
}

/// Seam for spawning the proxying subprocess.
pub trait ProxySpawner {
    /// Spawns the proxy described by `spec`.
    ///
    /// Implementations must bind the local side to the loopback interface
    /// only and must arm `kill_on_drop` so an abandoned handle cannot leak
    /// the subprocess.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Spawn`] when the process cannot be started.
    fn spawn(&self, spec: &ForwardSpec) -> Result<Child, TunnelError>;
}

/// SSH client flags shared by every spawned proxy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the SSH client binary.
    pub ssh_bin: String,
    /// Identity file passed with `-i`, when set.
    pub identity_file: Option<String>,
    /// Refuse interactive prompts (`BatchMode=yes`).
    pub batch_mode: bool,
    /// Enforce strict host key checking.
    pub strict_host_key_checking: bool,
    /// Known-hosts file override; empty means the client default.
    pub known_hosts_file: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            identity_file: None,
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::new(),
        }
    }
}

/// Spawns the system SSH client with a loopback-only local forward.
#[derive(Clone, Debug, Default)]
pub struct SshProxySpawner {
    options: SshOptions,
}

impl SshProxySpawner {
    /// Creates a spawner with the given client options.
    #[must_use]
    pub const fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn build_args(&self, spec: &ForwardSpec) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-N"),
            OsString::from("-o"),
            OsString::from("ExitOnForwardFailure=yes"),
        ];

        if self.options.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.options.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.options.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.options.known_hosts_file
            )));
        }

        if let Some(ref identity_file) = self.options.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity_file));
        }

        // Binding the wildcard interface is a defect, not a configuration
        // choice; the forward is pinned to loopback explicitly.
        args.push(OsString::from("-L"));
        args.push(OsString::from(format!(
            "127.0.0.1:{}:{}:{}",
            spec.local_port, spec.target_host, spec.target_port
        )));
        args.push(OsString::from("-p"));
        args.push(OsString::from(spec.bastion_port.to_string()));
        args.push(OsString::from(format!(
            "{}@{}",
            spec.bastion_user, spec.bastion_host
        )));
        args
    }
}

impl ProxySpawner for SshProxySpawner {
    fn spawn(&self, spec: &ForwardSpec) -> Result<Child, TunnelError> {
        Command::new(&self.options.ssh_bin)
            .args(self.build_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TunnelError::Spawn {
                message: err.to_string(),
            })
    }
}

/// Tuning knobs for tunnel establishment and teardown.
#[derive(Clone, Debug)]
pub struct TunnelSettings {
    /// Range ports are drawn from.
    pub port_range: RangeInclusive<u16>,
    /// Deadline for the proxy to start listening.
    pub ready_timeout: Duration,
    /// Interval between readiness probes.
    pub poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL during teardown.
    pub grace: Duration,
    /// User account presented to the bastion.
    pub bastion_user: String,
    /// Port the bastion's SSH endpoint listens on.
    pub bastion_port: u16,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            port_range: EPHEMERAL_PORT_RANGE,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace: DEFAULT_GRACE,
            bastion_user: String::from("bastion"),
            bastion_port: DEFAULT_BASTION_PORT,
        }
    }
}

/// Handle returned to callers once a tunnel is listening.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TunnelHandle {
    /// Registered session identifier.
    pub id: Uuid,
    /// Loopback endpoint accepting connections.
    pub endpoint: Endpoint,
}

/// Opens and closes supervised tunnels through the registry.
#[derive(Clone, Debug)]
pub struct TunnelManager<P: ProxySpawner> {
    spawner: P,
    registry: Arc<TunnelRegistry>,
    settings: TunnelSettings,
}

impl<P: ProxySpawner> TunnelManager<P> {
    /// Creates a manager over the given spawner and registry.
    #[must_use]
    pub const fn new(spawner: P, registry: Arc<TunnelRegistry>, settings: TunnelSettings) -> Self {
        Self {
            spawner,
            registry,
            settings,
        }
    }

    /// Returns the registry this manager registers sessions in.
    #[must_use]
    pub const fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Opens a tunnel to `target` through `host` and registers the session.
    ///
    /// The endpoint is handed back only once the loopback port was observed
    /// accepting connections, so callers are never given a port that may not
    /// be ready.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Timeout`] when the proxy does not start
    /// listening in time (the subprocess is terminated first; a
    /// half-initialised proxy is never left running),
    /// [`TunnelError::OwnershipViolation`] when the subprocess is not owned
    /// by the caller, [`TunnelError::PortConflict`] when a concurrent open
    /// claimed the same port, and [`TunnelError::Spawn`] or
    /// [`TunnelError::PortsExhausted`] for setup failures.
    pub async fn open(
        &self,
        target: &RemoteTarget,
        host: &BastionHost,
    ) -> Result<TunnelHandle, TunnelError> {
        let Some(bastion_ip) = host.public_ip else {
            return Err(TunnelError::Spawn {
                message: format!("bastion {} has no dialable address", host.id),
            });
        };

        let local_port = self.draw_port()?;
        let spec = ForwardSpec {
            local_port,
            target_host: target.private_ip,
            target_port: target.ssh_port,
            bastion_host: bastion_ip,
            bastion_port: self.settings.bastion_port,
            bastion_user: self.settings.bastion_user.clone(),
        };

        let mut child = self.spawner.spawn(&spec)?;
        debug!(port = local_port, bastion = %host.id, "tunnel proxy spawned");

        if let Err(err) = verify_child_ownership(&child) {
            terminate_child(child, self.settings.grace).await;
            return Err(err);
        }

        if let Err(err) = self.wait_listening(local_port, &mut child).await {
            terminate_child(child, self.settings.grace).await;
            return Err(err);
        }

        let owner = nix::unistd::Uid::effective().to_string();
        let mut session =
            TunnelSession::new(local_port, &target.id, &host.id, owner, Some(child));
        session.mark_listening();
        let id = self.registry.register(session)?;

        Ok(TunnelHandle {
            id,
            endpoint: Endpoint::loopback(local_port),
        })
    }

    /// Closes a previously opened tunnel. Idempotent.
    pub async fn close(&self, id: Uuid) {
        self.registry.close_session(id, self.settings.grace).await;
    }

    /// Draws a random port from the configured range that no live session
    /// holds. Random selection keeps local ports unpredictable.
    fn draw_port(&self) -> Result<u16, TunnelError> {
        let mut rng = rand::rng();
        for _ in 0..PORT_DRAW_ATTEMPTS {
            let port = rng.random_range(self.settings.port_range.clone());
            if !self.registry.port_in_use(port) {
                return Ok(port);
            }
        }
        Err(TunnelError::PortsExhausted {
            attempts: PORT_DRAW_ATTEMPTS,
        })
    }

    async fn wait_listening(&self, port: u16, child: &mut Child) -> Result<(), TunnelError> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            if matches!(child.try_wait(), Ok(Some(_))) {
                // Exited before ever listening; same failure class as a hang.
                return Err(self.timeout_error(port));
            }

            if TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_ok() {
                return Ok(());
            }

            if Instant::now() > deadline {
                return Err(self.timeout_error(port));
            }

            sleep(self.settings.poll_interval).await;
        }
    }

    const fn timeout_error(&self, port: u16) -> TunnelError {
        TunnelError::Timeout {
            port,
            timeout_secs: self.settings.ready_timeout.as_secs(),
        }
    }
}

/// Terminates a proxy subprocess: SIGTERM, a bounded wait, then SIGKILL.
///
/// Every teardown trigger converges here, whether it came from an explicit
/// close, shutdown draining, a readiness timeout, or an ownership rejection.
pub(crate) async fn terminate_child(mut child: Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already exited; reap it.
        child.wait().await.ok();
        return;
    };

    if let Ok(raw) = i32::try_from(pid) {
        kill(Pid::from_raw(raw), Signal::SIGTERM).ok();
    }

    if timeout(grace, child.wait()).await.is_err() {
        debug!(pid, "tunnel proxy ignored SIGTERM; force-killing");
        child.start_kill().ok();
        child.wait().await.ok();
    }
}

/// Compares the subprocess owner against the caller's effective uid.
///
/// A process that vanished before the check is left to the readiness poll.
fn verify_child_ownership(child: &Child) -> Result<(), TunnelError> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    child_owner_uid(pid).map_or(Ok(()), |actual| {
        let expected = nix::unistd::Uid::effective().as_raw();
        if actual == expected {
            Ok(())
        } else {
            Err(TunnelError::OwnershipViolation { expected, actual })
        }
    })
}

#[cfg(target_os = "linux")]
fn child_owner_uid(pid: u32) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(format!("/proc/{pid}"))
        .ok()
        .map(|metadata| metadata.uid())
}

#[cfg(not(target_os = "linux"))]
fn child_owner_uid(_pid: u32) -> Option<u32> {
    None
}
