//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::rc::Rc;

use camino::Utf8PathBuf;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::affinity::{AffinityHints, AffinityStoreError};
use crate::audit::{AuditEvent, AuditSink};
use crate::credential::{AuthError, CredentialReport, CredentialStatus};
use crate::exec::{CommandOutput, CommandRunner, ExecError};
use crate::tunnel::{ForwardSpec, ProxySpawner, TunnelError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: String::from("simulated failure"),
        });
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| ExecError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Credential status source that replays a fixed answer.
#[derive(Clone, Debug)]
pub struct StaticCredentialStatus {
    answer: Result<CredentialReport, AuthError>,
}

impl StaticCredentialStatus {
    /// Builds a source reporting the given remaining validity in seconds.
    #[must_use]
    pub fn expiring_in(principal: &str, remaining_secs: u64) -> Self {
        Self {
            answer: Ok(CredentialReport {
                principal: principal.to_owned(),
                expires_in: Some(std::time::Duration::from_secs(remaining_secs)),
            }),
        }
    }

    /// Builds a source reporting a non-expiring credential.
    #[must_use]
    pub fn non_expiring(principal: &str) -> Self {
        Self {
            answer: Ok(CredentialReport {
                principal: principal.to_owned(),
                expires_in: None,
            }),
        }
    }

    /// Builds a source that fails with the given error.
    #[must_use]
    pub const fn failing(error: AuthError) -> Self {
        Self { answer: Err(error) }
    }
}

impl CredentialStatus for StaticCredentialStatus {
    fn status(&self) -> Result<CredentialReport, AuthError> {
        self.answer.clone()
    }
}

/// In-memory affinity hint store.
#[derive(Clone, Debug, Default)]
pub struct MemoryAffinity {
    hints: Rc<RefCell<HashMap<String, String>>>,
}

impl MemoryAffinity {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a hint.
    pub fn seed(&self, target_id: &str, bastion_id: &str) {
        self.hints
            .borrow_mut()
            .insert(target_id.to_owned(), bastion_id.to_owned());
    }

    /// Returns a snapshot of the stored hints.
    #[must_use]
    pub fn hints(&self) -> HashMap<String, String> {
        self.hints.borrow().clone()
    }
}

impl AffinityHints for MemoryAffinity {
    fn hint_for(&self, target_id: &str) -> Result<Option<String>, AffinityStoreError> {
        Ok(self.hints.borrow().get(target_id).cloned())
    }

    fn record(&self, target_id: &str, bastion_id: &str) -> Result<Utf8PathBuf, AffinityStoreError> {
        self.seed(target_id, bastion_id);
        Ok(Utf8PathBuf::from("memory"))
    }
}

/// Audit sink that captures events for assertions.
#[derive(Clone, Debug, Default)]
pub struct MemoryAuditSink {
    events: Rc<RefCell<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.borrow().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}

/// Proxy spawner double that launches an inert placeholder process.
///
/// The placeholder binds nothing itself; tests that need the readiness poll
/// to succeed hold their own listener on the expected port.
#[derive(Clone, Debug)]
pub struct InertProxySpawner {
    program: String,
    args: Vec<String>,
    specs: Rc<RefCell<Vec<ForwardSpec>>>,
    pids: Rc<RefCell<Vec<u32>>>,
}

impl Default for InertProxySpawner {
    fn default() -> Self {
        Self {
            program: String::from("sleep"),
            args: vec![String::from("60")],
            specs: Rc::default(),
            pids: Rc::default(),
        }
    }
}

impl InertProxySpawner {
    /// Creates a spawner running `sleep 60` placeholders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a spawner running an arbitrary placeholder command.
    #[must_use]
    pub fn with_command(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_owned(),
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
            specs: Rc::default(),
            pids: Rc::default(),
        }
    }

    /// Returns the forward specs the manager asked for.
    #[must_use]
    pub fn specs(&self) -> Vec<ForwardSpec> {
        self.specs.borrow().clone()
    }

    /// Returns the process ids of every placeholder spawned so far.
    #[must_use]
    pub fn pids(&self) -> Vec<u32> {
        self.pids.borrow().clone()
    }
}

impl ProxySpawner for InertProxySpawner {
    fn spawn(&self, spec: &ForwardSpec) -> Result<tokio::process::Child, TunnelError> {
        self.specs.borrow_mut().push(spec.clone());
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TunnelError::Spawn {
                message: err.to_string(),
            })?;
        if let Some(pid) = child.id() {
            self.pids.borrow_mut().push(pid);
        }
        Ok(child)
    }
}

/// Proxy spawner double for flows that must never reach a spawn.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnreachableSpawner;

impl ProxySpawner for UnreachableSpawner {
    /// # Panics
    ///
    /// Panics when invoked; that is the assertion.
    fn spawn(&self, spec: &ForwardSpec) -> Result<tokio::process::Child, TunnelError> {
        panic!("no subprocess spawn was expected, got {spec:?}");
    }
}

/// Gateway listing entry matching the cloud CLI's JSON shape.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct GatewayFixture {
    /// Gateway identifier.
    pub id: String,
    /// Gateway name.
    pub name: String,
    /// Provider state string.
    pub status: String,
    /// Provider tier string.
    pub tier: String,
    /// Public address, when attached.
    pub public_ip: Option<String>,
    /// Attached private networks.
    pub network_ids: Vec<String>,
}

impl GatewayFixture {
    /// Builds a usable `running`/`standard` gateway on `net-a`.
    #[must_use]
    pub fn usable(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: format!("gw-{id}"),
            status: String::from("running"),
            tier: String::from("standard"),
            public_ip: Some(String::from("51.15.0.1")),
            network_ids: vec![String::from("net-a")],
        }
    }
}

/// Produces a JSON payload matching `gateway list -o json`.
#[must_use]
pub fn json_gateways(gateways: &[GatewayFixture]) -> String {
    serde_json::to_string(gateways).unwrap_or_else(|err| panic!("serialise gateways: {err}"))
}

/// Instance listing entry matching the cloud CLI's JSON shape.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InstanceFixture {
    /// Instance identifier.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Private address.
    pub private_ip: Option<String>,
    /// Public address, when attached.
    pub public_ip: Option<String>,
    /// Private network membership.
    pub network_id: Option<String>,
}

/// Produces a JSON payload matching `instance server list -o json`.
#[must_use]
pub fn json_instances(instances: &[InstanceFixture]) -> String {
    serde_json::to_string(instances).unwrap_or_else(|err| panic!("serialise instances: {err}"))
}

/// Produces a JSON payload matching `auth status -o json`.
#[must_use]
pub fn json_auth_status(principal: Option<&str>, expires_in_seconds: Option<u64>) -> String {
    let payload = serde_json::json!({
        "principal": principal,
        "expires_in_seconds": expires_in_seconds,
    });
    payload.to_string()
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets a single environment variable while holding a global mutex.
    pub async fn set_var(key: &str, value: &str) -> Self {
        Self::set_vars(&[(key, value)]).await
    }

    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
