//! Bastion discovery over the cloud CLI.
//!
//! Candidates are constructed fresh on every query and never cached: gateway
//! state can change between invocations, and a stale answer must not pick a
//! host that has since degraded.

use std::ffi::OsString;
use std::net::IpAddr;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::exec::{CloudQueryConfig, CommandOutput, CommandRunner, ExecError, ProcessCommandRunner};
use crate::target::NetworkScope;

/// Operational state of a candidate bastion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BastionState {
    /// Still being brought up; not yet usable.
    Provisioning,
    /// Fully operational.
    Ready,
    /// Reported unhealthy by the provider.
    Degraded,
    /// Broken or in an unrecognised state.
    Failed,
}

impl From<&str> for BastionState {
    fn from(value: &str) -> Self {
        match value {
            "running" => Self::Ready,
            "allocating" | "configuring" | "stopped" => Self::Provisioning,
            "degraded" => Self::Degraded,
            _ => Self::Failed,
        }
    }
}

/// Capability tier of a candidate bastion.
///
/// Only `Standard` gateways support native tunnelling; everything the
/// provider reports that is not recognisably standard is treated as `Basic`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BastionTier {
    /// No tunnelling support.
    Basic,
    /// Supports native tunnelling.
    Standard,
}

impl From<&str> for BastionTier {
    fn from(value: &str) -> Self {
        match value {
            "standard" => Self::Standard,
            _ => Self::Basic,
        }
    }
}

/// A discovered jump host snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BastionHost {
    /// Provider gateway identifier.
    pub id: String,
    /// Human readable gateway name.
    pub name: String,
    /// Operational state at discovery time.
    pub state: BastionState,
    /// Capability tier.
    pub tier: BastionTier,
    /// Private networks the gateway is attached to.
    pub networks: Vec<NetworkScope>,
    /// Public address the SSH bastion listens on, when attached.
    pub public_ip: Option<IpAddr>,
}

impl BastionHost {
    /// Returns `true` when the host may carry tunnels at all: `Ready` state,
    /// `Standard` tier, and a dialable public address.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.state, BastionState::Ready)
            && matches!(self.tier, BastionTier::Standard)
            && self.public_ip.is_some()
    }

    /// Returns `true` when the host is attached to the given network scope.
    #[must_use]
    pub fn serves(&self, scope: &NetworkScope) -> bool {
        self.networks.iter().any(|network| network == scope)
    }
}

/// Errors raised while discovering bastions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DiscoveryError {
    /// Raised when the cloud CLI returns a non-zero exit status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when the gateway listing cannot be parsed.
    #[error("failed to parse gateway listing: {message}")]
    Parse {
        /// Parser error message.
        message: String,
    },
    /// Raised when command execution fails.
    #[error(transparent)]
    Runner(#[from] ExecError),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct GatewayRecord {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    tier: String,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    network_ids: Vec<String>,
}

impl From<GatewayRecord> for BastionHost {
    fn from(record: GatewayRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            state: BastionState::from(record.status.as_str()),
            tier: BastionTier::from(record.tier.as_str()),
            networks: record
                .network_ids
                .into_iter()
                .map(NetworkScope::new)
                .collect(),
            // An unparseable address is as unusable as a missing one.
            public_ip: record
                .public_ip
                .as_deref()
                .and_then(|raw| IpAddr::from_str(raw).ok()),
        }
    }
}

/// Discovers candidate bastions by shelling out to the cloud CLI.
#[derive(Clone, Debug)]
pub struct BastionDirectory<R: CommandRunner> {
    config: CloudQueryConfig,
    runner: R,
}

impl BastionDirectory<ProcessCommandRunner> {
    /// Creates a directory wired to the real process runner.
    #[must_use]
    pub const fn with_process_runner(config: CloudQueryConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> BastionDirectory<R> {
    /// Creates a directory using the provided configuration and runner.
    #[must_use]
    pub const fn new(config: CloudQueryConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Lists usable bastions attached to the given network scope.
    ///
    /// Hosts that are not `Ready`, not `Standard` tier, or have no dialable
    /// address are filtered out unconditionally; a broken host must never be
    /// selected even when it is the only candidate. Results are sorted by
    /// identifier so repeated resolutions are reproducible.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] when the CLI query fails or its output
    /// cannot be parsed. Callers decide policy; a failed query is not fatal
    /// by itself.
    pub fn discover(&self, scope: &NetworkScope) -> Result<Vec<BastionHost>, DiscoveryError> {
        let args = self.build_list_args(scope);
        let output = self.runner.run(&self.config.cloud_bin, &args)?;
        let stdout = self.checked_stdout(output)?;

        let records: Vec<GatewayRecord> =
            serde_json::from_str(&stdout).map_err(|err| DiscoveryError::Parse {
                message: err.to_string(),
            })?;

        let mut hosts: Vec<BastionHost> = records
            .into_iter()
            .map(BastionHost::from)
            .filter(BastionHost::is_usable)
            .collect();
        hosts.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        Ok(hosts)
    }

    fn build_list_args(&self, scope: &NetworkScope) -> Vec<OsString> {
        vec![
            OsString::from("gateway"),
            OsString::from("list"),
            OsString::from(format!("network-id={scope}")),
            OsString::from(format!("project-id={}", self.config.project_id)),
            OsString::from("-o"),
            OsString::from("json"),
        ]
    }

    fn checked_stdout(&self, output: CommandOutput) -> Result<String, DiscoveryError> {
        if output.is_success() {
            return Ok(output.stdout);
        }

        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(DiscoveryError::CommandFailure {
            program: self.config.cloud_bin.clone(),
            status: output.code,
            status_text,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{GatewayFixture, ScriptedRunner, json_gateways};
    use rstest::rstest;

    fn directory(runner: ScriptedRunner) -> BastionDirectory<ScriptedRunner> {
        let config =
            CloudQueryConfig::new("scw", "proj-1").expect("query config should validate");
        BastionDirectory::new(config, runner)
    }

    fn fixture(id: &str, status: &str, tier: &str) -> GatewayFixture {
        GatewayFixture {
            id: id.to_owned(),
            name: format!("gw-{id}"),
            status: status.to_owned(),
            tier: tier.to_owned(),
            public_ip: Some(String::from("51.15.0.1")),
            network_ids: vec![String::from("net-a")],
        }
    }

    #[rstest]
    #[case::provisioning("allocating")]
    #[case::configuring("configuring")]
    #[case::stopped("stopped")]
    #[case::degraded("degraded")]
    #[case::unknown("rebooting")]
    fn discover_filters_non_ready_states(#[case] status: &str) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), json_gateways(&[fixture("a", status, "standard")]), "");
        let hosts = directory(runner)
            .discover(&NetworkScope::new("net-a"))
            .expect("discovery should succeed");
        assert!(hosts.is_empty(), "{status} host must never be selected");
    }

    #[test]
    fn discover_filters_basic_tier() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), json_gateways(&[fixture("a", "running", "basic")]), "");
        let hosts = directory(runner)
            .discover(&NetworkScope::new("net-a"))
            .expect("discovery should succeed");
        assert!(hosts.is_empty(), "basic tier must never be selected");
    }

    #[test]
    fn discover_filters_hosts_without_address() {
        let runner = ScriptedRunner::new();
        let mut addressless = fixture("a", "running", "standard");
        addressless.public_ip = None;
        runner.push_output(Some(0), json_gateways(&[addressless]), "");
        let hosts = directory(runner)
            .discover(&NetworkScope::new("net-a"))
            .expect("discovery should succeed");
        assert!(hosts.is_empty(), "addressless host must never be selected");
    }

    #[test]
    fn discover_sorts_candidates_by_identifier() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            json_gateways(&[
                fixture("gw-charlie", "running", "standard"),
                fixture("gw-alpha", "running", "standard"),
                fixture("gw-bravo", "running", "standard"),
            ]),
            "",
        );
        let hosts = directory(runner)
            .discover(&NetworkScope::new("net-a"))
            .expect("discovery should succeed");
        let ids: Vec<&str> = hosts.iter().map(|host| host.id.as_str()).collect();
        assert_eq!(ids, ["gw-alpha", "gw-bravo", "gw-charlie"]);
    }

    #[test]
    fn discover_surfaces_command_failure() {
        let runner = ScriptedRunner::new();
        runner.push_failure(9);
        let err = directory(runner)
            .discover(&NetworkScope::new("net-a"))
            .expect_err("non-zero exit should fail");
        assert!(
            matches!(err, DiscoveryError::CommandFailure { status: Some(9), .. }),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn discover_scopes_query_to_network_and_project() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "[]", "");
        let dir = directory(runner.clone());
        dir.discover(&NetworkScope::new("net-a"))
            .expect("discovery should succeed");

        let invocations = runner.invocations();
        let Some(call) = invocations.first() else {
            panic!("discovery should invoke the cloud CLI");
        };
        let rendered = call.command_string();
        assert!(rendered.contains("network-id=net-a"), "got: {rendered}");
        assert!(rendered.contains("project-id=proj-1"), "got: {rendered}");
    }

    #[test]
    fn serves_matches_attached_networks_only() {
        let raw = json_gateways(&[fixture("a", "running", "standard")]);
        let record = serde_json::from_str::<Vec<GatewayRecord>>(&raw)
            .expect("fixture should deserialise")
            .into_iter()
            .next()
            .expect("one record");
        let host = BastionHost::from(record);
        assert!(host.serves(&NetworkScope::new("net-a")));
        assert!(!host.serves(&NetworkScope::new("net-b")));
    }
}
