//! Instance lookup against the provisioning inventory.
//!
//! The inventory is an external collaborator queried through the cloud CLI;
//! this module only translates its listing into a [`RemoteTarget`] snapshot.

use std::ffi::OsString;
use std::net::IpAddr;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::exec::{CloudQueryConfig, CommandOutput, CommandRunner, ExecError, ProcessCommandRunner};
use crate::target::{DEFAULT_SSH_PORT, NetworkScope, RemoteTarget};

/// Errors raised while resolving an instance name.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InventoryError {
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
    /// Raised when the instance listing cannot be parsed.
    #[error("failed to parse instance listing: {message}")]
    Parse {
        /// Parser error message.
        message: String,
    },
    /// Raised when no instance matches the requested name.
    #[error("no instance named '{name}' found in the project")]
    NotFound {
        /// Name that was looked up.
        name: String,
    },
    /// Raised when an instance reports no usable private address.
    #[error("instance '{name}' reports no usable private address: {message}")]
    Address {
        /// Instance name.
        name: String,
        /// Description of what was wrong with the reported address.
        message: String,
    },
    /// Raised when command execution fails.
    #[error(transparent)]
    Runner(#[from] ExecError),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct InstanceRecord {
    id: String,
    name: String,
    #[serde(default)]
    private_ip: Option<String>,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    network_id: Option<String>,
}

/// Resolves instance names to [`RemoteTarget`] snapshots via the cloud CLI.
#[derive(Clone, Debug)]
pub struct InstanceInventory<R: CommandRunner> {
    config: CloudQueryConfig,
    runner: R,
}

impl InstanceInventory<ProcessCommandRunner> {
    /// Creates an inventory wired to the real process runner.
    #[must_use]
    pub const fn with_process_runner(config: CloudQueryConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> InstanceInventory<R> {
    /// Creates an inventory using the provided configuration and runner.
    #[must_use]
    pub const fn new(config: CloudQueryConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Looks up an instance by exact name.
    ///
    /// The provider listing matches by prefix, so the result is filtered to
    /// an exact name match before conversion.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::NotFound`] when no instance matches,
    /// [`InventoryError::Address`] when the instance has no parseable private
    /// address, and [`InventoryError::CommandFailure`] /
    /// [`InventoryError::Parse`] for query failures.
    pub fn lookup(&self, name: &str) -> Result<RemoteTarget, InventoryError> {
        let args = self.build_list_args(name);
        let output = self.runner.run(&self.config.cloud_bin, &args)?;
        let stdout = self.checked_stdout(output)?;

        let records: Vec<InstanceRecord> =
            serde_json::from_str(&stdout).map_err(|err| InventoryError::Parse {
                message: err.to_string(),
            })?;

        let record = records
            .into_iter()
            .find(|candidate| candidate.name == name)
            .ok_or_else(|| InventoryError::NotFound {
                name: name.to_owned(),
            })?;

        Self::into_target(record)
    }

    fn into_target(record: InstanceRecord) -> Result<RemoteTarget, InventoryError> {
        let Some(raw_private) = record.private_ip.as_deref() else {
            return Err(InventoryError::Address {
                name: record.name,
                message: String::from("no private address reported"),
            });
        };
        let private_ip = IpAddr::from_str(raw_private).map_err(|err| InventoryError::Address {
            name: record.name.clone(),
            message: err.to_string(),
        })?;

        // A garbled public address downgrades the target to private-only
        // rather than failing the lookup.
        let public_ip = record
            .public_ip
            .as_deref()
            .and_then(|raw| IpAddr::from_str(raw).ok());

        Ok(RemoteTarget {
            id: record.id,
            name: record.name,
            private_ip,
            public_ip,
            network: record.network_id.map(NetworkScope::new),
            ssh_port: DEFAULT_SSH_PORT,
        })
    }

    fn build_list_args(&self, name: &str) -> Vec<OsString> {
        vec![
            OsString::from("instance"),
            OsString::from("server"),
            OsString::from("list"),
            OsString::from(format!("name={name}")),
            OsString::from(format!("project-id={}", self.config.project_id)),
            OsString::from("-o"),
            OsString::from("json"),
        ]
    }

    fn checked_stdout(&self, output: CommandOutput) -> Result<String, InventoryError> {
        if output.is_success() {
            return Ok(output.stdout);
        }

        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(InventoryError::CommandFailure {
            program: self.config.cloud_bin.clone(),
            status: output.code,
            status_text,
            stderr: output.stderr,
        })
    }
}
