//! Command execution boundary shared by the cloud CLI query modules.

use std::ffi::OsString;
use std::process::Command;

use thiserror::Error;

/// Errors raised while executing an external command.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when the program cannot be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Program that could not be started.
        program: String,
        /// Operating system error message.
        message: String,
    },
    /// Raised when a query configuration is missing a required value.
    #[error("missing {field}")]
    InvalidConfig {
        /// Name of the missing or invalid field.
        field: String,
    },
}

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| ExecError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Configuration shared by modules that query the cloud CLI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloudQueryConfig {
    /// Path to the cloud CLI binary.
    pub cloud_bin: String,
    /// Project identifier scoping every query.
    pub project_id: String,
}

impl CloudQueryConfig {
    /// Constructs a query configuration, trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::InvalidConfig`] when any required field is blank.
    pub fn new(
        cloud_bin: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Result<Self, ExecError> {
        let trimmed_cloud_bin = cloud_bin.into().trim().to_owned();
        let trimmed_project_id = project_id.into().trim().to_owned();
        if trimmed_cloud_bin.is_empty() {
            return Err(ExecError::InvalidConfig {
                field: String::from("cloud_bin"),
            });
        }
        if trimmed_project_id.is_empty() {
            return Err(ExecError::InvalidConfig {
                field: String::from("project_id"),
            });
        }
        Ok(Self {
            cloud_bin: trimmed_cloud_bin,
            project_id: trimmed_project_id,
        })
    }
}
