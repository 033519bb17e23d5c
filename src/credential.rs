//! Credential freshness checks gating tunnel creation.
//!
//! Freshness is re-queried at the point of use rather than cached: tunnel
//! setup can be preceded by arbitrarily long user think-time, so an earlier
//! answer proves nothing about the current one.

use std::ffi::OsString;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::exec::{CommandRunner, ExecError, ProcessCommandRunner};

/// Snapshot of the delegated credential's validity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CredentialReport {
    /// Identity the credential is delegated to.
    pub principal: String,
    /// Remaining validity; `None` means the credential does not expire.
    pub expires_in: Option<Duration>,
}

/// Errors raised while checking credential freshness.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AuthError {
    /// Raised when the remaining validity is below the required margin.
    #[error(
        "credential expires in {remaining_secs}s but {required_secs}s are required; re-authenticate and retry"
    )]
    Expiring {
        /// Seconds of validity left on the credential.
        remaining_secs: u64,
        /// Seconds of validity the caller requires.
        required_secs: u64,
    },
    /// Raised when no credential is active at all.
    #[error("no active cloud credential; run the provider login flow first")]
    NotAuthenticated,
    /// Raised when the status query fails or returns unusable output.
    #[error("credential status query failed: {message}")]
    Query {
        /// Human readable description of the failure.
        message: String,
    },
}

impl From<ExecError> for AuthError {
    fn from(value: ExecError) -> Self {
        Self::Query {
            message: value.to_string(),
        }
    }
}

/// Source of credential status snapshots.
pub trait CredentialStatus {
    /// Queries the current credential status.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotAuthenticated`] when no credential is active
    /// and [`AuthError::Query`] when the underlying query fails.
    fn status(&self) -> Result<CredentialReport, AuthError>;
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct StatusPayload {
    #[serde(default)]
    principal: Option<String>,
    #[serde(default)]
    expires_in_seconds: Option<u64>,
}

/// Queries credential status through the cloud CLI (`auth status -o json`).
#[derive(Clone, Debug)]
pub struct CliCredentialStatus<R: CommandRunner> {
    cloud_bin: String,
    runner: R,
}

impl CliCredentialStatus<ProcessCommandRunner> {
    /// Creates a status source wired to the real process runner.
    #[must_use]
    pub const fn with_process_runner(cloud_bin: String) -> Self {
        Self::new(cloud_bin, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> CliCredentialStatus<R> {
    /// Creates a status source using the provided runner.
    #[must_use]
    pub const fn new(cloud_bin: String, runner: R) -> Self {
        Self { cloud_bin, runner }
    }
}

impl<R: CommandRunner> CredentialStatus for CliCredentialStatus<R> {
    fn status(&self) -> Result<CredentialReport, AuthError> {
        let args = vec![
            OsString::from("auth"),
            OsString::from("status"),
            OsString::from("-o"),
            OsString::from("json"),
        ];
        let output = self.runner.run(&self.cloud_bin, &args)?;
        if !output.is_success() {
            let status_text = output
                .code
                .map_or_else(|| String::from("unknown"), |code| code.to_string());
            return Err(AuthError::Query {
                message: format!(
                    "{} exited with status {status_text}: {}",
                    self.cloud_bin, output.stderr
                ),
            });
        }

        let payload: StatusPayload =
            serde_json::from_str(&output.stdout).map_err(|err| AuthError::Query {
                message: err.to_string(),
            })?;

        let Some(principal) = payload.principal.filter(|name| !name.trim().is_empty()) else {
            return Err(AuthError::NotAuthenticated);
        };

        Ok(CredentialReport {
            principal,
            expires_in: payload.expires_in_seconds.map(Duration::from_secs),
        })
    }
}

/// Gate that refuses tunnel work when credential validity is thin.
#[derive(Clone, Debug)]
pub struct CredentialGuard<S: CredentialStatus> {
    source: S,
}

impl<S: CredentialStatus> CredentialGuard<S> {
    /// Creates a guard over the given status source.
    #[must_use]
    pub const fn new(source: S) -> Self {
        Self { source }
    }

    /// Verifies the credential retains at least `margin` of validity.
    ///
    /// The status source is queried on every call; results are never cached.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Expiring`] when remaining validity is below
    /// `margin`, or propagates the source's own error.
    pub fn ensure_fresh(&self, margin: Duration) -> Result<(), AuthError> {
        let report = self.source.status()?;
        let Some(remaining) = report.expires_in else {
            return Ok(());
        };
        if remaining < margin {
            return Err(AuthError::Expiring {
                remaining_secs: remaining.as_secs(),
                required_secs: margin.as_secs(),
            });
        }
        Ok(())
    }
}
