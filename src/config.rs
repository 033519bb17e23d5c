//! Configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::exec::CloudQueryConfig;
use crate::route::ResolverSettings;
use crate::tunnel::{EPHEMERAL_PORT_RANGE, SshOptions, TunnelSettings};

/// Routing configuration derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "MIST")]
pub struct MistConfig {
    /// Path to the cloud CLI used for inventory, gateway, and credential
    /// queries.
    #[ortho_config(default = "scw".to_owned())]
    pub cloud_bin: String,
    /// Project identifier scoping every cloud query. This value is required.
    pub project_id: String,
    /// SSH client binary used to spawn tunnel subprocesses.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// User account presented to the bastion.
    #[ortho_config(default = "bastion".to_owned())]
    pub bastion_user: String,
    /// TCP port the bastion's SSH endpoint listens on.
    #[ortho_config(default = 61000)]
    pub bastion_port: u16,
    /// Identity file passed to the SSH client, when set.
    pub ssh_identity_file: Option<String>,
    /// Known-hosts file override; empty keeps the client default.
    #[ortho_config(default = String::new())]
    pub ssh_known_hosts_file: String,
    /// Minimum remaining credential validity, in seconds, before a tunnel
    /// may open.
    #[ortho_config(default = 300)]
    pub credential_margin_secs: u64,
    /// Deadline, in seconds, for a tunnel to start listening.
    #[ortho_config(default = 10)]
    pub tunnel_ready_timeout_secs: u64,
    /// Grace period, in seconds, between SIGTERM and SIGKILL at teardown.
    #[ortho_config(default = 5)]
    pub tunnel_grace_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

impl MistConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [{}] in mist.toml",
                metadata.description, metadata.env_var, metadata.toml_key, metadata.section
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("mist")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.project_id,
            &FieldMetadata::new("project ID", "MIST_PROJECT_ID", "project_id", "routing"),
        )?;
        Self::require_field(
            &self.cloud_bin,
            &FieldMetadata::new("cloud CLI binary", "MIST_CLOUD_BIN", "cloud_bin", "routing"),
        )?;
        Self::require_field(
            &self.ssh_bin,
            &FieldMetadata::new("SSH client binary", "MIST_SSH_BIN", "ssh_bin", "routing"),
        )?;
        Self::require_field(
            &self.bastion_user,
            &FieldMetadata::new(
                "bastion user",
                "MIST_BASTION_USER",
                "bastion_user",
                "routing",
            ),
        )?;
        Ok(())
    }

    /// Builds the cloud query configuration shared by the CLI-backed
    /// collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn cloud_query(&self) -> Result<CloudQueryConfig, ConfigError> {
        self.validate()?;
        CloudQueryConfig::new(&self.cloud_bin, &self.project_id)
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the minimum credential validity margin.
    #[must_use]
    pub const fn credential_margin(&self) -> Duration {
        Duration::from_secs(self.credential_margin_secs)
    }

    /// Returns the teardown grace period.
    #[must_use]
    pub const fn tunnel_grace(&self) -> Duration {
        Duration::from_secs(self.tunnel_grace_secs)
    }

    /// Builds resolver settings from the configured margins.
    #[must_use]
    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            credential_margin: self.credential_margin(),
            ..ResolverSettings::default()
        }
    }

    /// Builds tunnel settings from the configured timeouts.
    #[must_use]
    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            port_range: EPHEMERAL_PORT_RANGE,
            ready_timeout: Duration::from_secs(self.tunnel_ready_timeout_secs),
            grace: self.tunnel_grace(),
            bastion_user: self.bastion_user.clone(),
            bastion_port: self.bastion_port,
            ..TunnelSettings::default()
        }
    }

    /// Builds SSH client options for the proxy spawner.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            identity_file: self.ssh_identity_file.clone(),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;

    fn base_config() -> MistConfig {
        MistConfig {
            cloud_bin: String::from("scw"),
            project_id: String::from("proj-1"),
            ssh_bin: String::from("ssh"),
            bastion_user: String::from("bastion"),
            bastion_port: 61000,
            ssh_identity_file: None,
            ssh_known_hosts_file: String::new(),
            credential_margin_secs: 300,
            tunnel_ready_timeout_secs: 10,
            tunnel_grace_secs: 5,
        }
    }

    #[test]
    fn validate_accepts_complete_configuration() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_points_at_the_missing_field() {
        let cfg = MistConfig {
            project_id: String::from("  "),
            ..base_config()
        };
        let err = cfg.validate().expect_err("blank project id should fail");
        let ConfigError::MissingField(message) = err else {
            panic!("expected MissingField");
        };
        assert!(message.contains("MIST_PROJECT_ID"), "got: {message}");
    }

    #[test]
    fn tunnel_settings_carry_the_configured_knobs() {
        let cfg = MistConfig {
            tunnel_ready_timeout_secs: 3,
            tunnel_grace_secs: 2,
            bastion_port: 2222,
            ..base_config()
        };
        let settings = cfg.tunnel_settings();
        assert_eq!(settings.ready_timeout, Duration::from_secs(3));
        assert_eq!(settings.grace, Duration::from_secs(2));
        assert_eq!(settings.bastion_port, 2222);
    }

    #[tokio::test]
    async fn load_without_cli_args_reads_environment() {
        let _guard = EnvGuard::set_vars(&[
            ("MIST_PROJECT_ID", "proj-env"),
            ("MIST_CLOUD_BIN", "cloudctl"),
        ])
        .await;

        let cfg = MistConfig::load_without_cli_args().expect("load should succeed");
        assert_eq!(cfg.project_id, "proj-env");
        assert_eq!(cfg.cloud_bin, "cloudctl");
        assert_eq!(cfg.bastion_port, 61000, "defaults apply when unset");
    }
}
