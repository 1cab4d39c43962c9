//! Configuration loading via `ortho-config`.
//!
//! Three structs share one discovery chain (`DRYDOCK_CONFIG_PATH`, then
//! `drydock.toml` in the usual places): [`DrydockConfig`] for the tool
//! itself, and one struct per cloud backend. Backend configuration is only
//! loaded when that backend is selected, so a missing Sprites token does not
//! break Scaleway users.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::remote::ssh::{HostKeyPolicy, SshSettings};
use crate::util::{expand_tilde, home_dir};

const APP_NAME: &str = "drydock";
const DEFAULT_SESSIONS_FILE: &str = ".local/state/drydock/sessions.toml";
const DEFAULT_CONSOLE_INCLUDE: &str = ".ssh/drydock/config";

/// Tool-wide settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "DRYDOCK",
    discovery(
        app_name = "drydock",
        env_var = "DRYDOCK_CONFIG_PATH",
        config_file_name = "drydock.toml",
        dotfile_name = ".drydock.toml",
        project_file_name = "drydock.toml"
    )
)]
pub struct DrydockConfig {
    /// Provider used when `create` is not given one.
    #[ortho_config(default = "scaleway".to_owned())]
    pub default_provider: String,
    /// Login user for SSH sessions.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub ssh_user: String,
    /// SSH port on provisioned VMs.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Fingerprint (`SHA256:...`) of the identity to authenticate with.
    /// When unset, the first identity found is used.
    pub identity_fingerprint: Option<String>,
    /// Comma-separated private key files consulted after every agent.
    pub identity_files: Option<String>,
    /// Comma-separated host key fingerprints. When unset any host key is
    /// accepted.
    pub pinned_host_keys: Option<String>,
    /// Seconds to wait for a new VM to become reachable.
    #[ortho_config(default = 300)]
    pub wait_timeout_secs: u64,
    /// Seconds between readiness polls.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Seconds allowed for connecting and authenticating.
    #[ortho_config(default = 15)]
    pub connect_timeout_secs: u64,
    /// Session records file. Defaults to
    /// `~/.local/state/drydock/sessions.toml`.
    pub sessions_file: Option<String>,
    /// SSH client include file holding console host aliases. Defaults to
    /// `~/.ssh/drydock/config`.
    pub console_include: Option<String>,
}

impl Default for DrydockConfig {
    fn default() -> Self {
        Self {
            default_provider: String::from("scaleway"),
            ssh_user: String::from("ubuntu"),
            ssh_port: 22,
            identity_fingerprint: None,
            identity_files: None,
            pinned_host_keys: None,
            wait_timeout_secs: 300,
            poll_interval_secs: 5,
            connect_timeout_secs: 15,
            sessions_file: None,
            console_include: None,
        }
    }
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

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in drydock.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

const fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field: metadata.toml_key,
            env_var: metadata.env_var,
            reason: "must be greater than zero",
        });
    }
    Ok(())
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect()
}

fn path_or_home_default(value: Option<&str>, default: &str) -> Utf8PathBuf {
    match value.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => expand_tilde(raw),
        None => home_dir().map_or_else(|| Utf8PathBuf::from(default), |home| home.join(default)),
    }
}

fn load_quietly<T: OrthoConfig>() -> Result<T, ConfigError> {
    T::load_from_iter([OsString::from(APP_NAME)]).map_err(|err| ConfigError::Parse(err.to_string()))
}

impl DrydockConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        load_quietly()
    }

    /// Checks required values and numeric bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] or [`ConfigError::Invalid`]
    /// naming the variable to fix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.default_provider,
            &FieldMetadata::new(
                "default provider",
                "DRYDOCK_DEFAULT_PROVIDER",
                "default_provider",
                "drydock",
            ),
        )?;
        require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "DRYDOCK_SSH_USER", "ssh_user", "drydock"),
        )?;
        require_positive(
            u64::from(self.ssh_port),
            &FieldMetadata::new("SSH port", "DRYDOCK_SSH_PORT", "ssh_port", "drydock"),
        )?;
        require_positive(
            self.wait_timeout_secs,
            &FieldMetadata::new(
                "wait timeout",
                "DRYDOCK_WAIT_TIMEOUT_SECS",
                "wait_timeout_secs",
                "drydock",
            ),
        )?;
        require_positive(
            self.poll_interval_secs,
            &FieldMetadata::new(
                "poll interval",
                "DRYDOCK_POLL_INTERVAL_SECS",
                "poll_interval_secs",
                "drydock",
            ),
        )?;
        require_positive(
            self.connect_timeout_secs,
            &FieldMetadata::new(
                "connect timeout",
                "DRYDOCK_CONNECT_TIMEOUT_SECS",
                "connect_timeout_secs",
                "drydock",
            ),
        )?;
        self.host_key_policy().map(|_| ())
    }

    /// Deadline for readiness polling.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Interval between readiness polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Bound on connecting and authenticating.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Identity fingerprint to request, when one is configured.
    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        self.identity_fingerprint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    }

    /// Configured key files with `~` expanded.
    #[must_use]
    pub fn identity_file_paths(&self) -> Vec<Utf8PathBuf> {
        split_list(self.identity_files.as_deref())
            .iter()
            .map(|raw| expand_tilde(raw))
            .collect()
    }

    /// Host key policy derived from `pinned_host_keys`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when an entry is not a SHA-256
    /// fingerprint.
    pub fn host_key_policy(&self) -> Result<HostKeyPolicy, ConfigError> {
        self.pinned_host_keys
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|_| ConfigError::Invalid {
                field: "pinned_host_keys",
                env_var: "DRYDOCK_PINNED_HOST_KEYS",
                reason: "entries must be SHA256:... fingerprints",
            })
    }

    /// SSH client settings for sessions opened by this tool.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the host key policy is invalid.
    pub fn ssh_settings(&self) -> Result<SshSettings, ConfigError> {
        Ok(SshSettings {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            connect_timeout: self.connect_timeout(),
            host_keys: self.host_key_policy()?,
        })
    }

    /// Location of the session records file.
    #[must_use]
    pub fn sessions_path(&self) -> Utf8PathBuf {
        path_or_home_default(self.sessions_file.as_deref(), DEFAULT_SESSIONS_FILE)
    }

    /// Location of the console alias include file.
    #[must_use]
    pub fn console_include_path(&self) -> Utf8PathBuf {
        path_or_home_default(self.console_include.as_deref(), DEFAULT_CONSOLE_INCLUDE)
    }
}

/// Scaleway specific configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCW",
    discovery(
        app_name = "drydock",
        env_var = "DRYDOCK_CONFIG_PATH",
        config_file_name = "drydock.toml",
        dotfile_name = ".drydock.toml",
        project_file_name = "drydock.toml"
    )
)]
pub struct ScalewayConfig {
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for new instances. Defaults to `DEV1-S`.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Human-friendly image label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        load_quietly()
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.secret_key,
                FieldMetadata::new(
                    "Scaleway API secret key",
                    "SCW_SECRET_KEY",
                    "secret_key",
                    "scaleway",
                ),
            ),
            (
                &self.default_project_id,
                FieldMetadata::new(
                    "Scaleway project ID",
                    "SCW_DEFAULT_PROJECT_ID",
                    "default_project_id",
                    "scaleway",
                ),
            ),
            (
                &self.default_image,
                FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
            ),
            (
                &self.default_instance_type,
                FieldMetadata::new(
                    "instance type",
                    "SCW_DEFAULT_INSTANCE_TYPE",
                    "default_instance_type",
                    "scaleway",
                ),
            ),
            (
                &self.default_zone,
                FieldMetadata::new(
                    "availability zone",
                    "SCW_DEFAULT_ZONE",
                    "default_zone",
                    "scaleway",
                ),
            ),
            (
                &self.default_architecture,
                FieldMetadata::new(
                    "CPU architecture",
                    "SCW_DEFAULT_ARCHITECTURE",
                    "default_architecture",
                    "scaleway",
                ),
            ),
        ];
        for (value, metadata) in &required {
            require_field(value, metadata)?;
        }
        Ok(())
    }
}

/// Sprites API settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SPRITES",
    discovery(
        app_name = "drydock",
        env_var = "DRYDOCK_CONFIG_PATH",
        config_file_name = "drydock.toml",
        dotfile_name = ".drydock.toml",
        project_file_name = "drydock.toml"
    )
)]
pub struct SpritesConfig {
    /// API token sent as a bearer token. Required.
    pub token: String,
    /// REST API base URL.
    #[ortho_config(default = "https://api.sprites.dev/v1".to_owned())]
    pub api_base: String,
    /// Erase the shell prompt echoed before the first control frame of an
    /// interactive session.
    #[ortho_config(default = true)]
    pub clear_first_control_line: bool,
}

impl SpritesConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        load_quietly()
    }

    /// Checks that the token and base URL are present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the variable to set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.token,
            &FieldMetadata::new("Sprites API token", "SPRITES_TOKEN", "token", "sprites"),
        )?;
        require_field(
            &self.api_base,
            &FieldMetadata::new("Sprites API URL", "SPRITES_API_BASE", "api_base", "sprites"),
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid {field}: {reason} (set {env_var} or {field} in drydock.toml)")]
    Invalid {
        /// TOML key of the field.
        field: &'static str,
        /// Environment variable overriding the field.
        env_var: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
