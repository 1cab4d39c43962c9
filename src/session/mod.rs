//! Local session records and their lifecycle.
//!
//! A [`Session`] correlates an operator-chosen name with one provisioned VM.
//! [`SessionManager`] drives provisioning, remote access and teardown;
//! [`reconcile`] keeps records in step with what providers report.

pub mod console;
mod manager;
pub mod reconcile;
pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::{ProviderError, RegistryError, RequestError, VmStatus};
use crate::remote::{CommandOutput, RemoteError};

pub use console::ConsoleRegistry;
pub use manager::{ManagerSettings, Provisioning, SessionListing, SessionManager};
pub use reconcile::{ProviderFailure, Reconciliation};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};

/// Local mirror of a VM's lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Owned by the background provisioning task, from before the VM
    /// exists until its post-boot steps have finished.
    Provisioning,
    /// The VM is booting, as reported by its provider.
    Starting,
    /// The VM is up and reachable.
    Running,
    /// The VM is shutting down or being deleted.
    Stopping,
    /// The VM is powered off or no longer listed by its provider.
    Stopped,
    /// Provisioning failed; see [`Session::failure`].
    Failed,
}

impl SessionStatus {
    /// Status a session takes when its VM reports `status`.
    #[must_use]
    pub const fn from_vm(status: VmStatus) -> Self {
        match status {
            VmStatus::Provisioning | VmStatus::Starting => Self::Starting,
            VmStatus::Running => Self::Running,
            VmStatus::Stopping | VmStatus::Deleting => Self::Stopping,
            VmStatus::Stopped => Self::Stopped,
            VmStatus::Failed => Self::Failed,
        }
    }

    /// Returns `true` for states in which the VM is expected to exist.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Lowercase label used in output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local record of one provisioned VM.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Session {
    /// Operator-chosen name; also the VM name.
    pub id: String,
    /// Last known lifecycle state.
    pub status: SessionStatus,
    /// Registry name of the provider that owns the VM.
    pub provider: String,
    /// Provider identifier of the VM, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    /// Address of the VM, once assigned.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    /// When the session was recorded.
    pub created_at: DateTime<Utc>,
    /// When the operator wants the VM gone, if ever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Why provisioning failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Session {
    /// New record in [`SessionStatus::Provisioning`] with no VM yet.
    #[must_use]
    pub fn provisioning(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Provisioning,
            provider: provider.into(),
            vm_id: None,
            address: String::new(),
            created_at: Utc::now(),
            expires_at: None,
            failure: None,
        }
    }

    /// Returns `true` once `now` is past the expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| now >= expiry)
    }
}

/// Errors raised by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Raised when the create request is invalid.
    #[error(transparent)]
    Request(#[from] RequestError),
    /// Raised when a session with the same name already exists.
    #[error("session '{0}' already exists; destroy it first or pick another name")]
    Duplicate(String),
    /// Raised when no session has the requested name.
    #[error("no session named '{0}'")]
    NotFound(String),
    /// Raised when the session has no VM to operate on yet.
    #[error("session '{id}' is {status}; it has no reachable VM")]
    NotReady {
        /// Session name.
        id: String,
        /// Current status.
        status: SessionStatus,
    },
    /// Raised when the session's provider cannot be resolved.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Raised when the provider fails.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Raised when the remote channel fails.
    #[error(transparent)]
    Remote(#[from] Box<RemoteError>),
    /// Raised when the session store fails.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when a post-boot command exits unsuccessfully.
    #[error("boot step '{step}' failed on '{id}' (exit code {code}): {stderr}", code = exit_code.map_or_else(|| String::from("none"), |code| code.to_string()))]
    BootStep {
        /// Session name.
        id: String,
        /// Which step failed.
        step: &'static str,
        /// Remote exit code, when one was reported.
        exit_code: Option<i32>,
        /// Remote standard error.
        stderr: String,
    },
    /// Raised when the console include file cannot be updated.
    #[error("failed to update console aliases: {0}")]
    Console(String),
}

impl SessionError {
    /// Output a remote command streamed before the channel failed, if any.
    #[must_use]
    pub fn partial_output(&self) -> Option<&CommandOutput> {
        match self {
            Self::Remote(err) => err.partial_output(),
            _ => None,
        }
    }
}

impl From<RemoteError> for SessionError {
    fn from(value: RemoteError) -> Self {
        Self::Remote(Box::new(value))
    }
}
