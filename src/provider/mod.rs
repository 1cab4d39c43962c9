//! Provider abstraction for provisioning disposable virtual machines.
//!
//! Every cloud backend implements [`Provider`]. Callers pick a backend by
//! name through the [`ProviderRegistry`] and never see provider-specific
//! error types: failures are classified into [`ProviderError`] before they
//! leave the backend.

mod error;
pub mod registry;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::readiness::{self, ReadinessOptions};
use crate::remote::RemoteAccess;

pub use error::{ErrorKind, ProviderError};
pub use registry::{ProviderFactory, ProviderRegistry, RegistryError};

const MAX_NAME_LEN: usize = 63;

/// Lifecycle state of a VM as reported by its provider.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// The provider accepted the request but has not allocated the VM yet.
    Provisioning,
    /// The VM is booting.
    Starting,
    /// The VM is up.
    Running,
    /// The VM is shutting down.
    Stopping,
    /// The VM exists but is powered off.
    Stopped,
    /// The VM is being deleted.
    Deleting,
    /// The provider gave up on the VM.
    Failed,
}

impl VmStatus {
    /// Returns the lowercase label used in output and persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a VM owned by a provider. Refreshed only by re-fetching.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Vm {
    /// Provider-specific identifier.
    pub id: String,
    /// Name the VM was created with.
    pub name: String,
    /// Lifecycle state at the time of the fetch.
    pub status: VmStatus,
    /// Network address used to reach the VM. Empty until assigned.
    pub address: String,
    /// Creation time reported by the provider, when known.
    pub created_at: Option<DateTime<Utc>>,
    /// Region or zone hosting the VM.
    pub region: String,
    /// Hardware class (commercial type, machine size, and so on).
    pub hardware: String,
}

impl Vm {
    /// Returns `true` once the provider has assigned an address.
    #[must_use]
    pub fn has_address(&self) -> bool {
        !self.address.trim().is_empty()
    }
}

/// Errors raised while building a [`CreateRequest`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// Raised when a required field is empty after trimming.
    #[error("missing or empty field: {0}")]
    MissingField(String),
    /// Raised when the VM name cannot be used as a hostname.
    #[error("invalid name '{name}': {reason}")]
    InvalidName {
        /// Name supplied by the caller.
        name: String,
        /// Why the name was rejected.
        reason: String,
    },
}

/// Parameters for creating a VM. Immutable once built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateRequest {
    /// Unique VM name; also used as the session identifier.
    pub name: String,
    /// Region or zone override; providers fall back to their default.
    pub region: Option<String>,
    /// Hardware class override.
    pub hardware: Option<String>,
    /// Image label override.
    pub image: Option<String>,
    /// Provider key identifier to inject, when already known.
    pub key_id: Option<String>,
    /// Boot customisation payload: cloud-init user-data or a first-boot
    /// script. Passed through unchanged.
    pub user_data: Option<String>,
}

impl CreateRequest {
    /// Starts a builder for a [`CreateRequest`].
    #[must_use]
    pub fn builder(name: impl Into<String>) -> CreateRequestBuilder {
        CreateRequestBuilder::new(name)
    }

    /// Returns a copy of the request carrying `key_id`.
    #[must_use]
    pub fn with_key_id(&self, key_id: impl Into<String>) -> Self {
        Self {
            key_id: Some(key_id.into()),
            ..self.clone()
        }
    }

    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when the name is empty, too long, or contains
    /// characters that are not valid in a hostname label.
    pub fn validate(&self) -> Result<(), RequestError> {
        validate_name(&self.name)
    }
}

fn validate_name(name: &str) -> Result<(), RequestError> {
    if name.is_empty() {
        return Err(RequestError::MissingField(String::from("name")));
    }
    let invalid = |reason: &str| RequestError::InvalidName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("must be at most 63 characters"));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
    {
        return Err(invalid(
            "only lowercase letters, digits and '-' are allowed",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("must not start or end with '-'"));
    }
    Ok(())
}

/// Builder for [`CreateRequest`] that trims and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateRequestBuilder {
    name: String,
    region: Option<String>,
    hardware: Option<String>,
    image: Option<String>,
    key_id: Option<String>,
    user_data: Option<String>,
}

impl CreateRequestBuilder {
    /// Creates a builder for a VM called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the region override.
    #[must_use]
    pub fn region(mut self, value: Option<String>) -> Self {
        self.region = value;
        self
    }

    /// Sets the hardware class override.
    #[must_use]
    pub fn hardware(mut self, value: Option<String>) -> Self {
        self.hardware = value;
        self
    }

    /// Sets the image override.
    #[must_use]
    pub fn image(mut self, value: Option<String>) -> Self {
        self.image = value;
        self
    }

    /// Sets the provider key identifier.
    #[must_use]
    pub fn key_id(mut self, value: Option<String>) -> Self {
        self.key_id = value;
        self
    }

    /// Sets the boot customisation payload.
    #[must_use]
    pub fn user_data(mut self, value: Option<String>) -> Self {
        self.user_data = value;
        self
    }

    /// Builds the request, trimming overrides and dropping empty ones. The
    /// user-data payload is kept byte-for-byte.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when validation fails.
    pub fn build(self) -> Result<CreateRequest, RequestError> {
        let request = CreateRequest {
            name: self.name.trim().to_owned(),
            region: trimmed(self.region),
            hardware: trimmed(self.hardware),
            image: trimmed(self.image),
            key_id: trimmed(self.key_id),
            user_data: self.user_data.filter(|payload| !payload.trim().is_empty()),
        };
        request.validate()?;
        Ok(request)
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|clean| !clean.is_empty())
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Capability interface implemented by every cloud backend.
pub trait Provider: Send + Sync {
    /// Registry name of the backend (for example `scaleway`).
    fn name(&self) -> &str;

    /// Creates a VM and returns its first snapshot.
    fn create<'a>(&'a self, request: &'a CreateRequest) -> ProviderFuture<'a, Vm>;

    /// Fetches the current snapshot of a VM, or
    /// [`ProviderError::NotFound`] when it no longer exists.
    fn get<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Vm>;

    /// Deletes a VM. Deleting a VM that is already gone succeeds.
    fn delete<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()>;

    /// Lists every VM this tool manages within the backend's listing scope.
    fn list(&self) -> ProviderFuture<'_, Vec<Vm>>;

    /// Returns `true` when [`Provider::list`] would report `vm_id` if it
    /// exists. VMs outside the listing scope have to be fetched with
    /// [`Provider::get`].
    fn lists(&self, _vm_id: &str) -> bool {
        true
    }

    /// Describes which transport reaches `vm`.
    fn access(&self, vm: &Vm) -> RemoteAccess;

    /// Polls until the VM is reachable, the deadline passes, or a fatal state
    /// is observed. See [`readiness::wait_ready`].
    fn wait_ready<'a>(
        &'a self,
        id: &'a str,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, Vm> {
        Box::pin(async move {
            let options = ReadinessOptions::new(timeout).with_poll_interval(self.poll_interval());
            readiness::wait_ready(self, id, &options, cancel).await
        })
    }

    /// Interval between readiness polls.
    fn poll_interval(&self) -> Duration {
        readiness::DEFAULT_POLL_INTERVAL
    }

    /// Returns `true` when the backend hands user-data to cloud-init.
    /// Backends returning `false` get the payload run as a first-boot script.
    fn applies_user_data(&self) -> bool {
        true
    }

    /// Returns the key management capability, when the backend has one.
    fn key_manager(&self) -> Option<&dyn KeyManager> {
        None
    }
}

/// Managed SSH key upload, offered only by some backends.
pub trait KeyManager: Send + Sync {
    /// Ensures a public key is registered under `name` and returns the
    /// provider's key identifier. Registering an existing key is a no-op.
    fn ensure_key<'a>(&'a self, name: &'a str, public_key: &'a str)
    -> ProviderFuture<'a, String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn builder_trims_and_drops_blank_overrides() {
        let request = CreateRequest::builder("  dev-box  ")
            .region(Some(String::from(" fr-par-2 ")))
            .hardware(Some(String::from("   ")))
            .image(None)
            .user_data(Some(String::from("#!/bin/sh\necho hi\n")))
            .build()
            .unwrap_or_else(|err| panic!("build request: {err}"));

        assert_eq!(request.name, "dev-box");
        assert_eq!(request.region.as_deref(), Some("fr-par-2"));
        assert_eq!(request.hardware, None);
        assert_eq!(request.user_data.as_deref(), Some("#!/bin/sh\necho hi\n"));
    }

    #[test]
    fn builder_rejects_empty_name() {
        let err = CreateRequest::builder("   ")
            .build()
            .expect_err("blank name should fail");
        assert_eq!(err, RequestError::MissingField(String::from("name")));
    }

    #[rstest]
    #[case("Dev")]
    #[case("dev_box")]
    #[case("-dev")]
    #[case("dev-")]
    #[case("a.b")]
    fn builder_rejects_names_that_are_not_hostnames(#[case] name: &str) {
        let err = CreateRequest::builder(name)
            .build()
            .expect_err("name should be rejected");
        assert!(matches!(err, RequestError::InvalidName { .. }), "{err}");
    }

    #[test]
    fn builder_rejects_overlong_name() {
        let name = "a".repeat(64);
        let err = CreateRequest::builder(name)
            .build()
            .expect_err("overlong name should fail");
        assert!(matches!(err, RequestError::InvalidName { .. }));
    }

    #[test]
    fn blank_user_data_is_dropped() {
        let request = CreateRequest::builder("box")
            .user_data(Some(String::from("\n  \n")))
            .build()
            .unwrap_or_else(|err| panic!("build request: {err}"));
        assert_eq!(request.user_data, None);
    }

    #[test]
    fn with_key_id_preserves_other_fields() {
        let request = CreateRequest::builder("box")
            .region(Some(String::from("nl-ams-1")))
            .build()
            .unwrap_or_else(|err| panic!("build request: {err}"));
        let keyed = request.with_key_id("key-1");
        assert_eq!(keyed.key_id.as_deref(), Some("key-1"));
        assert_eq!(keyed.region, request.region);
    }

    #[test]
    fn vm_status_serialises_lowercase() {
        let rendered = serde_json::to_string(&VmStatus::Stopping)
            .unwrap_or_else(|err| panic!("serialise status: {err}"));
        assert_eq!(rendered, "\"stopping\"");
        assert_eq!(VmStatus::Stopping.to_string(), "stopping");
    }
}
