//! Scaleway Instances backend.
//!
//! Servers are created stopped so cloud-init user-data can be attached
//! before first boot, then powered on. Every server carries the
//! [`MANAGED_TAG`] so listing only returns machines this tool created.
//! VM identifiers have the form `zone/server-id`; listing covers the default
//! zone, and servers created elsewhere are fetched by id.

mod error;
mod keys;
mod lifecycle;
mod types;
mod user_data;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use scaleway_rs::ScalewayApi;
use tracing::info;

use crate::config::{ConfigError, DrydockConfig, ScalewayConfig};
use crate::provider::{
    CreateRequest, KeyManager, Provider, ProviderFuture, ProviderRegistry, RegistryError, Vm,
};
use crate::readiness;
use crate::remote::RemoteAccess;

/// Registry name of the backend.
pub const PROVIDER_NAME: &str = "scaleway";

/// Tag attached to every server this tool creates.
pub const MANAGED_TAG: &str = "drydock";

const INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
const IAM_API_BASE: &str = "https://api.scaleway.com/iam/v1alpha1";

/// Provider backed by the Scaleway Instances and IAM APIs.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    config: ScalewayConfig,
    ssh_port: u16,
    poll_interval: Duration,
}

impl fmt::Debug for ScalewayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalewayProvider")
            .field("zone", &self.config.default_zone)
            .field("project", &self.config.default_project_id)
            .field("ssh_port", &self.ssh_port)
            .finish_non_exhaustive()
    }
}

impl ScalewayProvider {
    /// Constructs a provider from validated configuration. `ssh_port` is the
    /// port advertised for remote access.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration fails validation.
    pub fn new(config: ScalewayConfig, ssh_port: u16) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            ssh_port,
            poll_interval: readiness::DEFAULT_POLL_INTERVAL,
        })
    }

    /// Overrides the interval between readiness polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Provider for ScalewayProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn create<'a>(&'a self, request: &'a CreateRequest) -> ProviderFuture<'a, Vm> {
        Box::pin(async move { self.create_vm(request).await })
    }

    fn get<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Vm> {
        Box::pin(async move { self.fetch_vm(id).await })
    }

    fn delete<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.delete_vm(id).await })
    }

    fn list(&self) -> ProviderFuture<'_, Vec<Vm>> {
        Box::pin(async move { self.list_managed().await })
    }

    fn lists(&self, vm_id: &str) -> bool {
        self.lists_zone_of(vm_id)
    }

    fn access(&self, vm: &Vm) -> RemoteAccess {
        RemoteAccess::Ssh {
            host: vm.address.clone(),
            port: self.ssh_port,
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn key_manager(&self) -> Option<&dyn KeyManager> {
        Some(self)
    }
}

/// Registers the Scaleway factory. Credentials are loaded from the `SCW_*`
/// layer when the provider is first resolved.
///
/// # Errors
///
/// Returns [`RegistryError::Duplicate`] when the name is already taken.
pub fn register(registry: &mut ProviderRegistry) -> Result<(), RegistryError> {
    registry.register(PROVIDER_NAME, |config: &DrydockConfig| {
        let unavailable = |err: ConfigError| RegistryError::Unavailable {
            name: PROVIDER_NAME.to_owned(),
            message: err.to_string(),
        };
        let scaleway = ScalewayConfig::load_without_cli_args().map_err(unavailable)?;
        let provider = ScalewayProvider::new(scaleway, config.ssh_port)
            .map_err(unavailable)?
            .with_poll_interval(config.poll_interval());
        info!(
            zone = %provider.config.default_zone,
            project = %provider.config.default_project_id,
            "scaleway provider ready"
        );
        Ok(Arc::new(provider) as Arc<dyn Provider>)
    })
}
