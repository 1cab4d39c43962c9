//! Core library for the drydock VM session tool.
//!
//! The crate provisions short-lived virtual machines through pluggable
//! [`provider::Provider`] backends (Scaleway Instances and Sprites), waits
//! for them to become reachable, and runs commands or interactive shells on
//! them over SSH or a WebSocket exec channel. Local [`session::Session`]
//! records correlate operator-chosen names with provider VMs and are
//! reconciled against what each provider reports.

pub mod cloud_init;
pub mod config;
pub mod credentials;
pub mod provider;
pub mod readiness;
pub mod remote;
pub mod scaleway;
pub mod session;
pub mod sprites;
#[cfg(test)]
pub mod test_helpers;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod util;

pub use config::{ConfigError, DrydockConfig, ScalewayConfig, SpritesConfig};
pub use provider::{
    CreateRequest, ErrorKind, Provider, ProviderError, ProviderRegistry, RegistryError, Vm,
    VmStatus,
};
pub use session::{Session, SessionError, SessionManager, SessionStatus};

/// Registry with every built-in backend registered. Backend credentials are
/// only loaded when that backend is first resolved.
///
/// # Errors
///
/// Returns [`RegistryError::Duplicate`] if a backend name is registered
/// twice.
pub fn builtin_registry(config: DrydockConfig) -> Result<ProviderRegistry, RegistryError> {
    let mut registry = ProviderRegistry::new(config);
    scaleway::register(&mut registry)?;
    sprites::register(&mut registry)?;
    Ok(registry)
}
