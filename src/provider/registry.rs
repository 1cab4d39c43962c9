//! Name-to-factory registry used to select a provider at runtime.
//!
//! The registry is an explicit object built once at startup. Each backend
//! module exposes a `register` function that adds its factory; nothing is
//! registered implicitly.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, info};

use super::Provider;
use crate::config::DrydockConfig;

/// Builds a provider from the loaded configuration.
pub type ProviderFactory =
    Box<dyn Fn(&DrydockConfig) -> Result<Arc<dyn Provider>, RegistryError> + Send + Sync>;

/// Errors raised while registering or resolving providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when no factory is registered under the requested name.
    #[error("unknown provider '{name}' (known providers: {known})")]
    UnknownProvider {
        /// Name that was requested.
        name: String,
        /// Comma-separated list of registered names.
        known: String,
    },
    /// Raised when a name is registered twice.
    #[error("provider '{name}' is already registered")]
    Duplicate {
        /// Name registered twice.
        name: String,
    },
    /// Raised when a factory cannot build its provider, usually because of
    /// missing configuration.
    #[error("provider '{name}' is unavailable: {message}")]
    Unavailable {
        /// Provider name.
        name: String,
        /// Why the factory failed.
        message: String,
    },
}

struct Entry {
    factory: ProviderFactory,
    instance: OnceLock<Arc<dyn Provider>>,
}

/// Registry mapping provider names to factories. Each provider is built on
/// first use and shared afterwards.
pub struct ProviderRegistry {
    config: DrydockConfig,
    entries: BTreeMap<String, Entry>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry whose factories receive `config`.
    #[must_use]
    pub const fn new(config: DrydockConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
        }
    }

    /// Registers a factory under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] when `name` is already taken.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&DrydockConfig) -> Result<Arc<dyn Provider>, RegistryError> + Send + Sync + 'static,
    {
        if self.entries.contains_key(name) {
            return Err(RegistryError::Duplicate {
                name: name.to_owned(),
            });
        }
        self.entries.insert(
            name.to_owned(),
            Entry {
                factory: Box::new(factory),
                instance: OnceLock::new(),
            },
        );
        info!(provider = name, "registered provider");
        Ok(())
    }

    /// Returns the registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Returns the configuration handed to factories.
    #[must_use]
    pub const fn config(&self) -> &DrydockConfig {
        &self.config
    }

    /// Resolves `name` to a provider, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownProvider`] listing the known names
    /// when `name` is not registered, or the factory's error when the
    /// provider cannot be built.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownProvider {
                name: name.to_owned(),
                known: self.names().join(", "),
            })?;

        if let Some(existing) = entry.instance.get() {
            return Ok(Arc::clone(existing));
        }

        debug!(provider = name, "building provider");
        let built = (entry.factory)(&self.config)?;
        Ok(Arc::clone(entry.instance.get_or_init(|| built)))
    }
}
