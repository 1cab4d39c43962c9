//! Signing identity discovery for SSH authentication.
//!
//! Identities come from SSH agents (discovered in a fixed order, see
//! [`discovery`]) and, after every agent, from configured key files. The
//! resolver walks every source until the requested fingerprint turns up;
//! an agent that merely answers does not end the search. Nothing is cached
//! between calls.

mod agent;
pub mod discovery;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::debug;

pub use agent::{UnixAgentConnector, identity_from_openssh, load_key_file_identity};
pub use discovery::{Discovery, Platform, discover};

/// Where an agent endpoint was discovered.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointOrigin {
    /// `IdentityAgent` in the SSH client configuration.
    SshConfig,
    /// The 1Password SSH agent socket.
    OnePassword,
    /// The `SSH_AUTH_SOCK` environment variable.
    Environment,
}

impl fmt::Display for EndpointOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SshConfig => "ssh config IdentityAgent",
            Self::OnePassword => "1Password agent",
            Self::Environment => "SSH_AUTH_SOCK",
        })
    }
}

/// A Unix socket speaking the SSH agent protocol.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AgentEndpoint {
    /// Socket path.
    pub path: Utf8PathBuf,
    /// How the socket was found.
    pub origin: EndpointOrigin,
}

impl fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.origin)
    }
}

/// Where an identity's private half lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IdentitySource {
    /// Held by an agent; signing happens inside the agent.
    Agent(AgentEndpoint),
    /// A private key file read at authentication time.
    KeyFile(Utf8PathBuf),
}

/// A public key available for authentication. Never persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    /// OpenSSH SHA-256 fingerprint (`SHA256:...`).
    pub fingerprint: String,
    /// Key comment.
    pub label: String,
    /// Public key in OpenSSH text form.
    pub public_key: String,
    /// Where the private half lives.
    pub source: IdentitySource,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            f.write_str(&self.fingerprint)
        } else {
            write!(f, "{} ({})", self.fingerprint, self.label)
        }
    }
}

/// A resolved identity ready to authenticate a connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Signer {
    /// Sign through the agent at `endpoint`.
    Agent {
        /// Agent holding the key.
        endpoint: AgentEndpoint,
        /// Identity to offer.
        identity: Identity,
    },
    /// Load the private key from `path` when authenticating.
    KeyFile {
        /// Private key path.
        path: Utf8PathBuf,
        /// Identity derived from the public half.
        identity: Identity,
    },
}

impl Signer {
    fn from_identity(identity: Identity) -> Self {
        match identity.source.clone() {
            IdentitySource::Agent(endpoint) => Self::Agent { endpoint, identity },
            IdentitySource::KeyFile(path) => Self::KeyFile { path, identity },
        }
    }

    /// The identity this signer offers.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        match self {
            Self::Agent { identity, .. } | Self::KeyFile { identity, .. } => identity,
        }
    }
}

/// Errors raised while resolving a signer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// Raised when there is no agent endpoint and no key file to consult.
    #[error(
        "no SSH agent found: start ssh-agent (or the 1Password agent) and export SSH_AUTH_SOCK, \
         or configure identity files"
    )]
    NoAgentAvailable,
    /// Raised when every source failed to answer.
    #[error("could not reach any SSH agent: {details}")]
    ConnectionFailed {
        /// Each endpoint with the reason it failed.
        details: String,
    },
    /// Raised when the agents answered but hold no keys.
    #[error("no SSH identities available from {sources}: add a key with `ssh-add`")]
    NoIdentities {
        /// Sources that were consulted.
        sources: String,
    },
    /// Raised when no source holds the requested fingerprint.
    #[error("identity {fingerprint} not found; available identities: {available}")]
    IdentityNotFound {
        /// Fingerprint that was requested.
        fingerprint: String,
        /// Identities that were found instead.
        available: String,
    },
    /// Raised when talking to one agent fails.
    #[error("agent {endpoint}: {message}")]
    Agent {
        /// Endpoint description.
        endpoint: String,
        /// Underlying error.
        message: String,
    },
    /// Raised when a key file cannot be read or parsed.
    #[error("key file {path}: {message}")]
    KeyFile {
        /// Key file path.
        path: Utf8PathBuf,
        /// Underlying error.
        message: String,
    },
}

/// Future returned by [`AgentConnector`].
pub type CredentialFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CredentialError>> + Send + 'a>>;

/// Speaks the agent protocol to one endpoint.
pub trait AgentConnector: Send + Sync {
    /// Lists the identities held by the agent at `endpoint`.
    fn list_identities<'a>(
        &'a self,
        endpoint: &'a AgentEndpoint,
    ) -> CredentialFuture<'a, Vec<Identity>>;
}

/// Finds a signer across agents and key files.
pub struct CredentialResolver<C = UnixAgentConnector> {
    connector: C,
    discovery: Discovery,
    key_files: Vec<Utf8PathBuf>,
}

impl<C> fmt::Debug for CredentialResolver<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("discovery", &self.discovery)
            .field("key_files", &self.key_files)
            .finish_non_exhaustive()
    }
}

impl CredentialResolver {
    /// Resolver using the real agent protocol and environment discovery.
    #[must_use]
    pub fn from_env(key_files: Vec<Utf8PathBuf>) -> Self {
        Self::new(UnixAgentConnector, Discovery::from_env(), key_files)
    }
}

impl<C: AgentConnector> CredentialResolver<C> {
    /// Resolver with explicit collaborators.
    #[must_use]
    pub const fn new(connector: C, discovery: Discovery, key_files: Vec<Utf8PathBuf>) -> Self {
        Self {
            connector,
            discovery,
            key_files,
        }
    }

    /// Agent endpoints in lookup order.
    #[must_use]
    pub fn discover(&self) -> Vec<AgentEndpoint> {
        self.discovery.endpoints()
    }

    /// Lists the identities held by one agent.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Agent`] when the agent cannot be reached.
    pub async fn list_identities(
        &self,
        endpoint: &AgentEndpoint,
    ) -> Result<Vec<Identity>, CredentialError> {
        self.connector.list_identities(endpoint).await
    }

    /// Returns a signer for `fingerprint`, or for the first identity found
    /// when `fingerprint` is `None`.
    ///
    /// # Errors
    ///
    /// See [`CredentialError`]: no sources, every source unreachable, no
    /// identities, or the fingerprint missing from every source.
    pub async fn get_signer(&self, fingerprint: Option<&str>) -> Result<Signer, CredentialError> {
        let wanted = fingerprint.map(str::trim).filter(|value| !value.is_empty());
        let endpoints = self.discover();
        if endpoints.is_empty() && self.key_files.is_empty() {
            return Err(CredentialError::NoAgentAvailable);
        }

        let mut search = Search::default();
        for endpoint in &endpoints {
            match self.list_identities(endpoint).await {
                Ok(identities) => {
                    debug!(endpoint = %endpoint, count = identities.len(), "agent answered");
                    if let Some(found) = search.offer(identities, wanted) {
                        return Ok(Signer::from_identity(found));
                    }
                }
                Err(err) => {
                    debug!(endpoint = %endpoint, error = %err, "agent unreachable");
                    search.failures.push(format!("{endpoint}: {err}"));
                }
            }
            search.sources.push(endpoint.to_string());
        }

        for path in &self.key_files {
            match load_key_file_identity(path) {
                Ok(identity) => {
                    if let Some(found) = search.offer(vec![identity], wanted) {
                        return Ok(Signer::from_identity(found));
                    }
                }
                Err(err) => search.failures.push(err.to_string()),
            }
            search.sources.push(path.to_string());
        }

        Err(search.into_error(wanted))
    }
}

#[derive(Default)]
struct Search {
    answered: usize,
    found: Vec<Identity>,
    failures: Vec<String>,
    sources: Vec<String>,
}

impl Search {
    fn offer(&mut self, mut identities: Vec<Identity>, wanted: Option<&str>) -> Option<Identity> {
        self.answered += 1;
        let position = identities
            .iter()
            .position(|identity| wanted.is_none_or(|fp| identity.fingerprint == fp));
        match position {
            Some(index) => Some(identities.swap_remove(index)),
            None => {
                self.found.append(&mut identities);
                None
            }
        }
    }

    fn into_error(self, wanted: Option<&str>) -> CredentialError {
        if self.answered == 0 {
            return CredentialError::ConnectionFailed {
                details: self.failures.join("; "),
            };
        }
        match wanted {
            Some(fingerprint) if !self.found.is_empty() => CredentialError::IdentityNotFound {
                fingerprint: fingerprint.to_owned(),
                available: self
                    .found
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            },
            _ => CredentialError::NoIdentities {
                sources: self.sources.join(", "),
            },
        }
    }
}

#[cfg(test)]
mod tests;
