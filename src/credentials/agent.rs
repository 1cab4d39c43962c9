//! SSH agent protocol access and key file identities.

use camino::{Utf8Path, Utf8PathBuf};
use russh::keys::agent::client::AgentClient;
use russh::keys::{HashAlg, PublicKey};

use super::{
    AgentConnector, AgentEndpoint, CredentialError, CredentialFuture, Identity, IdentitySource,
};
use crate::util::read_to_string_ambient;

/// [`AgentConnector`] speaking the agent protocol over a Unix socket.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnixAgentConnector;

impl AgentConnector for UnixAgentConnector {
    fn list_identities<'a>(
        &'a self,
        endpoint: &'a AgentEndpoint,
    ) -> CredentialFuture<'a, Vec<Identity>> {
        Box::pin(async move {
            let agent_error = |message: String| CredentialError::Agent {
                endpoint: endpoint.to_string(),
                message,
            };
            let mut client = AgentClient::connect_uds(endpoint.path.as_std_path())
                .await
                .map_err(|err| agent_error(err.to_string()))?;
            let keys = client
                .request_identities()
                .await
                .map_err(|err| agent_error(err.to_string()))?;
            keys.iter()
                .map(|key| identity_for_key(key, IdentitySource::Agent(endpoint.clone())))
                .collect::<Result<Vec<_>, String>>()
                .map_err(agent_error)
        })
    }
}

fn identity_for_key(key: &PublicKey, source: IdentitySource) -> Result<Identity, String> {
    Ok(Identity {
        fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
        label: key.comment().to_owned(),
        public_key: key.to_openssh().map_err(|err| err.to_string())?,
        source,
    })
}

/// Parses an OpenSSH public key line into an [`Identity`].
///
/// # Errors
///
/// Returns the parse error message when `text` is not a public key.
pub fn identity_from_openssh(text: &str, source: IdentitySource) -> Result<Identity, String> {
    let key = PublicKey::from_openssh(text.trim()).map_err(|err| err.to_string())?;
    identity_for_key(&key, source)
}

/// Builds the identity for a private key file from its `.pub` companion.
///
/// # Errors
///
/// Returns [`CredentialError::KeyFile`] when the public half is missing or
/// cannot be parsed.
pub fn load_key_file_identity(path: &Utf8Path) -> Result<Identity, CredentialError> {
    let public_path = Utf8PathBuf::from(format!("{path}.pub"));
    let key_file_error = |message: String| CredentialError::KeyFile {
        path: path.to_path_buf(),
        message,
    };
    let text = read_to_string_ambient(&public_path).map_err(key_file_error)?;
    identity_from_openssh(&text, IdentitySource::KeyFile(path.to_path_buf()))
        .map_err(key_file_error)
}
