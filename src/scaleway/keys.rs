//! Project SSH key registration through the Scaleway IAM API.
//!
//! Keys registered on the project are injected into every server at first
//! boot, so registering once is enough for all later sessions.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::provider::{KeyManager, ProviderError, ProviderFuture};

use super::error::{self, Context};
use super::lifecycle::HTTP_CLIENT;
use super::{IAM_API_BASE, ScalewayProvider};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct SshKey {
    id: String,
    #[serde(default)]
    public_key: String,
}

#[derive(Deserialize)]
struct SshKeyList {
    #[serde(default)]
    ssh_keys: Vec<SshKey>,
}

#[derive(Serialize)]
struct CreateSshKey<'a> {
    name: &'a str,
    public_key: &'a str,
    project_id: &'a str,
}

/// Algorithm and base64 blob of an OpenSSH public key, ignoring comments.
fn key_material(public_key: &str) -> Option<(&str, &str)> {
    let mut fields = public_key.split_whitespace();
    Some((fields.next()?, fields.next()?))
}

fn find_key(keys: &[SshKey], public_key: &str) -> Option<String> {
    let wanted = key_material(public_key)?;
    keys.iter()
        .find(|key| key_material(&key.public_key) == Some(wanted))
        .map(|key| key.id.clone())
}

impl ScalewayProvider {
    async fn project_keys(&self) -> Result<Vec<SshKey>, ProviderError> {
        let url = format!("{IAM_API_BASE}/ssh-keys");
        let query = [
            ("project_id", self.config.default_project_id.as_str()),
            ("per_page", "100"),
        ];
        let list: SshKeyList = self
            .send_json(
                HTTP_CLIENT.get(&url).query(&query),
                Context::vm("ssh-keys", &self.config.default_zone),
            )
            .await?;
        Ok(list.ssh_keys)
    }

    async fn register_key(&self, name: &str, public_key: &str) -> Result<Option<String>, ProviderError> {
        let url = format!("{IAM_API_BASE}/ssh-keys");
        let payload = CreateSshKey {
            name,
            public_key: public_key.trim(),
            project_id: &self.config.default_project_id,
        };
        let response = HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.config.secret_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| error::transport(&err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| error::transport(&err))?;

        if status == StatusCode::CONFLICT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(error::classify_response(
                status,
                &body,
                Context::vm(name, &self.config.default_zone),
            ));
        }
        let key: SshKey = serde_json::from_slice(&body).map_err(|err| {
            ProviderError::provision(format!("unexpected scaleway response: {err}"))
        })?;
        Ok(Some(key.id))
    }
}

impl KeyManager for ScalewayProvider {
    fn ensure_key<'a>(
        &'a self,
        name: &'a str,
        public_key: &'a str,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            if let Some(existing) = find_key(&self.project_keys().await?, public_key) {
                return Ok(existing);
            }
            if let Some(created) = self.register_key(name, public_key).await? {
                info!(key = %created, name, "registered project ssh key");
                return Ok(created);
            }
            // Lost a race with another registration of the same key.
            find_key(&self.project_keys().await?, public_key).ok_or_else(|| {
                ProviderError::provision(format!(
                    "ssh key '{name}' conflicts with an existing key that does not match"
                ))
            })
        })
    }
}
