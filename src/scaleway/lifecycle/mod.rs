//! Server lifecycle helpers for the Scaleway provider.

use std::sync::LazyLock;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::config::ScalewayConfig;
use crate::provider::{CreateRequest, ProviderError};

use super::ScalewayProvider;
use super::error::{self, Context};

mod create;
mod image;
mod servers;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub(in crate::scaleway) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Where and how a server is placed: the request's overrides merged over
/// the configured defaults.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(in crate::scaleway) struct Placement {
    pub(in crate::scaleway) zone: String,
    pub(in crate::scaleway) commercial_type: String,
    pub(in crate::scaleway) image_label: String,
    pub(in crate::scaleway) architecture: String,
    pub(in crate::scaleway) project_id: String,
    pub(in crate::scaleway) organization_id: Option<String>,
}

impl Placement {
    pub(in crate::scaleway) fn for_request(config: &ScalewayConfig, request: &CreateRequest) -> Self {
        Self {
            zone: pick(request.region.as_deref(), &config.default_zone),
            commercial_type: pick(request.hardware.as_deref(), &config.default_instance_type),
            image_label: pick(request.image.as_deref(), &config.default_image),
            architecture: config.default_architecture.clone(),
            project_id: config.default_project_id.clone(),
            organization_id: config.default_organization_id.clone(),
        }
    }
}

fn pick(value: Option<&str>, fallback: &str) -> String {
    value.unwrap_or(fallback).to_owned()
}

impl ScalewayProvider {
    /// Sends an authenticated request and decodes a JSON success body.
    pub(in crate::scaleway) async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        context: Context<'_>,
    ) -> Result<T, ProviderError> {
        let response = request
            .header("X-Auth-Token", &self.config.secret_key)
            .send()
            .await
            .map_err(|err| error::transport(&err))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| error::transport(&err))?;

        if !status.is_success() {
            return Err(error::classify_response(status, &body, context));
        }
        serde_json::from_slice(&body).map_err(|err| {
            ProviderError::provision(format!("unexpected scaleway response: {err}"))
        })
    }
}

#[cfg(test)]
mod tests;
