//! Minimal Sprites REST client.
//!
//! Responses are classified into [`ProviderError`] here so the provider
//! layer never sees raw HTTP statuses.

use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::provider::ProviderError;

use super::PROVIDER_NAME;
use super::types::{CreateSpriteRequest, ListSpritesResponse, Sprite};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Sprites REST API.
#[derive(Clone)]
pub(crate) struct SpritesClient {
    base: String,
    token: String,
    http: reqwest::Client,
}

fn transport(err: &reqwest::Error) -> ProviderError {
    ProviderError::provision(format!("{PROVIDER_NAME} request failed: {err}"))
}

impl SpritesClient {
    pub(crate) fn new(base: &str, token: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn authorised(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    async fn check(response: Response, id: &str, allow_404: bool) -> Result<Response, ProviderError> {
        let status = response.status();
        if status.is_success() || (allow_404 && status.as_u16() == 404) {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_http_status(
            PROVIDER_NAME,
            id,
            status.as_u16(),
            &body,
        ))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
        response
            .json()
            .await
            .map_err(|err| ProviderError::provision(format!("unexpected sprites response: {err}")))
    }

    pub(crate) async fn create_sprite(&self, name: &str) -> Result<Sprite, ProviderError> {
        let response = self
            .authorised(self.http.post(self.url("/sprites")))
            .json(&CreateSpriteRequest { name })
            .send()
            .await
            .map_err(|err| transport(&err))?;
        Self::json(Self::check(response, name, false).await?).await
    }

    pub(crate) async fn get_sprite(&self, name: &str) -> Result<Sprite, ProviderError> {
        let response = self
            .authorised(self.http.get(self.url(&format!("/sprites/{name}"))))
            .send()
            .await
            .map_err(|err| transport(&err))?;
        Self::json(Self::check(response, name, false).await?).await
    }

    pub(crate) async fn delete_sprite(&self, name: &str) -> Result<(), ProviderError> {
        let response = self
            .authorised(self.http.delete(self.url(&format!("/sprites/{name}"))))
            .send()
            .await
            .map_err(|err| transport(&err))?;
        Self::check(response, name, true).await?;
        Ok(())
    }

    pub(crate) async fn list_sprites(
        &self,
        continuation_token: Option<&str>,
    ) -> Result<ListSpritesResponse, ProviderError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(token) = continuation_token {
            query.push(("continuation_token", token));
        }
        let response = self
            .authorised(self.http.get(self.url("/sprites")))
            .query(&query)
            .send()
            .await
            .map_err(|err| transport(&err))?;
        Self::json(Self::check(response, "sprites", false).await?).await
    }
}
