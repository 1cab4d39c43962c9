//! Sprites backend.
//!
//! Sprites are reached over the WebSocket exec endpoint rather than SSH and
//! do not run cloud-init, so boot payloads are executed as a first-boot
//! script once the sprite is reachable. VM identifiers are sprite names.

mod client;
mod types;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tracing::{debug, info};

use crate::config::{ConfigError, DrydockConfig, SpritesConfig};
use crate::provider::{
    CreateRequest, Provider, ProviderError, ProviderFuture, ProviderRegistry, RegistryError, Vm,
};
use crate::readiness;
use crate::remote::{RemoteAccess, WsTarget};
use client::SpritesClient;
use types::ListSpritesResponse;

/// Registry name of the backend.
pub const PROVIDER_NAME: &str = "sprites";

const SPRITES_SEGMENT: &str = "sprites";

/// Provider backed by the Sprites REST API.
#[derive(Clone)]
pub struct SpritesProvider {
    client: SpritesClient,
    ws_host: String,
    ws_path: String,
    token: String,
    clear_first_control_line: bool,
    poll_interval: Duration,
}

impl fmt::Debug for SpritesProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpritesProvider")
            .field("ws_host", &self.ws_host)
            .field("ws_path", &self.ws_path)
            .finish_non_exhaustive()
    }
}

/// Splits the API base URL into the host (with any explicit port) and the
/// path prefix the exec endpoint lives under.
fn exec_location(api_base: &str) -> Result<(String, String), ConfigError> {
    let invalid = |reason: &'static str| ConfigError::Invalid {
        field: "api_base",
        env_var: "SPRITES_API_BASE",
        reason,
    };
    let url = Url::parse(api_base).map_err(|_| invalid("must be an absolute URL"))?;
    let host = url.host_str().ok_or_else(|| invalid("must include a host"))?;
    let host_port = url
        .port()
        .map_or_else(|| host.to_owned(), |port| format!("{host}:{port}"));
    let prefix = url.path().trim_matches('/');
    let path = if prefix.is_empty() {
        SPRITES_SEGMENT.to_owned()
    } else {
        format!("{prefix}/{SPRITES_SEGMENT}")
    };
    Ok((host_port, path))
}

/// Upper bound on listing pages, well past any realistic sprite count.
const MAX_LIST_PAGES: usize = 1_000;

/// Follows continuation tokens until the listing ends. A repeated token or a
/// listing longer than [`MAX_LIST_PAGES`] is an error rather than a partial
/// result, so reconciliation never judges sprites missing from a truncated
/// list.
async fn collect_pages<F, Fut>(mut fetch: F) -> Result<Vec<Vm>, ProviderError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<ListSpritesResponse, ProviderError>>,
{
    let mut vms = Vec::new();
    let mut seen = HashSet::new();
    let mut token: Option<String> = None;
    for _ in 0..MAX_LIST_PAGES {
        let page = fetch(token.take()).await?;
        vms.extend(page.sprites.into_iter().map(types::Sprite::into_vm));
        match page.next_continuation_token {
            Some(next) if page.has_more => {
                if !seen.insert(next.clone()) {
                    return Err(ProviderError::provision(format!(
                        "{PROVIDER_NAME} listing repeated continuation token '{next}'"
                    )));
                }
                token = Some(next);
            }
            _ => return Ok(vms),
        }
    }
    Err(ProviderError::provision(format!(
        "{PROVIDER_NAME} listing exceeded {MAX_LIST_PAGES} pages"
    )))
}

impl SpritesProvider {
    /// Builds a provider from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the token is missing or the API base is
    /// not a URL.
    pub fn new(config: &SpritesConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (ws_host, ws_path) = exec_location(&config.api_base)?;
        Ok(Self {
            client: SpritesClient::new(&config.api_base, &config.token),
            ws_host,
            ws_path,
            token: config.token.clone(),
            clear_first_control_line: config.clear_first_control_line,
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

impl Provider for SpritesProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn create<'a>(&'a self, request: &'a CreateRequest) -> ProviderFuture<'a, Vm> {
        Box::pin(async move {
            request
                .validate()
                .map_err(|err| ProviderError::provision(err.to_string()))?;
            if request.region.is_some() || request.hardware.is_some() || request.image.is_some() {
                debug!(name = %request.name, "sprites ignore region, hardware and image overrides");
            }
            let sprite = self.client.create_sprite(&request.name).await?;
            info!(name = %sprite.name, id = %sprite.id, "sprite created");
            Ok(sprite.into_vm())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Vm> {
        Box::pin(async move { Ok(self.client.get_sprite(id).await?.into_vm()) })
    }

    fn delete<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.client.delete_sprite(id).await?;
            info!(name = id, "sprite deleted");
            Ok(())
        })
    }

    fn list(&self) -> ProviderFuture<'_, Vec<Vm>> {
        Box::pin(async move {
            let vms = collect_pages(|token| async move {
                self.client.list_sprites(token.as_deref()).await
            })
            .await?;
            debug!(count = vms.len(), "listed sprites");
            Ok(vms)
        })
    }

    fn access(&self, vm: &Vm) -> RemoteAccess {
        RemoteAccess::WebSocket(WsTarget {
            host: self.ws_host.clone(),
            path: self.ws_path.clone(),
            name: vm.id.clone(),
            token: self.token.clone(),
            clear_first_control_line: self.clear_first_control_line,
        })
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn applies_user_data(&self) -> bool {
        false
    }
}

/// Registers the Sprites factory. The token is loaded from the
/// `SPRITES_*` layer when the provider is first resolved.
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
        let sprites = SpritesConfig::load_without_cli_args().map_err(unavailable)?;
        let provider = SpritesProvider::new(&sprites)
            .map_err(unavailable)?
            .with_poll_interval(config.poll_interval());
        Ok(Arc::new(provider) as Arc<dyn Provider>)
    })
}
