//! Image resolution for the Scaleway provider.
//!
//! Images are searched scope by scope in [`ImageScope::SEARCH_ORDER`]: the
//! configured project first, so a team can pin a golden image under a public
//! label, then the public catalogue. The first scope holding a usable image
//! wins, and within it the newest one for the architecture is chosen.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use tracing::debug;

use crate::provider::ProviderError;

use super::super::ScalewayProvider;
use super::super::error::{self, Context};
use super::Placement;

const AVAILABLE: &str = "available";

/// Where an image lookup searches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(in crate::scaleway) enum ImageScope {
    /// Images owned by the configured project (and organisation).
    Project,
    /// The public catalogue.
    Public,
}

impl ImageScope {
    pub(in crate::scaleway) const SEARCH_ORDER: [Self; 2] = [Self::Project, Self::Public];
}

impl Placement {
    /// Newest available image built for the placement's architecture.
    pub(in crate::scaleway) fn newest_usable(&self, images: Vec<ScalewayImage>) -> Option<String> {
        images
            .into_iter()
            .filter(|image| image.arch == self.architecture && image.state == AVAILABLE)
            .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
            .map(|image| image.id)
    }
}

impl ScalewayProvider {
    pub(in crate::scaleway) async fn resolve_image_id(
        &self,
        placement: &Placement,
    ) -> Result<String, ProviderError> {
        search_images(placement, |scope| self.list_images(placement, scope)).await
    }

    async fn list_images(
        &self,
        placement: &Placement,
        scope: ImageScope,
    ) -> Result<Vec<ScalewayImage>, ProviderError> {
        let mut lookup = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &placement.zone)
            .public(true)
            .name(&placement.image_label)
            .arch(&placement.architecture);
        if scope == ImageScope::Project {
            if placement.project_id.is_empty() {
                return Ok(Vec::new());
            }
            lookup = lookup.project(&placement.project_id);
            if let Some(org) = &placement.organization_id {
                lookup = lookup.organization(org);
            }
        }
        lookup.run_async().await.map_err(|err| {
            error::classify_sdk_error(err, Context::vm(&placement.image_label, &placement.zone))
        })
    }
}

/// Walks the search order with `fetch`, stopping at the first scope that
/// yields a usable image. Fetch errors abort the search.
pub(in crate::scaleway) async fn search_images<F, Fut>(
    placement: &Placement,
    mut fetch: F,
) -> Result<String, ProviderError>
where
    F: FnMut(ImageScope) -> Fut,
    Fut: Future<Output = Result<Vec<ScalewayImage>, ProviderError>>,
{
    for scope in ImageScope::SEARCH_ORDER {
        if let Some(id) = placement.newest_usable(fetch(scope).await?) {
            debug!(image = %id, ?scope, label = %placement.image_label, "image resolved");
            return Ok(id);
        }
    }
    Err(error::image_not_found(
        &placement.image_label,
        &placement.architecture,
        &placement.zone,
    ))
}
