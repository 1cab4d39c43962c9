//! Cloud-init user-data upload.
//!
//! Scaleway exposes instance user-data as a per-server key/value store. When
//! the key is set to `cloud-init`, the value is consumed by cloud-init on the
//! instance's first boot, so it must be written while the server is stopped.

use tracing::debug;

use crate::provider::ProviderError;

use super::error::{self, Context};
use super::lifecycle::HTTP_CLIENT;
use super::{INSTANCE_API_BASE, ScalewayProvider};

/// Reserved user-data key that Scaleway recognises for cloud-init payloads.
pub(crate) const CLOUD_INIT_USER_DATA_KEY: &str = "cloud-init";

pub(crate) fn user_data_url(zone: &str, server_id: &str, key: &str) -> String {
    format!("{INSTANCE_API_BASE}/zones/{zone}/servers/{server_id}/user_data/{key}")
}

impl ScalewayProvider {
    pub(in crate::scaleway) async fn upload_cloud_init(
        &self,
        zone: &str,
        server_id: &str,
        payload: &str,
    ) -> Result<(), ProviderError> {
        let url = user_data_url(zone, server_id, CLOUD_INIT_USER_DATA_KEY);
        let response = HTTP_CLIENT
            .patch(&url)
            .header("X-Auth-Token", &self.config.secret_key)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(payload.to_owned())
            .send()
            .await
            .map_err(|err| error::transport(&err))?;

        let status = response.status();
        if status.is_success() {
            debug!(zone, server = server_id, bytes = payload.len(), "cloud-init user-data set");
            return Ok(());
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(error::classify_response(
            status,
            &body,
            Context::vm(server_id, zone),
        ))
    }
}
