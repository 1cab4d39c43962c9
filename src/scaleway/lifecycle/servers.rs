//! Lookup, listing and teardown of Scaleway servers.

use tracing::{debug, info};

use crate::provider::{ErrorKind, ProviderError, Vm};

use super::super::error::{self, Context};
use super::super::types::{ServerEnvelope, ServerList, ServerRecord, ServerRef};
use super::super::{INSTANCE_API_BASE, MANAGED_TAG, ScalewayProvider};
use super::HTTP_CLIENT;

const PAGE_SIZE: usize = 50;

impl ScalewayProvider {
    async fn fetch_server(&self, id: &str) -> Result<(ServerRecord, String), ProviderError> {
        let server_ref = ServerRef::parse(id, &self.config.default_zone);
        let url = format!(
            "{INSTANCE_API_BASE}/zones/{}/servers/{}",
            server_ref.zone, server_ref.server_id
        );
        let envelope: ServerEnvelope = self
            .send_json(HTTP_CLIENT.get(&url), Context::vm(id, server_ref.zone))
            .await?;
        Ok((envelope.server, server_ref.zone.to_owned()))
    }

    pub(in crate::scaleway) async fn fetch_vm(&self, id: &str) -> Result<Vm, ProviderError> {
        let (server, zone) = self.fetch_server(id).await?;
        Ok(server.into_vm(&zone))
    }

    /// Returns `true` when `id` lives in the zone [`Self::list_managed`]
    /// covers.
    pub(in crate::scaleway) fn lists_zone_of(&self, id: &str) -> bool {
        ServerRef::parse(id, &self.config.default_zone).zone == self.config.default_zone
    }

    /// Lists managed servers in the default zone, following pagination.
    pub(in crate::scaleway) async fn list_managed(&self) -> Result<Vec<Vm>, ProviderError> {
        let zone = &self.config.default_zone;
        let url = format!("{INSTANCE_API_BASE}/zones/{zone}/servers");
        let mut vms = Vec::new();
        let mut page = 1_usize;
        loop {
            let query = [
                ("tags", MANAGED_TAG.to_owned()),
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            let batch: ServerList = self
                .send_json(HTTP_CLIENT.get(&url).query(&query), Context::vm(zone, zone))
                .await?;
            let fetched = batch.servers.len();
            vms.extend(
                batch
                    .servers
                    .into_iter()
                    .filter(ServerRecord::is_managed)
                    .map(|server| server.into_vm(zone)),
            );
            if fetched < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        debug!(zone = %zone, count = vms.len(), "listed managed servers");
        Ok(vms)
    }

    /// Deletes a server. Running servers are terminated, which also removes
    /// their volumes; stopped ones are deleted directly.
    pub(in crate::scaleway) async fn delete_vm(&self, id: &str) -> Result<(), ProviderError> {
        let (server, zone) = match self.fetch_server(id).await {
            Ok(found) => found,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(vm = id, "server already gone");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let context = Context::vm(id, &zone);
        let outcome = if server.allows("terminate") {
            self.api
                .perform_instance_action_async(&zone, &server.id, "terminate")
                .await
                .map(drop)
        } else {
            self.api
                .delete_instance_async(&zone, &server.id)
                .await
                .map(drop)
        };

        match outcome.map_err(|err| error::classify_sdk_error(err, context)) {
            Ok(()) => {
                info!(vm = id, state = %server.state, "server deletion requested");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
