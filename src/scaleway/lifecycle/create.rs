//! Server creation for the Scaleway provider.
//!
//! Scaleway servers must receive cloud-init user-data before first boot.
//! The creation request sets `stopped: true`, the payload is written to the
//! server's user-data store, and only then is the server powered on.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::provider::{CreateRequest, ProviderError, Vm, VmStatus};

use super::super::error::{self, Context};
use super::super::types::{ServerEnvelope, ServerRecord};
use super::super::{INSTANCE_API_BASE, MANAGED_TAG, ScalewayProvider};
use super::{HTTP_CLIENT, Placement};

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: Vec<String>,
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
}

impl<'a> CreateServerRequest<'a> {
    fn new(name: &'a str, placement: &'a Placement, image_id: &'a str) -> Self {
        Self {
            name,
            commercial_type: &placement.commercial_type,
            image: image_id,
            project: &placement.project_id,
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: server_tags(name),
            stopped: true,
            organization: placement.organization_id.as_deref(),
        }
    }
}

fn server_tags(name: &str) -> Vec<String> {
    vec![MANAGED_TAG.to_owned(), format!("{MANAGED_TAG}-session={name}")]
}

impl ScalewayProvider {
    pub(in crate::scaleway) async fn create_vm(
        &self,
        request: &CreateRequest,
    ) -> Result<Vm, ProviderError> {
        request
            .validate()
            .map_err(|err| ProviderError::provision(err.to_string()))?;
        let placement = Placement::for_request(&self.config, request);
        let image_id = self.resolve_image_id(&placement).await?;
        if let Some(key_id) = request.key_id.as_deref() {
            debug!(key_id, "project key registered; injected at first boot");
        }

        let server = self
            .create_server_stopped(&request.name, &placement, &image_id)
            .await?;
        info!(
            server = %server.id,
            zone = %placement.zone,
            commercial_type = %placement.commercial_type,
            "server created"
        );

        if let Err(err) = self.boot(request, &placement.zone, &server).await {
            warn!(server = %server.id, error = %err, "boot failed; deleting server");
            if let Err(cleanup) = self.api.delete_instance_async(&placement.zone, &server.id).await {
                warn!(server = %server.id, error = %cleanup, "cleanup after failed boot failed");
            }
            return Err(err);
        }

        let mut vm = server.into_vm(&placement.zone);
        if vm.status != VmStatus::Running {
            vm.status = VmStatus::Starting;
        }
        Ok(vm)
    }

    async fn boot(
        &self,
        request: &CreateRequest,
        zone: &str,
        server: &ServerRecord,
    ) -> Result<(), ProviderError> {
        if let Some(payload) = request.user_data.as_deref() {
            self.upload_cloud_init(zone, &server.id, payload).await?;
        }
        self.power_on_if_needed(zone, server).await
    }

    pub(in crate::scaleway) async fn power_on_if_needed(
        &self,
        zone: &str,
        server: &ServerRecord,
    ) -> Result<(), ProviderError> {
        if server.state == "running" {
            return Ok(());
        }

        if server.allows("poweron") {
            self.api
                .perform_instance_action_async(zone, &server.id, "poweron")
                .await
                .map_err(|err| error::classify_sdk_error(err, Context::vm(&server.id, zone)))?;
            return Ok(());
        }

        Err(ProviderError::provision(format!(
            "server {} in state {} cannot be powered on",
            server.id, server.state
        )))
    }

    /// Creates a Scaleway server in a stopped state.
    async fn create_server_stopped(
        &self,
        name: &str,
        placement: &Placement,
        image_id: &str,
    ) -> Result<ServerRecord, ProviderError> {
        let url = format!("{INSTANCE_API_BASE}/zones/{}/servers", placement.zone);
        let payload = CreateServerRequest::new(name, placement, image_id);
        let envelope: ServerEnvelope = self
            .send_json(
                HTTP_CLIENT.post(&url).json(&payload),
                Context::creating(name, &placement.commercial_type, &placement.zone),
            )
            .await?;
        Ok(envelope.server)
    }
}
