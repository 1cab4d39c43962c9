//! Translation of Scaleway SDK and HTTP failures into [`ProviderError`].

use reqwest::StatusCode;
use scaleway_rs::ScalewayError;
use serde::Deserialize;

use crate::provider::ProviderError;

use super::PROVIDER_NAME;

/// What the provider was doing when the failure happened. Used to phrase
/// not-found and instance-type errors.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Context<'a> {
    pub(crate) resource_id: &'a str,
    pub(crate) instance_type: Option<&'a str>,
    pub(crate) zone: &'a str,
}

impl<'a> Context<'a> {
    pub(crate) const fn vm(resource_id: &'a str, zone: &'a str) -> Self {
        Self {
            resource_id,
            instance_type: None,
            zone,
        }
    }

    pub(crate) const fn creating(name: &'a str, instance_type: &'a str, zone: &'a str) -> Self {
        Self {
            resource_id: name,
            instance_type: Some(instance_type),
            zone,
        }
    }
}

/// Error body returned by Scaleway APIs.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub(crate) struct ApiErrorBody {
    #[serde(rename = "type", default)]
    pub(crate) etype: String,
    #[serde(default)]
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) resource: Option<String>,
    #[serde(default)]
    pub(crate) resource_id: Option<String>,
}

impl From<scaleway_rs::ScalewayApiError> for ApiErrorBody {
    fn from(value: scaleway_rs::ScalewayApiError) -> Self {
        Self {
            etype: value.etype,
            message: value.message,
            resource: value.resource,
            resource_id: value.resource_id,
        }
    }
}

fn is_instance_type_error(api_err: &ApiErrorBody, instance_type: &str) -> bool {
    matches!(api_err.resource.as_deref(), Some("commercial_type"))
        || api_err
            .resource_id
            .as_deref()
            .is_some_and(|id| id == instance_type)
        || (api_err.etype == "invalid_arguments"
            && api_err
                .message
                .to_ascii_lowercase()
                .contains("commercial_type"))
}

/// Classifies a structured API error.
pub(crate) fn classify_api_error(api_err: &ApiErrorBody, context: Context<'_>) -> ProviderError {
    if let Some(instance_type) = context.instance_type
        && is_instance_type_error(api_err, instance_type)
    {
        return ProviderError::provision(format!(
            "instance type '{instance_type}' not available in zone {}",
            context.zone
        ));
    }
    match api_err.etype.as_str() {
        "denied_authentication" | "permissions_denied" | "authentication_error" => {
            ProviderError::AuthFailed {
                provider: PROVIDER_NAME.to_owned(),
                message: api_err.message.clone(),
            }
        }
        "not_found" | "unknown_resource" => ProviderError::vm_not_found(context.resource_id),
        "quotas_exceeded" | "out_of_stock" => ProviderError::QuotaExceeded {
            provider: PROVIDER_NAME.to_owned(),
            message: api_err.message.clone(),
        },
        other => ProviderError::provision(format!(
            "{PROVIDER_NAME} {other}: {}",
            api_err.message
        )),
    }
}

/// Classifies an SDK error.
pub(crate) fn classify_sdk_error(err: ScalewayError, context: Context<'_>) -> ProviderError {
    match err {
        ScalewayError::Api(api_err) => classify_api_error(&ApiErrorBody::from(api_err), context),
        other => ProviderError::provision(format!("{PROVIDER_NAME}: {other}")),
    }
}

/// Classifies a non-success HTTP response, preferring the structured error
/// body when one is present.
pub(crate) fn classify_response(status: StatusCode, body: &[u8], context: Context<'_>) -> ProviderError {
    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(api_err) if status != StatusCode::UNAUTHORIZED && !api_err.etype.is_empty() => {
            classify_api_error(&api_err, context)
        }
        _ => ProviderError::from_http_status(
            PROVIDER_NAME,
            context.resource_id,
            status.as_u16(),
            &String::from_utf8_lossy(body),
        ),
    }
}

/// No image under `label` is usable for `arch` in `zone`.
pub(crate) fn image_not_found(label: &str, arch: &str, zone: &str) -> ProviderError {
    ProviderError::provision(format!(
        "image '{label}' (arch {arch}) not found in zone {zone}"
    ))
}

/// Wraps a transport failure.
pub(crate) fn transport(err: &reqwest::Error) -> ProviderError {
    ProviderError::provision(format!("{PROVIDER_NAME} request failed: {err}"))
}
