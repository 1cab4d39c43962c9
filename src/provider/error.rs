//! Failure vocabulary shared by every provider.
//!
//! Backends translate HTTP status codes and SDK errors into
//! [`ProviderError`] at their boundary so callers branch on one set of
//! variants regardless of which cloud produced the failure.

use thiserror::Error;

/// Coarse classification of a [`ProviderError`], used for branching.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// The resource does not exist.
    NotFound,
    /// The provider rejected the credentials.
    AuthFailed,
    /// The account hit a quota or rate limit.
    QuotaExceeded,
    /// Any other provisioning failure.
    ProvisionFailed,
    /// A deadline elapsed.
    Timeout,
    /// The caller cancelled the operation.
    Cancelled,
}

/// Errors surfaced by provider operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when a VM or related resource does not exist.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Kind of resource that was looked up (for example `vm`).
        resource: String,
        /// Provider identifier that was requested.
        id: String,
    },
    /// Raised when the provider rejects the configured credentials.
    #[error("{provider} rejected the credentials: {message}")]
    AuthFailed {
        /// Provider that rejected the request.
        provider: String,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when the account has run out of capacity.
    #[error("{provider} quota exceeded: {message}")]
    QuotaExceeded {
        /// Provider that refused the request.
        provider: String,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised for every other provisioning failure.
    #[error("provisioning failed: {message}")]
    ProvisionFailed {
        /// Human-readable description of the failure.
        message: String,
    },
    /// Raised when an operation exceeds its deadline.
    #[error("timed out waiting for {action} on {id}")]
    Timeout {
        /// Operation being waited on.
        action: String,
        /// Provider identifier of the VM.
        id: String,
    },
    /// Raised when the caller cancels an operation. Backends never produce
    /// this variant themselves.
    #[error("{action} cancelled")]
    Cancelled {
        /// Operation that was cancelled.
        action: String,
    },
}

impl ProviderError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AuthFailed { .. } => ErrorKind::AuthFailed,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::ProvisionFailed { .. } => ErrorKind::ProvisionFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Shorthand for a missing VM.
    #[must_use]
    pub fn vm_not_found(id: &str) -> Self {
        Self::NotFound {
            resource: String::from("vm"),
            id: id.to_owned(),
        }
    }

    /// Shorthand for [`ProviderError::ProvisionFailed`].
    #[must_use]
    pub fn provision(message: impl Into<String>) -> Self {
        Self::ProvisionFailed {
            message: message.into(),
        }
    }

    /// Classifies a non-success HTTP response into the shared vocabulary.
    ///
    /// `401`/`403` map to [`ProviderError::AuthFailed`], `404` to
    /// [`ProviderError::NotFound`] for `id`, `429` or a body mentioning a
    /// quota to [`ProviderError::QuotaExceeded`], and everything else to
    /// [`ProviderError::ProvisionFailed`].
    #[must_use]
    pub fn from_http_status(provider: &str, id: &str, status: u16, body: &str) -> Self {
        let message = summarise_body(status, body);
        match status {
            401 | 403 => Self::AuthFailed {
                provider: provider.to_owned(),
                message,
            },
            404 => Self::vm_not_found(id),
            429 => Self::QuotaExceeded {
                provider: provider.to_owned(),
                message,
            },
            _ if body.to_ascii_lowercase().contains("quota") => Self::QuotaExceeded {
                provider: provider.to_owned(),
                message,
            },
            _ => Self::ProvisionFailed {
                message: format!("{provider} returned {message}"),
            },
        }
    }
}

fn summarise_body(status: u16, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(401, "", ErrorKind::AuthFailed)]
    #[case(403, "{\"message\":\"denied\"}", ErrorKind::AuthFailed)]
    #[case(404, "", ErrorKind::NotFound)]
    #[case(429, "slow down", ErrorKind::QuotaExceeded)]
    #[case(409, "instances quota reached for project", ErrorKind::QuotaExceeded)]
    #[case(500, "boom", ErrorKind::ProvisionFailed)]
    #[case(400, "invalid commercial_type", ErrorKind::ProvisionFailed)]
    fn classifies_http_status(#[case] status: u16, #[case] body: &str, #[case] kind: ErrorKind) {
        let err = ProviderError::from_http_status("scaleway", "vm-1", status, body);
        assert_eq!(err.kind(), kind, "status {status} classified as {err}");
    }

    #[test]
    fn not_found_keeps_requested_id() {
        let err = ProviderError::from_http_status("sprites", "box-7", 404, "");
        assert_eq!(err, ProviderError::vm_not_found("box-7"));
    }

    #[test]
    fn provision_failure_mentions_provider_and_body() {
        let err = ProviderError::from_http_status("sprites", "box-7", 502, " bad gateway ");
        assert_eq!(
            err.to_string(),
            "provisioning failed: sprites returned HTTP 502: bad gateway"
        );
    }
}
