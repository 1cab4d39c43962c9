//! Wire records for the Scaleway Instances API and their mapping onto
//! [`Vm`] snapshots.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::provider::{Vm, VmStatus};

/// Public address entry attached to a server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct PublicIp {
    pub(crate) address: String,
}

/// Subset of the server resource the provider reads.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct ServerRecord {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) commercial_type: String,
    #[serde(default)]
    pub(crate) creation_date: Option<String>,
    #[serde(default)]
    pub(crate) zone: String,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    #[serde(default)]
    pub(crate) allowed_actions: Vec<String>,
    #[serde(default)]
    pub(crate) public_ip: Option<PublicIp>,
    #[serde(default)]
    pub(crate) public_ips: Vec<PublicIp>,
}

#[derive(Deserialize)]
pub(crate) struct ServerEnvelope {
    pub(crate) server: ServerRecord,
}

#[derive(Deserialize)]
pub(crate) struct ServerList {
    #[serde(default)]
    pub(crate) servers: Vec<ServerRecord>,
}

impl ServerRecord {
    /// First public IPv4 or routed address, or an empty string.
    pub(crate) fn address(&self) -> String {
        self.public_ip
            .iter()
            .chain(self.public_ips.iter())
            .map(|ip| ip.address.trim())
            .find(|address| !address.is_empty())
            .unwrap_or_default()
            .to_owned()
    }

    pub(crate) fn allows(&self, action: &str) -> bool {
        self.allowed_actions.iter().any(|allowed| allowed == action)
    }

    pub(crate) fn is_managed(&self) -> bool {
        self.tags.iter().any(|tag| tag == super::MANAGED_TAG)
    }

    /// Converts the record into a [`Vm`]. `zone` is used when the record
    /// omits its own.
    pub(crate) fn into_vm(self, zone: &str) -> Vm {
        let region = if self.zone.is_empty() {
            zone.to_owned()
        } else {
            self.zone.clone()
        };
        let address = self.address();
        Vm {
            id: server_ref_id(&region, &self.id),
            status: status_for_state(&self.state),
            created_at: self.creation_date.as_deref().and_then(parse_timestamp),
            name: self.name,
            address,
            region,
            hardware: self.commercial_type,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|stamp| stamp.with_timezone(&Utc))
}

/// Maps a Scaleway server state onto [`VmStatus`].
pub(crate) fn status_for_state(state: &str) -> VmStatus {
    match state {
        "running" => VmStatus::Running,
        "starting" => VmStatus::Starting,
        "stopping" => VmStatus::Stopping,
        "stopped" | "stopped in place" => VmStatus::Stopped,
        "locked" => VmStatus::Failed,
        _ => VmStatus::Provisioning,
    }
}

/// VM identifier carrying the zone, so later lookups need no extra context.
pub(crate) fn server_ref_id(zone: &str, server_id: &str) -> String {
    format!("{zone}/{server_id}")
}

/// Zone and server identifier decoded from a VM id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ServerRef<'a> {
    pub(crate) zone: &'a str,
    pub(crate) server_id: &'a str,
}

impl<'a> ServerRef<'a> {
    /// Splits `zone/server-id`. Bare server ids resolve in `default_zone`.
    pub(crate) fn parse(id: &'a str, default_zone: &'a str) -> Self {
        match id.split_once('/') {
            Some((zone, server_id)) if !zone.is_empty() => Self { zone, server_id },
            Some((_, server_id)) => Self {
                zone: default_zone,
                server_id,
            },
            None => Self {
                zone: default_zone,
                server_id: id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record(json: &str) -> ServerRecord {
        serde_json::from_str(json).unwrap_or_else(|err| panic!("parse record: {err}"))
    }

    #[rstest]
    #[case("running", VmStatus::Running)]
    #[case("starting", VmStatus::Starting)]
    #[case("stopping", VmStatus::Stopping)]
    #[case("stopped", VmStatus::Stopped)]
    #[case("stopped in place", VmStatus::Stopped)]
    #[case("locked", VmStatus::Failed)]
    #[case("", VmStatus::Provisioning)]
    fn maps_server_states(#[case] state: &str, #[case] expected: VmStatus) {
        assert_eq!(status_for_state(state), expected);
    }

    #[rstest]
    #[case("fr-par-2/abc", "fr-par-2", "abc")]
    #[case("abc", "fr-par-1", "abc")]
    #[case("/abc", "fr-par-1", "abc")]
    fn parses_server_refs(#[case] id: &str, #[case] zone: &str, #[case] server_id: &str) {
        let parsed = ServerRef::parse(id, "fr-par-1");
        assert_eq!(parsed, ServerRef { zone, server_id });
    }

    #[test]
    fn record_becomes_vm_with_zone_qualified_id() {
        let vm = record(
            r#"{
                "id": "11111111-2222",
                "name": "dev-box",
                "state": "running",
                "commercial_type": "DEV1-S",
                "creation_date": "2025-03-01T10:00:00.123456+00:00",
                "zone": "nl-ams-1",
                "tags": ["drydock"],
                "public_ip": {"address": "51.15.1.2"}
            }"#,
        )
        .into_vm("fr-par-1");

        assert_eq!(vm.id, "nl-ams-1/11111111-2222");
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.address, "51.15.1.2");
        assert_eq!(vm.region, "nl-ams-1");
        assert_eq!(vm.hardware, "DEV1-S");
        assert!(vm.created_at.is_some());
    }

    #[test]
    fn routed_addresses_are_used_when_public_ip_is_absent() {
        let server = record(
            r#"{"id": "a", "public_ip": null, "public_ips": [{"address": "2001:db8::1"}]}"#,
        );
        assert_eq!(server.address(), "2001:db8::1");
        assert_eq!(server.into_vm("fr-par-1").region, "fr-par-1");
    }

    #[test]
    fn unparseable_creation_date_is_dropped() {
        let vm = record(r#"{"id": "a", "creation_date": "yesterday"}"#).into_vm("z");
        assert_eq!(vm.created_at, None);
        assert!(!vm.has_address());
    }

    #[test]
    fn managed_tag_is_detected() {
        assert!(record(r#"{"id": "a", "tags": ["x", "drydock"]}"#).is_managed());
        assert!(!record(r#"{"id": "a", "tags": ["ephemeral"]}"#).is_managed());
    }
}
