//! Unit tests for Scaleway lifecycle helpers.

use std::cell::RefCell;
use std::collections::HashMap;

use rstest::rstest;
use scaleway_rs::ScalewayImage;

use super::Placement;
use super::image::{ImageScope, search_images};
use crate::config::ScalewayConfig;
use crate::provider::{CreateRequest, ErrorKind, ProviderError};
use crate::scaleway::ScalewayProvider;
use crate::scaleway::types::ServerRecord;

struct ImageSpec<'a> {
    id: &'a str,
    arch: &'a str,
    state: &'a str,
    creation_date: &'a str,
}

fn image(spec: ImageSpec<'_>) -> ScalewayImage {
    ScalewayImage {
        id: spec.id.to_owned(),
        name: String::new(),
        arch: spec.arch.to_owned(),
        creation_date: spec.creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: spec.state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn available(id: &str, creation_date: &str) -> ScalewayImage {
    image(ImageSpec {
        id,
        arch: "x86_64",
        state: "available",
        creation_date,
    })
}

fn config() -> ScalewayConfig {
    ScalewayConfig {
        secret_key: String::from("dummy"),
        default_organization_id: None,
        default_project_id: String::from("proj"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_image: String::from("Ubuntu 24.04 Noble Numbat"),
        default_architecture: String::from("x86_64"),
    }
}

fn placement() -> Placement {
    Placement::for_request(
        &config(),
        &CreateRequest::builder("dev-box")
            .build()
            .unwrap_or_else(|err| panic!("request: {err}")),
    )
}

fn provider() -> ScalewayProvider {
    ScalewayProvider::new(config(), 22).unwrap_or_else(|err| panic!("provider: {err}"))
}

fn server(state: &str, allowed: &[&str]) -> ServerRecord {
    ServerRecord {
        id: String::from("srv-1"),
        name: String::from("dev-box"),
        state: state.to_owned(),
        commercial_type: String::from("DEV1-S"),
        creation_date: None,
        zone: String::from("fr-par-1"),
        tags: vec![String::from("drydock")],
        allowed_actions: allowed.iter().map(|action| (*action).to_owned()).collect(),
        public_ip: None,
        public_ips: Vec::new(),
    }
}

#[test]
fn placement_applies_request_overrides() {
    let request = CreateRequest::builder("dev-box")
        .region(Some(String::from("nl-ams-1")))
        .hardware(Some(String::from("PRO2-XS")))
        .image(Some(String::from("Debian Bookworm")))
        .build()
        .unwrap_or_else(|err| panic!("request: {err}"));

    let placement = Placement::for_request(&config(), &request);

    assert_eq!(placement.zone, "nl-ams-1");
    assert_eq!(placement.commercial_type, "PRO2-XS");
    assert_eq!(placement.image_label, "Debian Bookworm");
    assert_eq!(placement.architecture, "x86_64");
}

#[test]
fn placement_falls_back_to_configured_defaults() {
    let placement = placement();
    assert_eq!(placement.zone, "fr-par-1");
    assert_eq!(placement.commercial_type, "DEV1-S");
    assert_eq!(placement.image_label, "Ubuntu 24.04 Noble Numbat");
}

#[test]
fn newest_usable_skips_wrong_arch_or_state() {
    let images = vec![
        image(ImageSpec {
            id: "wrong-arch",
            arch: "arm64",
            state: "available",
            creation_date: "2025-06-01T00:00:00Z",
        }),
        image(ImageSpec {
            id: "wrong-state",
            arch: "x86_64",
            state: "creating",
            creation_date: "2025-05-01T00:00:00Z",
        }),
        available("oldest", "2024-12-01T00:00:00Z"),
        available("newest", "2025-02-01T00:00:00Z"),
    ];

    assert_eq!(placement().newest_usable(images), Some(String::from("newest")));
    assert_eq!(placement().newest_usable(Vec::new()), None);
}

#[tokio::test]
async fn search_stops_at_the_project_scope_when_it_has_a_match() {
    let searched = RefCell::new(Vec::new());

    let id = search_images(&placement(), |scope| {
        searched.borrow_mut().push(scope);
        async move {
            Ok(match scope {
                ImageScope::Project => vec![available("project-img", "2025-01-01T00:00:00Z")],
                ImageScope::Public => vec![available("public-img", "2025-02-01T00:00:00Z")],
            })
        }
    })
    .await
    .unwrap_or_else(|err| panic!("project image should resolve: {err}"));

    assert_eq!(id, "project-img");
    assert_eq!(searched.into_inner(), vec![ImageScope::Project]);
}

#[tokio::test]
async fn search_falls_back_to_public_when_project_images_are_unusable() {
    let id = search_images(&placement(), |scope| async move {
        Ok(match scope {
            ImageScope::Project => vec![image(ImageSpec {
                id: "arm-only",
                arch: "arm64",
                state: "available",
                creation_date: "2025-03-01T00:00:00Z",
            })],
            ImageScope::Public => vec![available("public-img", "2025-01-01T00:00:00Z")],
        })
    })
    .await
    .unwrap_or_else(|err| panic!("public fallback should resolve: {err}"));

    assert_eq!(id, "public-img");
}

#[tokio::test]
async fn search_reports_the_label_when_nothing_matches() {
    let err = search_images(&placement(), |_| async { Ok(Vec::new()) })
        .await
        .expect_err("empty catalogue should fail");

    assert_eq!(err.kind(), ErrorKind::ProvisionFailed);
    let message = err.to_string();
    assert!(message.contains("Ubuntu 24.04 Noble Numbat"), "{message}");
    assert!(message.contains("fr-par-1"), "{message}");
}

#[tokio::test]
async fn search_propagates_fetch_errors() {
    let err = search_images(&placement(), |_| async {
        Err(ProviderError::provision("boom"))
    })
    .await
    .expect_err("error should surface");

    assert_eq!(err, ProviderError::provision("boom"));
}

#[rstest]
#[case::default_zone("fr-par-1/srv-1", true)]
#[case::bare_id("srv-1", true)]
#[case::other_zone("nl-ams-1/srv-1", false)]
fn listing_covers_only_the_default_zone(#[case] id: &str, #[case] listed: bool) {
    assert_eq!(provider().lists_zone_of(id), listed);
}

#[tokio::test]
async fn power_on_if_needed_returns_ok_for_running() {
    let result = provider()
        .power_on_if_needed("fr-par-1", &server("running", &["poweroff"]))
        .await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn power_on_if_needed_errors_when_not_allowed() {
    let err = provider()
        .power_on_if_needed("fr-par-1", &server("locked", &[]))
        .await
        .expect_err("locked server cannot be powered on");
    assert!(err.to_string().contains("cannot be powered on"), "{err}");
}
