//! Sprites REST API records.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::provider::{Vm, VmStatus};

/// Sprites have no region or hardware class of their own.
const REGION: &str = "sprites";
const HARDWARE: &str = "sprite";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SpriteStatus {
    Cold,
    Warm,
    Running,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct Sprite {
    #[serde(default)]
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) status: SpriteStatus,
    #[serde(default)]
    pub(crate) url: String,
    #[serde(default)]
    pub(crate) created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreateSpriteRequest<'a> {
    pub(crate) name: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ListSpritesResponse {
    #[serde(default)]
    pub(crate) sprites: Vec<Sprite>,
    #[serde(default)]
    pub(crate) has_more: bool,
    #[serde(default)]
    pub(crate) next_continuation_token: Option<String>,
}

impl SpriteStatus {
    /// Cold sprites are hibernated and wake on the first exec, so every
    /// known state is usable.
    pub(crate) const fn vm_status(self) -> VmStatus {
        match self {
            Self::Cold | Self::Warm | Self::Running => VmStatus::Running,
            Self::Unknown => VmStatus::Provisioning,
        }
    }
}

impl Sprite {
    /// Public host of the sprite, falling back to its name.
    pub(crate) fn address(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| self.name.clone())
    }

    pub(crate) fn into_vm(self) -> Vm {
        Vm {
            address: self.address(),
            status: self.status.vm_status(),
            created_at: self.created_at,
            id: self.name.clone(),
            name: self.name,
            region: REGION.to_owned(),
            hardware: HARDWARE.to_owned(),
        }
    }
}
