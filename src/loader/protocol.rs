//! Wire protocol types for the server's manifest+directive response
//! (`spec.md` §6 "Wire protocol").

use crate::catalog::model::ManifestFilters;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AssetManifestEntry {
    pub key: String,
    pub url: String,
    #[serde(rename = "expectedHash")]
    pub expected_hash: String,
    #[serde(rename = "assetType")]
    pub asset_type: String,
    #[serde(rename = "isLaunchAsset", default)]
    pub is_launch_asset: bool,
}

/// The `manifest` part of the response — describes one `UpdateEntity`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ManifestPart {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "runtimeVersion")]
    pub runtime_version: String,
    pub assets: Vec<AssetManifestEntry>,
}

/// The `directive` part of the response.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum Directive {
    #[serde(rename = "noUpdateAvailable")]
    NoUpdateAvailable,
    #[serde(rename = "rollBackToEmbedded")]
    RollBackToEmbedded {
        #[serde(rename = "commitTime")]
        commit_time: i64,
    },
}

/// A multipart response with zero or more typed parts — the engine
/// tolerates either part being absent; if both are absent this is
/// treated as `NoUpdateAvailable` (`spec.md` §6).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerResponse {
    pub manifest: Option<ManifestPart>,
    pub directive: Option<Directive>,
    pub manifest_filters: ManifestFilters,
}

impl ServerResponse {
    pub fn effective_directive(&self) -> Directive {
        self.directive.clone().unwrap_or(Directive::NoUpdateAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_is_treated_as_no_update() {
        let response = ServerResponse::default();
        assert_eq!(response.effective_directive(), Directive::NoUpdateAvailable);
    }

    #[test]
    fn rollback_directive_round_trips_through_json() {
        let json = r#"{"type": "rollBackToEmbedded", "commitTime": 400}"#;
        let directive: Directive = serde_json::from_str(json).unwrap();
        assert_eq!(directive, Directive::RollBackToEmbedded { commit_time: 400 });
    }
}
