//! Catalog row types (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of an [`UpdateEntity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Pending,
    Ready,
    Launchable,
    Embedded,
    /// Equivalent to `Ready` for a binary-compatibility window kept around
    /// by older catalogs; treated identically to `Ready` by every policy
    /// in this crate. Named `StatusReady0` in `spec.md` §3.
    StatusReady0,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Pending => "pending",
            UpdateStatus::Ready => "ready",
            UpdateStatus::Launchable => "launchable",
            UpdateStatus::Embedded => "embedded",
            UpdateStatus::StatusReady0 => "status_ready_0",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UpdateStatus::Pending),
            "ready" => Some(UpdateStatus::Ready),
            "launchable" => Some(UpdateStatus::Launchable),
            "embedded" => Some(UpdateStatus::Embedded),
            "status_ready_0" => Some(UpdateStatus::StatusReady0),
            _ => None,
        }
    }

    /// `Ready` and `StatusReady0` both mean "assets present and verified".
    pub fn is_ready_or_better(&self) -> bool {
        matches!(
            self,
            UpdateStatus::Ready
                | UpdateStatus::StatusReady0
                | UpdateStatus::Launchable
                | UpdateStatus::Embedded
        )
    }
}

/// One remotely-published payload (`spec.md` §3 `UpdateEntity`).
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEntity {
    pub id: String,
    pub commit_time: i64,
    pub runtime_version: String,
    pub scope_key: String,
    pub manifest: serde_json::Value,
    pub status: UpdateStatus,
    pub failed_launch_count: u64,
    pub successful_launch_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub manifest_filters: HashMap<String, String>,
}

impl UpdateEntity {
    pub fn new_pending(
        id: String,
        commit_time: i64,
        runtime_version: String,
        scope_key: String,
        manifest: serde_json::Value,
        manifest_filters: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            commit_time,
            runtime_version,
            scope_key,
            manifest,
            status: UpdateStatus::Pending,
            failed_launch_count: 0,
            successful_launch_count: 0,
            last_accessed_at: Utc::now(),
            manifest_filters,
        }
    }

    /// Excluded from launcher selection: has failed at least once and
    /// never launched successfully (`spec.md` §4.1).
    pub fn is_launch_excluded(&self) -> bool {
        self.failed_launch_count >= 1 && self.successful_launch_count == 0
    }
}

/// One file referenced by zero or more updates (`spec.md` §3 `AssetEntity`).
#[derive(Debug, Clone, PartialEq)]
pub struct AssetEntity {
    pub key: String,
    pub asset_type: String,
    pub url: Option<String>,
    pub expected_hash: String,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub embedded_asset_filename: Option<String>,
    pub marked_for_deletion: bool,
}

/// `UpdateAsset(updateId, assetKey, isLaunchAsset)` relation row.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateAssetLink {
    pub update_id: String,
    pub asset_key: String,
    pub is_launch_asset: bool,
}

/// Server-provided filters a given client evaluates against
/// `manifest_filters` (`spec.md` §6, "manifestFilters" header).
pub type ManifestFilters = HashMap<String, String>;
