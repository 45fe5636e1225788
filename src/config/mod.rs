//! Engine configuration.
//!
//! Priority (highest to lowest): explicit values passed to
//! [`UpdatesConfig::new`] > `{updates_dir}/config.toml` > built-in
//! defaults — the same layering `clawd`'s `DaemonConfig` uses for its
//! TOML file.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_LAUNCH_WAIT_MS: u64 = 0;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Policy for running the Loader on cold start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckOnLaunch {
    Always,
    ErrorRecoveryOnly,
    Never,
    WifiOnly,
}

impl Default for CheckOnLaunch {
    fn default() -> Self {
        CheckOnLaunch::Always
    }
}

/// `{updates_dir}/config.toml` — every field is an optional override.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    is_enabled: Option<bool>,
    update_url: Option<String>,
    scope_key: Option<String>,
    runtime_version: Option<String>,
    launch_wait_ms: Option<u64>,
    check_on_launch: Option<CheckOnLaunch>,
    request_headers: Option<HashMap<String, String>>,
    has_embedded_update: Option<bool>,
    request_timeout_secs: Option<u64>,
}

fn load_toml(updates_dir: &Path) -> Option<TomlConfig> {
    let path = updates_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// Recognized configuration keys for the update engine (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct UpdatesConfig {
    pub is_enabled: bool,
    pub update_url: Option<String>,
    pub scope_key: Option<String>,
    pub runtime_version: String,
    pub updates_dir: PathBuf,
    pub launch_wait_ms: u64,
    pub check_on_launch: CheckOnLaunch,
    pub request_headers: HashMap<String, String>,
    pub has_embedded_update: bool,
    pub request_timeout_secs: u64,
}

impl UpdatesConfig {
    /// Build config from explicit overrides plus the on-disk TOML file.
    ///
    /// Returns `ConfigInvalid` if `is_enabled` is true but `update_url`
    /// or `scope_key` is missing — the only configuration error the
    /// engine treats as fatal (`spec.md` §7).
    pub fn new(
        updates_dir: PathBuf,
        runtime_version: String,
        is_enabled: Option<bool>,
        update_url: Option<String>,
        scope_key: Option<String>,
        launch_wait_ms: Option<u64>,
    ) -> crate::errors::Result<Self> {
        let toml = load_toml(&updates_dir).unwrap_or_default();

        let is_enabled = is_enabled.or(toml.is_enabled).unwrap_or(true);
        let update_url = update_url.or(toml.update_url);
        let scope_key = scope_key.or(toml.scope_key);
        let launch_wait_ms = launch_wait_ms
            .or(toml.launch_wait_ms)
            .unwrap_or(DEFAULT_LAUNCH_WAIT_MS);
        let check_on_launch = toml.check_on_launch.unwrap_or_default();
        let request_headers = toml.request_headers.unwrap_or_default();
        let has_embedded_update = toml.has_embedded_update.unwrap_or(true);
        let request_timeout_secs = toml
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        if is_enabled && (update_url.is_none() || scope_key.is_none()) {
            return Err(crate::errors::UpdatesError::ConfigInvalid(
                "updateUrl and scopeKey are required when isEnabled=true".to_string(),
            ));
        }

        Ok(Self {
            is_enabled,
            update_url,
            scope_key,
            runtime_version,
            updates_dir,
            launch_wait_ms,
            check_on_launch,
            request_headers,
            has_embedded_update,
            request_timeout_secs,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.updates_dir.join("expo-updates.db")
    }

    pub fn asset_store_dir(&self) -> PathBuf {
        self.updates_dir.join(".expo-internal")
    }
}
