//! Protocol client that fetches a manifest+directive, validates it,
//! downloads missing assets, and writes them atomically into the Catalog
//! and FileStore (`spec.md` §4.2).

pub mod protocol;

use crate::catalog::model::{AssetEntity, UpdateAssetLink, UpdateEntity};
use crate::catalog::Catalog;
use crate::config::UpdatesConfig;
use crate::errors::UpdatesError;
use crate::file_store::FileStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use protocol::{AssetManifestEntry, Directive, ManifestPart, ServerResponse};

/// Default bound on concurrent asset downloads (`spec.md` §5).
pub const DEFAULT_IO_PARALLELISM: usize = 4;

/// Abstracts the HTTP transport so the Loader can be exercised in tests
/// without a live server — the same seam the host daemon draws around
/// `reqwest::Client` in its self-updater (`update::build_client`).
#[async_trait]
pub trait ManifestServerClient: Send + Sync {
    async fn fetch(&self, update_url: &str, headers: HashMap<String, String>) -> Result<ServerResponse>;
}

pub struct ReqwestManifestServerClient {
    client: reqwest::Client,
}

impl ReqwestManifestServerClient {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ManifestServerClient for ReqwestManifestServerClient {
    /// Issues a single GET and parses the JSON body's optional `manifest`
    /// and `directive` keys, plus the `expo-manifest-filters` response
    /// header — a textual rendering of the multipart response described
    /// in `spec.md` §6 that keeps "zero or more parts" and "tolerate
    /// either part being absent" without requiring a MIME multipart
    /// parser for a single-request protocol.
    async fn fetch(&self, update_url: &str, headers: HashMap<String, String>) -> Result<ServerResponse> {
        let mut request = self.client.get(update_url);
        for (k, v) in &headers {
            request = request.header(k, v);
        }
        let response = request
            .send()
            .await
            .map_err(|e| UpdatesError::NetworkFailure(format!("manifest request failed: {e}")))?;
        let response = response.error_for_status().map_err(|e| {
            UpdatesError::NetworkFailure(format!("update server returned an error status: {e}"))
        })?;

        let manifest_filters = response
            .headers()
            .get("expo-manifest-filters")
            .and_then(|v| v.to_str().ok())
            .map(crate::selection_policy::parse_manifest_filters_header)
            .unwrap_or_default();

        #[derive(serde::Deserialize)]
        struct Body {
            manifest: Option<ManifestPart>,
            directive: Option<Directive>,
        }

        let body: Body = response
            .json()
            .await
            .map_err(|e| UpdatesError::NetworkFailure(format!("failed to parse manifest response body: {e}")))?;

        Ok(ServerResponse {
            manifest: body.manifest,
            directive: body.directive,
            manifest_filters,
        })
    }
}

/// Final outcome of one `Loader::load` invocation.
#[derive(Debug, Clone)]
pub struct LoaderResult {
    pub update: Option<UpdateEntity>,
    pub directive: Directive,
}

/// Callbacks invoked synchronously (i.e. awaited before the Loader
/// proceeds) at each stage of `spec.md` §4.2.
#[async_trait]
pub trait LoaderCallback: Send + Sync {
    /// Lets the caller veto asset download for a manifest that was
    /// fetched. Returning `false` behaves as if no manifest was present.
    async fn on_update_response_loaded(&self, response: &ServerResponse) -> bool;

    async fn on_asset_loaded(&self, asset_key: &str, successful: usize, failed: usize, total: usize);

    async fn on_success(&self, result: &LoaderResult);

    async fn on_failure(&self, error: &anyhow::Error);
}

pub struct Loader {
    config: Arc<UpdatesConfig>,
    catalog: Arc<Catalog>,
    file_store: Arc<FileStore>,
    server_client: Arc<dyn ManifestServerClient>,
    http_client: reqwest::Client,
    io_parallelism: usize,
}

impl Loader {
    pub fn new(
        config: Arc<UpdatesConfig>,
        catalog: Arc<Catalog>,
        file_store: Arc<FileStore>,
        server_client: Arc<dyn ManifestServerClient>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build asset HTTP client")?;
        Ok(Self {
            config,
            catalog,
            file_store,
            server_client,
            http_client,
            io_parallelism: DEFAULT_IO_PARALLELISM,
        })
    }

    /// Execute the full Loader protocol (`spec.md` §4.2, steps 1–7).
    pub async fn load(
        &self,
        cb: &dyn LoaderCallback,
        previously_launched_update_id: Option<&str>,
    ) -> Result<()> {
        let update_url = self
            .config
            .update_url
            .clone()
            .context("Loader requires a configured updateUrl")?;

        // Step 1: compose headers from persisted manifest_metadata + runtime
        // version + prior launched update id.
        let mut headers = self.config.request_headers.clone();
        headers.insert(
            "expo-runtime-version".to_string(),
            self.config.runtime_version.clone(),
        );
        if let Some(scope_key) = &self.config.scope_key {
            headers.insert("expo-scope-key".to_string(), scope_key.clone());
        }
        if let Some(id) = previously_launched_update_id {
            headers.insert("expo-current-update-id".to_string(), id.to_string());
        }
        for (k, v) in self.catalog.get_all_extra_params().await? {
            headers.entry(k).or_insert(v);
        }

        // Step 2: single GET for manifest + directive.
        let response = match self.server_client.fetch(&update_url, headers).await {
            Ok(r) => r,
            Err(e) => {
                cb.on_failure(&e).await;
                return Err(e);
            }
        };

        // Step 3: let the caller veto asset download.
        let should_download = cb.on_update_response_loaded(&response).await;

        // Step 4: a RollBackToEmbedded directive skips asset fetch entirely.
        if let Directive::RollBackToEmbedded { commit_time } = response.effective_directive() {
            info!(commit_time, "rollback directive received");
            let result = LoaderResult {
                update: None,
                directive: Directive::RollBackToEmbedded { commit_time },
            };
            cb.on_success(&result).await;
            return Ok(());
        }

        let Some(manifest) = response.manifest.clone().filter(|_| should_download) else {
            debug!("no update available");
            let result = LoaderResult {
                update: None,
                directive: Directive::NoUpdateAvailable,
            };
            cb.on_success(&result).await;
            return Ok(());
        };

        // Step 5: download missing/mismatched assets, bounded parallelism.
        match self.download_assets(cb, &manifest).await {
            Ok((assets, links)) => {
                // Step 6: commit update + assets + links, flip to Ready.
                let scope_key = self.config.scope_key.clone().unwrap_or_default();
                let update = UpdateEntity::new_pending(
                    manifest.id.clone(),
                    manifest.created_at,
                    manifest.runtime_version.clone(),
                    scope_key,
                    serde_json::to_value(&manifest)?,
                    response.manifest_filters.clone(),
                );

                if let Err(e) = self.catalog.commit_loaded_update(&update, &assets, &links).await {
                    let e = e.context("failed to commit loaded update to catalog");
                    cb.on_failure(&e).await;
                    return Err(e);
                }

                let mut committed = update;
                committed.status = crate::catalog::UpdateStatus::Ready;
                committed.last_accessed_at = Utc::now();

                // Step 7.
                let result = LoaderResult {
                    update: Some(committed),
                    directive: Directive::NoUpdateAvailable,
                };
                cb.on_success(&result).await;
                Ok(())
            }
            Err(e) => {
                // Partially-downloaded assets stay on disk (content-addressed,
                // safe to reuse) — the update row is never inserted, so it's
                // hidden from SelectionPolicy (`spec.md` §4.2 failure semantics).
                warn!(update_id = %manifest.id, err = %e, "asset download failed — update left unreferenced");
                cb.on_failure(&e).await;
                Err(e)
            }
        }
    }

    async fn download_assets(
        &self,
        cb: &dyn LoaderCallback,
        manifest: &ManifestPart,
    ) -> Result<(Vec<AssetEntity>, Vec<UpdateAssetLink>)> {
        let total = manifest.assets.len();
        let successful = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(Semaphore::new(self.io_parallelism.max(1)));

        let mut join_set: JoinSet<Result<(AssetManifestEntry, Result<()>)>> = JoinSet::new();
        for asset in manifest.assets.clone() {
            let semaphore = Arc::clone(&semaphore);
            let file_store = Arc::clone(&self.file_store);
            let http_client = self.http_client.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.context("semaphore closed")?;
                let result = file_store
                    .download_and_store(&http_client, &asset.url, &asset.expected_hash)
                    .await
                    .map(|_| ());
                Ok((asset, result))
            });
        }

        let mut assets = Vec::with_capacity(total);
        let mut links = Vec::with_capacity(total);
        let mut first_error: Option<anyhow::Error> = None;

        while let Some(joined) = join_set.join_next().await {
            let (asset, result) = joined.context("asset download task panicked")??;
            match result {
                Ok(()) => {
                    successful.fetch_add(1, Ordering::SeqCst);
                    assets.push(AssetEntity {
                        key: asset.key.clone(),
                        asset_type: asset.asset_type.clone(),
                        url: Some(asset.url.clone()),
                        expected_hash: asset.expected_hash.clone(),
                        downloaded_at: Some(Utc::now()),
                        embedded_asset_filename: None,
                        marked_for_deletion: false,
                    });
                    links.push(UpdateAssetLink {
                        update_id: manifest.id.clone(),
                        asset_key: asset.key.clone(),
                        is_launch_asset: asset.is_launch_asset,
                    });
                }
                Err(e) => {
                    failed.fetch_add(1, Ordering::SeqCst);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }

            cb.on_asset_loaded(
                &asset.key,
                successful.load(Ordering::SeqCst),
                failed.load(Ordering::SeqCst),
                total,
            )
            .await;
        }

        if let Some(e) = first_error {
            join_set.abort_all();
            return Err(e);
        }

        Ok((assets, links))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct FakeServerClient {
        response: ServerResponse,
    }

    #[async_trait]
    impl ManifestServerClient for FakeServerClient {
        async fn fetch(&self, _update_url: &str, _headers: HashMap<String, String>) -> Result<ServerResponse> {
            Ok(self.response.clone())
        }
    }

    #[derive(Default)]
    struct RecordingCallback {
        successes: Mutex<Vec<LoaderResult>>,
        failures: Mutex<usize>,
    }

    #[async_trait]
    impl LoaderCallback for RecordingCallback {
        async fn on_update_response_loaded(&self, _response: &ServerResponse) -> bool {
            true
        }

        async fn on_asset_loaded(&self, _asset_key: &str, _successful: usize, _failed: usize, _total: usize) {}

        async fn on_success(&self, result: &LoaderResult) {
            self.successes.lock().await.push(result.clone());
        }

        async fn on_failure(&self, _error: &anyhow::Error) {
            *self.failures.lock().await += 1;
        }
    }

    async fn new_loader(response: ServerResponse) -> Loader {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            UpdatesConfig::new(
                dir.path().to_path_buf(),
                "1.0.0".to_string(),
                Some(true),
                Some("https://example.com/updates".to_string()),
                Some("scope".to_string()),
                None,
            )
            .unwrap(),
        );
        let catalog = Arc::new(Catalog::open_in_memory().await.unwrap());
        let file_store = Arc::new(FileStore::open(dir.path().join(".expo-internal")).await.unwrap());
        let server_client = Arc::new(FakeServerClient { response });
        Loader::new(config, catalog, file_store, server_client).unwrap()
    }

    #[tokio::test]
    async fn no_manifest_and_no_directive_is_treated_as_no_update() {
        let loader = new_loader(ServerResponse::default()).await;
        let cb = RecordingCallback::default();
        loader.load(&cb, None).await.unwrap();

        let successes = cb.successes.lock().await;
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].directive, Directive::NoUpdateAvailable);
        assert!(successes[0].update.is_none());
    }

    #[tokio::test]
    async fn rollback_directive_skips_asset_fetch() {
        let response = ServerResponse {
            manifest: None,
            directive: Some(Directive::RollBackToEmbedded { commit_time: 400 }),
            manifest_filters: HashMap::new(),
        };
        let loader = new_loader(response).await;
        let cb = RecordingCallback::default();
        loader.load(&cb, None).await.unwrap();

        let successes = cb.successes.lock().await;
        assert_eq!(successes.len(), 1);
        assert_eq!(
            successes[0].directive,
            Directive::RollBackToEmbedded { commit_time: 400 }
        );
    }

    #[tokio::test]
    async fn manifest_with_no_assets_commits_as_ready() {
        let response = ServerResponse {
            manifest: Some(ManifestPart {
                id: "u1".to_string(),
                created_at: 200,
                runtime_version: "1.0.0".to_string(),
                assets: vec![],
            }),
            directive: None,
            manifest_filters: HashMap::new(),
        };
        let loader = new_loader(response).await;
        let cb = RecordingCallback::default();
        loader.load(&cb, None).await.unwrap();

        let update = loader.catalog.get_update("u1").await.unwrap().unwrap();
        assert_eq!(update.status, crate::catalog::UpdateStatus::Ready);

        let successes = cb.successes.lock().await;
        assert_eq!(successes[0].update.as_ref().unwrap().id, "u1");
    }
}
