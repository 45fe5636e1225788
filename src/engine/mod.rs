//! Process-wide façade wiring every subsystem together (`spec.md` §4.6).
//!
//! One `Engine` per process, matching the host daemon's single
//! `AppContext` built once in `main.rs` and handed out by `Arc` clone —
//! here held behind a `std::sync::OnceLock` rather than constructed
//! explicitly by a caller-owned `main`, since `start` is specified as
//! idempotent and callable from host bridge glue that has no natural
//! place to stash an `Arc`.

use crate::build_data;
use crate::catalog::model::{AssetEntity, UpdateEntity, UpdateStatus};
use crate::catalog::Catalog;
use crate::config::{CheckOnLaunch, UpdatesConfig};
use crate::error_recovery::{ErrorRecovery, ErrorRecoveryCallback, RemoteLoadStatusHandle};
use crate::errors::{Result as EngineResult, UpdatesError};
use crate::file_store::FileStore;
use crate::host::{HostErrorBus, HostErrorStream, HostReloader};
use crate::loader::{Loader, LoaderCallback, LoaderResult, ManifestServerClient, ReqwestManifestServerClient};
use crate::loader::{Directive, ServerResponse};
use crate::loader_task::{LoaderTask, LoaderTaskCallback, LoaderTaskResult, RemoteUpdateStatus};
use crate::selection_policy::{
    DefaultLauncherPolicy, LauncherSelectionPolicy, LoaderSelectionPolicy, OneShotPolicy,
    ReaperSelectionPolicy, SelectionPolicy,
};
use crate::state_machine::{StateMachine, StateMachineEvent, StateMachineHandle, UpdateContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

/// Process-wide handle installed by [`Engine::start_global`].
static ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

/// The fallback payload shipped inside the app binary. Verifying its
/// signature and reading it off disk are both out of scope (`spec.md`
/// §1) — the host supplies the already-validated metadata.
#[derive(Debug, Clone)]
pub struct EmbeddedUpdate {
    pub id: String,
    pub commit_time: i64,
    pub runtime_version: String,
    pub manifest: serde_json::Value,
    pub launch_asset_filename: String,
    pub asset_hash: String,
}

#[derive(Debug, Clone)]
pub enum CheckForUpdateOutcome {
    NoUpdateAvailable,
    UpdateAvailable(UpdateEntity),
    RollBackToEmbedded { commit_time: i64 },
    Error(String),
}

#[derive(Debug, Clone)]
pub enum FetchUpdateOutcome {
    Success(UpdateEntity),
    Failure,
    RollBackToEmbedded { commit_time: i64 },
    Error(String),
}

#[derive(Debug, Clone)]
pub enum ReloadOutcome {
    Reloaded { launcher_update_id: String },
    NothingToLaunch,
}

pub struct Engine {
    config: Arc<UpdatesConfig>,
    embedded: EmbeddedUpdate,
    catalog: Arc<Catalog>,
    file_store: Arc<FileStore>,
    launcher_policy: Arc<OneShotPolicy<DefaultLauncherPolicy>>,
    selection_policy: Arc<SelectionPolicy>,
    server_client: Arc<dyn ManifestServerClient>,
    reloader: Arc<dyn HostReloader>,
    state_machine: StateMachine,
    error_recovery: ErrorRecovery,
    host_error_bus: Arc<HostErrorBus>,
    current_update_id: Mutex<String>,
    loader_result: Mutex<Option<LoaderTaskResult>>,
    loader_done: Notify,
    is_emergency_launch: AtomicBool,
}

impl Engine {
    /// Idempotent; initializes directories, runs the BuildData
    /// consistency check, and spawns the cold-start `LoaderTask`
    /// (`spec.md` §4.6). Intended to be called exactly once at process
    /// start by host bridge glue.
    pub async fn start(
        config: UpdatesConfig,
        embedded: EmbeddedUpdate,
        reloader: Arc<dyn HostReloader>,
    ) -> EngineResult<Arc<Self>> {
        let server_client: Arc<dyn ManifestServerClient> = Arc::new(
            ReqwestManifestServerClient::new(config.request_timeout_secs)
                .map_err(|e| UpdatesError::ConfigInvalid(e.to_string()))?,
        );
        Self::start_with_server_client(config, embedded, reloader, server_client).await
    }

    /// As [`start`](Self::start), but with the HTTP transport injected —
    /// the seam tests use to avoid a live server (`spec.md` §9 Design
    /// Notes, "testability").
    pub async fn start_with_server_client(
        config: UpdatesConfig,
        embedded: EmbeddedUpdate,
        reloader: Arc<dyn HostReloader>,
        server_client: Arc<dyn ManifestServerClient>,
    ) -> EngineResult<Arc<Self>> {
        let (catalog, file_store, is_emergency_launch) =
            match Self::open_storage(&config).await {
                Ok((catalog, file_store)) => (catalog, file_store, false),
                Err(e) => {
                    warn!(error = %e, "updates directory unavailable — entering emergency launch mode");
                    let catalog = Catalog::open_in_memory()
                        .await
                        .map_err(|e| UpdatesError::DirectoryUnavailable(e.to_string()))?;
                    let file_store = FileStore::open(std::env::temp_dir().join("expo-updates-emergency"))
                        .await
                        .map_err(|e| UpdatesError::DirectoryUnavailable(e.to_string()))?;
                    (catalog, file_store, true)
                }
            };

        let catalog = Arc::new(catalog);
        let file_store = Arc::new(file_store);

        if !is_emergency_launch {
            build_data::check_and_reconcile(&catalog, &config)
                .await
                .map_err(|e| UpdatesError::DirectoryUnavailable(e.to_string()))?;
        }

        if config.has_embedded_update {
            let asset = AssetEntity {
                key: embedded.asset_hash.clone(),
                asset_type: "bundle".to_string(),
                url: None,
                expected_hash: embedded.asset_hash.clone(),
                downloaded_at: None,
                embedded_asset_filename: Some(embedded.launch_asset_filename.clone()),
                marked_for_deletion: false,
            };
            let update = UpdateEntity {
                id: embedded.id.clone(),
                commit_time: embedded.commit_time,
                runtime_version: embedded.runtime_version.clone(),
                scope_key: config.scope_key.clone().unwrap_or_default(),
                manifest: embedded.manifest.clone(),
                status: UpdateStatus::Embedded,
                failed_launch_count: 0,
                successful_launch_count: 0,
                last_accessed_at: chrono::Utc::now(),
                manifest_filters: HashMap::new(),
            };
            if let Err(e) = catalog.insert_embedded_update(&update, &asset).await {
                warn!(error = %e, "failed to register embedded update");
            }
        }

        let launcher_policy = Arc::new(OneShotPolicy::new(DefaultLauncherPolicy));
        let selection_policy = Arc::new(SelectionPolicy {
            launcher: Box::new(Arc::clone(&launcher_policy)),
            loader: Box::new(crate::selection_policy::DefaultLoaderPolicy),
            reaper: Box::new(crate::selection_policy::DefaultReaperPolicy),
        });

        let config = Arc::new(config);
        let host_error_bus = Arc::new(HostErrorBus::new());
        let error_recovery = ErrorRecovery::new(
            (*catalog).clone(),
            Arc::clone(&selection_policy),
            crate::error_recovery::DEFAULT_SUCCESS_TIMEOUT_MS,
        );

        let engine = Arc::new(Self {
            config: Arc::clone(&config),
            embedded: embedded.clone(),
            catalog: Arc::clone(&catalog),
            file_store: Arc::clone(&file_store),
            launcher_policy,
            selection_policy: Arc::clone(&selection_policy),
            server_client: Arc::clone(&server_client),
            reloader: Arc::clone(&reloader),
            state_machine: StateMachine::spawn(),
            error_recovery,
            host_error_bus,
            current_update_id: Mutex::new(embedded.id.clone()),
            loader_result: Mutex::new(None),
            loader_done: Notify::new(),
            is_emergency_launch: AtomicBool::new(is_emergency_launch),
        });

        if is_emergency_launch {
            *engine.loader_result.lock().await = Some(LoaderTaskResult {
                launcher_update: None,
                is_up_to_date: true,
            });
            engine.loader_done.notify_waiters();
        } else {
            let engine_for_task = Arc::clone(&engine);
            tokio::spawn(async move {
                engine_for_task.run_cold_start().await;
            });
        }

        Ok(engine)
    }

    /// Starts the engine and installs it as the process-wide singleton
    /// (`spec.md` §4.6). Returns `ConfigInvalid` if called more than
    /// once per process — callers that need repeated `start` semantics
    /// (tests, multiple embedded apps in one process) should use
    /// [`start`](Self::start) directly and hold the returned `Arc`
    /// themselves instead.
    pub async fn start_global(
        config: UpdatesConfig,
        embedded: EmbeddedUpdate,
        reloader: Arc<dyn HostReloader>,
    ) -> EngineResult<Arc<Self>> {
        let engine = Self::start(config, embedded, reloader).await?;
        ENGINE
            .set(Arc::clone(&engine))
            .map_err(|_| UpdatesError::ConfigInvalid("engine already started in this process".to_string()))?;
        Ok(engine)
    }

    /// Returns the process-wide singleton installed by
    /// [`start_global`](Self::start_global), if any.
    pub fn global() -> Option<Arc<Self>> {
        ENGINE.get().cloned()
    }

    async fn open_storage(config: &UpdatesConfig) -> anyhow::Result<(Catalog, FileStore)> {
        let catalog = Catalog::open(&config.db_path()).await?;
        let file_store = FileStore::open(config.asset_store_dir()).await?;
        Ok((catalog, file_store))
    }

    async fn run_cold_start(self: Arc<Self>) {
        if !self.config.is_enabled {
            info!("updates disabled (isEnabled=false) — forcing embedded-only launch");
            self.finish_cold_start(LoaderTaskResult {
                launcher_update: None,
                is_up_to_date: true,
            })
            .await;
            return;
        }

        // `checkOnLaunch: Never`/`ErrorRecoveryOnly` both withhold the
        // *cold-start* remote check specifically (`spec.md` §6) —
        // `ErrorRecoveryOnly` still lets `ErrorRecovery`'s own post-launch
        // check run later, since that's a separate code path from this
        // one. Either way a previously downloaded ready update is still a
        // valid launcher; only the network half of `LoaderTask` is
        // skipped. `WifiOnly` has no network-type signal available in
        // this crate (no platform network-reachability dependency in the
        // stack) and is treated the same as `Always`.
        if matches!(
            self.config.check_on_launch,
            CheckOnLaunch::Never | CheckOnLaunch::ErrorRecoveryOnly
        ) {
            info!(check_on_launch = ?self.config.check_on_launch, "cold-start remote check skipped");
            let result = self.cached_launcher_result().await;
            self.finish_cold_start(result).await;
            return;
        }

        let loader_task = LoaderTask::new(
            Arc::clone(&self.config),
            Arc::clone(&self.catalog),
            Arc::clone(&self.file_store),
            Arc::clone(&self.selection_policy),
            Arc::clone(&self.server_client),
        );
        let callback = Arc::new(EngineLoaderTaskCallback {
            state_machine: self.state_machine.handle(),
            arm_timer: self.config.launch_wait_ms > 0,
            download_started: AtomicBool::new(false),
        });

        let result = loader_task.run(callback).await;
        let result = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "cold start loader task failed with no fallback");
                LoaderTaskResult {
                    launcher_update: None,
                    is_up_to_date: true,
                }
            }
        };

        self.finish_cold_start(result).await;
    }

    /// Picks the best already-downloaded candidate without touching the
    /// network — the cached-selection half of `LoaderTask::run`, reused
    /// for the `checkOnLaunch` paths that skip the remote fetch entirely.
    async fn cached_launcher_result(&self) -> LoaderTaskResult {
        let candidates = match self.catalog.list_candidates(&self.config.runtime_version).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to list cached candidates; serving embedded");
                return LoaderTaskResult {
                    launcher_update: None,
                    is_up_to_date: true,
                };
            }
        };
        let filters = self.catalog.get_all_extra_params().await.unwrap_or_default();
        let launcher_update = self
            .selection_policy
            .launcher
            .choose_launcher_update(&candidates, &self.config.runtime_version, &filters)
            .cloned();
        LoaderTaskResult {
            launcher_update,
            is_up_to_date: true,
        }
    }

    async fn finish_cold_start(&self, result: LoaderTaskResult) {
        if let Some(update) = &result.launcher_update {
            *self.current_update_id.lock().await = update.id.clone();
        }
        *self.loader_result.lock().await = Some(result);
        self.loader_done.notify_waiters();
    }

    /// **Blocking** in the sense `spec.md` §4.6 specifies: the caller's
    /// await point doesn't resume until the cold-start `LoaderTask`
    /// signals completion (or it already has). Returns the launch
    /// asset's absolute path, or `None` if the embedded payload should
    /// be used instead.
    pub async fn launch_asset_file(&self) -> Option<PathBuf> {
        loop {
            if let Some(result) = self.loader_result.lock().await.clone() {
                return self.resolve_launch_path(result).await;
            }
            self.loader_done.notified().await;
        }
    }

    async fn resolve_launch_path(&self, result: LoaderTaskResult) -> Option<PathBuf> {
        let update = result.launcher_update?;
        if update.id == self.embedded.id {
            return None;
        }
        let asset = match self.catalog.launch_asset_for_update(&update.id).await {
            Ok(Some(asset)) => asset,
            _ => return None,
        };
        match self.file_store.verify_on_disk(&asset.key).await {
            Ok(true) => Some(self.file_store.path_for(&asset.key)),
            Ok(false) => {
                let err = UpdatesError::AssetCorrupt(asset.key.clone());
                warn!(error = %err, update_id = %update.id, "launch asset missing or corrupt on disk; falling back to embedded");
                self.host_error_bus.report(err.to_string());
                None
            }
            Err(e) => {
                warn!(error = %e, update_id = %update.id, "failed to verify launch asset on disk; falling back to embedded");
                None
            }
        }
    }

    /// Valid only after [`launch_asset_file`](Self::launch_asset_file)
    /// returned `None` — the name of the embedded asset to load instead.
    pub fn bundle_asset_name(&self) -> Option<String> {
        Some(self.embedded.launch_asset_filename.clone())
    }

    pub fn is_emergency_launch(&self) -> bool {
        self.is_emergency_launch.load(Ordering::SeqCst)
    }

    pub fn subscribe_state(&self) -> tokio::sync::broadcast::Receiver<UpdateContext> {
        self.state_machine.handle().subscribe()
    }

    /// Fires a one-shot remote check without downloading assets, drives
    /// the `StateMachine`, and returns the outcome (`spec.md` §4.6). Per
    /// the Open Question resolution in `spec.md` §9, a terminal
    /// `StateMachine` event is posted on every path through this
    /// function, with no early return that skips it.
    pub async fn check_for_update(&self) -> CheckForUpdateOutcome {
        let handle = self.state_machine.handle();
        handle.post(StateMachineEvent::Check);

        let Some(update_url) = self.config.update_url.clone() else {
            handle.post(StateMachineEvent::CheckError {
                message: "no updateUrl configured".to_string(),
            });
            return CheckForUpdateOutcome::Error("no updateUrl configured".to_string());
        };

        let headers = self.build_headers().await;
        let response = match self.server_client.fetch(&update_url, headers).await {
            Ok(r) => r,
            Err(e) => {
                handle.post(StateMachineEvent::CheckError {
                    message: e.to_string(),
                });
                return CheckForUpdateOutcome::Error(e.to_string());
            }
        };

        let outcome = self.evaluate_check_response(&response).await;
        match &outcome {
            CheckForUpdateOutcome::NoUpdateAvailable => {
                handle.post(StateMachineEvent::CheckCompleteUnavailable);
            }
            CheckForUpdateOutcome::UpdateAvailable(update) => {
                handle.post(StateMachineEvent::CheckCompleteWithUpdate {
                    manifest: update.manifest.clone(),
                });
            }
            CheckForUpdateOutcome::RollBackToEmbedded { commit_time } => {
                handle.post(StateMachineEvent::CheckCompleteWithRollback {
                    commit_time: *commit_time,
                });
            }
            CheckForUpdateOutcome::Error(message) => {
                handle.post(StateMachineEvent::CheckError {
                    message: message.clone(),
                });
            }
        }
        outcome
    }

    async fn evaluate_check_response(&self, response: &ServerResponse) -> CheckForUpdateOutcome {
        let current_id = self.current_update_id.lock().await.clone();
        let Some(currently_launched) = self.catalog.get_update(&current_id).await.ok().flatten() else {
            return CheckForUpdateOutcome::Error(format!("unknown currently-launched update {current_id}"));
        };

        match response.effective_directive() {
            Directive::RollBackToEmbedded { commit_time } => {
                let Some(embedded) = self.catalog.get_update(&self.embedded.id).await.ok().flatten() else {
                    return CheckForUpdateOutcome::NoUpdateAvailable;
                };
                if self.selection_policy.loader.should_load_rollback_directive(
                    commit_time,
                    &embedded,
                    &currently_launched,
                    &response.manifest_filters,
                ) {
                    CheckForUpdateOutcome::RollBackToEmbedded { commit_time }
                } else {
                    CheckForUpdateOutcome::NoUpdateAvailable
                }
            }
            Directive::NoUpdateAvailable => match &response.manifest {
                Some(manifest) => {
                    let candidate = UpdateEntity::new_pending(
                        manifest.id.clone(),
                        manifest.created_at,
                        manifest.runtime_version.clone(),
                        self.config.scope_key.clone().unwrap_or_default(),
                        serde_json::to_value(manifest).unwrap_or_default(),
                        response.manifest_filters.clone(),
                    );
                    if self.selection_policy.loader.should_load_new_update(
                        &candidate,
                        &currently_launched,
                        &response.manifest_filters,
                    ) {
                        CheckForUpdateOutcome::UpdateAvailable(candidate)
                    } else {
                        CheckForUpdateOutcome::NoUpdateAvailable
                    }
                }
                None => CheckForUpdateOutcome::NoUpdateAvailable,
            },
        }
    }

    /// Runs a one-shot Loader to completion, persists results into the
    /// Catalog/FileStore, drives the `StateMachine`, and returns the
    /// outcome (`spec.md` §4.6). Does not install the fetched update as
    /// the active launcher — that's [`reload`](Self::reload)'s job.
    pub async fn fetch_update(&self) -> FetchUpdateOutcome {
        let handle = self.state_machine.handle();
        handle.post(StateMachineEvent::Download);

        let loader = match Loader::new(
            Arc::clone(&self.config),
            Arc::clone(&self.catalog),
            Arc::clone(&self.file_store),
            Arc::clone(&self.server_client),
        ) {
            Ok(l) => l,
            Err(e) => {
                handle.post(StateMachineEvent::DownloadError {
                    message: e.to_string(),
                });
                return FetchUpdateOutcome::Error(e.to_string());
            }
        };

        let bridge = Arc::new(FetchUpdateBridge::default());
        let current_id = self.current_update_id.lock().await.clone();
        let load_result = loader.load(bridge.as_ref(), Some(current_id.as_str())).await;

        if let Err(e) = load_result {
            handle.post(StateMachineEvent::DownloadError {
                message: e.to_string(),
            });
            return FetchUpdateOutcome::Error(e.to_string());
        }

        let Some(result) = bridge.result.lock().await.clone() else {
            let message = "loader completed without reporting a result".to_string();
            handle.post(StateMachineEvent::DownloadError { message: message.clone() });
            return FetchUpdateOutcome::Error(message);
        };

        match (result.update, result.directive) {
            (Some(update), _) => {
                handle.post(StateMachineEvent::DownloadCompleteWithUpdate {
                    manifest: update.manifest.clone(),
                });
                FetchUpdateOutcome::Success(update)
            }
            (None, Directive::RollBackToEmbedded { commit_time }) => {
                handle.post(StateMachineEvent::DownloadCompleteWithRollback);
                FetchUpdateOutcome::RollBackToEmbedded { commit_time }
            }
            (None, Directive::NoUpdateAvailable) => {
                handle.post(StateMachineEvent::DownloadComplete);
                FetchUpdateOutcome::Failure
            }
        }
    }

    /// Rebuilds a launcher against the current Catalog state, installs
    /// it, asks the host to restart JS, and kicks off the Reaper
    /// asynchronously (`spec.md` §4.6).
    pub async fn reload(&self) -> EngineResult<ReloadOutcome> {
        let candidates = self.catalog.list_candidates(&self.config.runtime_version).await?;
        let filters = self.catalog.get_all_extra_params().await?;
        let chosen = self
            .launcher_policy
            .choose_launcher_update(&candidates, &self.config.runtime_version, &filters)
            .cloned();

        let Some(chosen) = chosen else {
            return Ok(ReloadOutcome::NothingToLaunch);
        };

        let bundle_path = if chosen.id == self.embedded.id {
            None
        } else {
            self.catalog
                .launch_asset_for_update(&chosen.id)
                .await?
                .map(|a| self.file_store.path_for(&a.key))
        };

        if let Some(path) = &bundle_path {
            if let Err(e) = self.reloader.set_js_bundle_file(path).await {
                // Non-fatal: logged, reload still reports success
                // (`spec.md` §7 `BundleLoaderReflectionFailure`).
                warn!(error = %e, "host bundle loader update failed");
            }
        }
        self.reloader.restart().await;

        *self.current_update_id.lock().await = chosen.id.clone();
        self.state_machine.handle().post(StateMachineEvent::Restart);

        let catalog = Arc::clone(&self.catalog);
        let file_store = Arc::clone(&self.file_store);
        let selection_policy = Arc::clone(&self.selection_policy);
        let launched_id = chosen.id.clone();
        let embedded_id = self.embedded.id.clone();
        tokio::spawn(async move {
            if let Err(e) = reap(&catalog, &file_store, &selection_policy, &launched_id, &embedded_id).await {
                warn!(error = %e, "reaper pass failed");
            }
        });

        info!(update_id = %chosen.id, "reload installed new launcher");
        Ok(ReloadOutcome::Reloaded {
            launcher_update_id: chosen.id,
        })
    }

    pub async fn get_extra_param(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.catalog.get_extra_param(key).await?)
    }

    pub async fn set_extra_param(&self, key: &str, value: &str) -> EngineResult<()> {
        Ok(self.catalog.set_extra_param(key, value).await?)
    }

    /// Starts the post-launch watchdog once the host signals JS instance
    /// creation (`spec.md` §4.5). `error_stream` is usually
    /// `self.host_error_bus()`, but a real host bridge may supply its own.
    pub async fn start_error_recovery<E, C>(&self, error_stream: Arc<E>, callback: Arc<C>)
    where
        E: HostErrorStream + 'static,
        C: ErrorRecoveryCallback + 'static,
    {
        let launched_id = self.current_update_id.lock().await.clone();
        self.error_recovery.start_monitoring(
            launched_id,
            self.embedded.id.clone(),
            self.config.runtime_version.clone(),
            error_stream,
            Arc::clone(&self.reloader),
            callback,
        );
    }

    pub fn host_error_bus(&self) -> Arc<HostErrorBus> {
        Arc::clone(&self.host_error_bus)
    }

    pub fn remote_load_status_handle(&self) -> RemoteLoadStatusHandle {
        self.error_recovery.remote_load_status_handle()
    }

    async fn build_headers(&self) -> HashMap<String, String> {
        let mut headers = self.config.request_headers.clone();
        headers.insert(
            "expo-runtime-version".to_string(),
            self.config.runtime_version.clone(),
        );
        if let Some(scope_key) = &self.config.scope_key {
            headers.insert("expo-scope-key".to_string(), scope_key.clone());
        }
        let current_id = self.current_update_id.lock().await.clone();
        headers.insert("expo-current-update-id".to_string(), current_id);
        if let Ok(extra) = self.catalog.get_all_extra_params().await {
            for (k, v) in extra {
                headers.entry(k).or_insert(v);
            }
        }
        headers
    }
}

/// Reaper pass: delete update rows `SelectionPolicy` deems eligible,
/// then remove any asset files no longer referenced by any update
/// (`spec.md` §3 Lifecycle).
async fn reap(
    catalog: &Catalog,
    file_store: &FileStore,
    selection_policy: &SelectionPolicy,
    currently_launched_id: &str,
    embedded_id: &str,
) -> anyhow::Result<()> {
    let all_updates = catalog.list_all_updates().await?;
    let to_reap: Vec<String> = selection_policy
        .reaper
        .updates_to_reap(&all_updates, currently_launched_id, embedded_id)
        .into_iter()
        .map(|u| u.id.clone())
        .collect();

    for update_id in &to_reap {
        let assets = catalog.assets_for_update(update_id).await?;
        catalog.delete_update(update_id).await?;
        for (asset, _) in assets {
            if catalog.asset_reference_count(&asset.key).await? == 0 {
                file_store.remove(&asset.key).await?;
            }
        }
    }

    if !to_reap.is_empty() {
        info!(count = to_reap.len(), "reaper removed stale updates");
    }
    Ok(())
}

/// Drives the `StateMachine` through the cold-start `LoaderTask`'s
/// callback sequence (`spec.md` §4.3, §4.4).
struct EngineLoaderTaskCallback {
    state_machine: StateMachineHandle,
    arm_timer: bool,
    download_started: AtomicBool,
}

#[async_trait]
impl LoaderTaskCallback for EngineLoaderTaskCallback {
    async fn on_cached_update_loaded(&self, _update: &UpdateEntity) -> bool {
        self.arm_timer
    }

    async fn on_remote_check_for_update_started(&self) {
        self.state_machine.post(StateMachineEvent::Check);
    }

    async fn on_remote_check_for_update_finished(&self, _response: &ServerResponse) {}

    async fn on_remote_update_load_started(&self) {
        self.download_started.store(true, Ordering::SeqCst);
        self.state_machine.post(StateMachineEvent::Download);
    }

    async fn on_remote_update_finished(
        &self,
        status: RemoteUpdateStatus,
        update: Option<&UpdateEntity>,
        err: Option<&anyhow::Error>,
    ) {
        let downloading = self.download_started.load(Ordering::SeqCst);
        match status {
            RemoteUpdateStatus::NoUpdate => {
                self.state_machine.post(StateMachineEvent::CheckCompleteUnavailable);
            }
            RemoteUpdateStatus::UpdateLoaded => {
                let manifest = update.map(|u| u.manifest.clone()).unwrap_or_default();
                self.state_machine
                    .post(StateMachineEvent::DownloadCompleteWithUpdate { manifest });
            }
            RemoteUpdateStatus::RollBack => {
                if downloading {
                    self.state_machine.post(StateMachineEvent::DownloadCompleteWithRollback);
                } else {
                    // commit_time isn't threaded through this callback surface;
                    // the transition itself is what the host observes here.
                    self.state_machine
                        .post(StateMachineEvent::CheckCompleteWithRollback { commit_time: 0 });
                }
            }
            RemoteUpdateStatus::Error => {
                let message = err.map(|e| e.to_string()).unwrap_or_default();
                if downloading {
                    self.state_machine.post(StateMachineEvent::DownloadError { message });
                } else {
                    self.state_machine.post(StateMachineEvent::CheckError { message });
                }
            }
        }
    }

    async fn on_success(&self, _launcher_update: Option<&UpdateEntity>, _is_up_to_date: bool) {}

    async fn on_failure(&self, _error: &anyhow::Error) {}
}

/// Collects the single [`LoaderResult`] produced by a one-shot
/// `fetch_update` Loader run.
#[derive(Default)]
struct FetchUpdateBridge {
    result: Mutex<Option<LoaderResult>>,
}

#[async_trait]
impl LoaderCallback for FetchUpdateBridge {
    async fn on_update_response_loaded(&self, _response: &ServerResponse) -> bool {
        true
    }

    async fn on_asset_loaded(&self, _asset_key: &str, _successful: usize, _failed: usize, _total: usize) {}

    async fn on_success(&self, result: &LoaderResult) {
        *self.result.lock().await = Some(result.clone());
    }

    async fn on_failure(&self, _error: &anyhow::Error) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NullHostReloader;
    use crate::loader::{ManifestPart, ServerResponse};
    use std::collections::HashMap as Map;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct FakeServerClient {
        response: StdMutex<ServerResponse>,
    }

    impl FakeServerClient {
        fn new(response: ServerResponse) -> Arc<Self> {
            Arc::new(Self {
                response: StdMutex::new(response),
            })
        }

        fn set(&self, response: ServerResponse) {
            *self.response.lock().unwrap() = response;
        }
    }

    #[async_trait]
    impl ManifestServerClient for FakeServerClient {
        async fn fetch(&self, _update_url: &str, _headers: Map<String, String>) -> anyhow::Result<ServerResponse> {
            Ok(self.response.lock().unwrap().clone())
        }
    }

    fn test_embedded() -> EmbeddedUpdate {
        EmbeddedUpdate {
            id: "embedded".to_string(),
            commit_time: 100,
            runtime_version: "1.0.0".to_string(),
            manifest: serde_json::json!({"id": "embedded"}),
            launch_asset_filename: "index.android.bundle".to_string(),
            asset_hash: "embedded-hash".to_string(),
        }
    }

    async fn test_engine(
        fake: Arc<FakeServerClient>,
        launch_wait_ms: u64,
    ) -> (Arc<Engine>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = UpdatesConfig::new(
            dir.path().to_path_buf(),
            "1.0.0".to_string(),
            Some(true),
            Some("https://example.com/updates".to_string()),
            Some("scope".to_string()),
            Some(launch_wait_ms),
        )
        .unwrap();
        let reloader = Arc::new(NullHostReloader::default());
        let engine = Engine::start_with_server_client(
            config,
            test_embedded(),
            reloader,
            fake as Arc<dyn ManifestServerClient>,
        )
        .await
        .unwrap();
        (engine, dir)
    }

    fn manifest_response(id: &str, created_at: i64) -> ServerResponse {
        ServerResponse {
            manifest: Some(ManifestPart {
                id: id.to_string(),
                created_at,
                runtime_version: "1.0.0".to_string(),
                assets: vec![],
            }),
            directive: None,
            manifest_filters: Map::new(),
        }
    }

    #[tokio::test]
    async fn cold_start_with_no_catalog_and_no_remote_update_serves_embedded() {
        let fake = FakeServerClient::new(ServerResponse::default());
        let (engine, _dir) = test_engine(fake, 0).await;
        let path = engine.launch_asset_file().await;
        assert!(path.is_none());
        assert_eq!(engine.bundle_asset_name().unwrap(), "index.android.bundle");
    }

    #[tokio::test]
    async fn cold_start_with_remote_update_and_armed_timer_serves_it() {
        let fake = FakeServerClient::new(manifest_response("u1", 500));
        let (engine, _dir) = test_engine(fake, 300).await;
        let path = engine.launch_asset_file().await;
        assert!(path.is_none(), "manifest has no assets, so no launch asset is linked");
        let update = engine.catalog.get_update("u1").await.unwrap().unwrap();
        assert_eq!(update.status, crate::catalog::UpdateStatus::Ready);
    }

    #[tokio::test]
    async fn check_for_update_reports_no_update_available() {
        let fake = FakeServerClient::new(ServerResponse::default());
        let (engine, _dir) = test_engine(fake, 0).await;
        engine.launch_asset_file().await;
        let outcome = engine.check_for_update().await;
        assert!(matches!(outcome, CheckForUpdateOutcome::NoUpdateAvailable));
    }

    #[tokio::test]
    async fn check_for_update_reports_update_available_for_newer_manifest() {
        let fake = FakeServerClient::new(manifest_response("u2", 999));
        let (engine, _dir) = test_engine(fake, 0).await;
        engine.launch_asset_file().await;
        let outcome = engine.check_for_update().await;
        match outcome {
            CheckForUpdateOutcome::UpdateAvailable(update) => assert_eq!(update.id, "u2"),
            other => panic!("expected UpdateAvailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_update_persists_a_new_update_as_ready() {
        let fake = FakeServerClient::new(ServerResponse::default());
        let (engine, _dir) = test_engine(Arc::clone(&fake), 0).await;
        engine.launch_asset_file().await;

        fake.set(manifest_response("u3", 777));

        let outcome = engine.fetch_update().await;
        match outcome {
            FetchUpdateOutcome::Success(update) => assert_eq!(update.id, "u3"),
            other => panic!("expected Success, got {other:?}"),
        }
        let stored = engine.catalog.get_update("u3").await.unwrap().unwrap();
        assert_eq!(stored.status, crate::catalog::UpdateStatus::Ready);
    }

    #[tokio::test]
    async fn reload_installs_the_only_candidate() {
        let fake = FakeServerClient::new(ServerResponse::default());
        let (engine, _dir) = test_engine(fake, 0).await;
        engine.launch_asset_file().await;
        // Only the embedded update is a launch candidate until a real
        // update is fetched and committed.
        let outcome = engine.reload().await.unwrap();
        match outcome {
            ReloadOutcome::Reloaded { launcher_update_id } => assert_eq!(launcher_update_id, "embedded"),
            ReloadOutcome::NothingToLaunch => panic!("expected the embedded update to be chosen"),
        }
    }
}
