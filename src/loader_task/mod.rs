//! Cold-start orchestrator: runs the Loader concurrently with a
//! launchability timer and delivers exactly one terminal callback
//! (`spec.md` §4.3).

use crate::catalog::model::UpdateEntity;
use crate::catalog::Catalog;
use crate::config::UpdatesConfig;
use crate::file_store::FileStore;
use crate::loader::{Directive, Loader, LoaderCallback, LoaderResult, ManifestServerClient, ServerResponse};
use crate::selection_policy::SelectionPolicy;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdateStatus {
    NoUpdate,
    UpdateLoaded,
    RollBack,
    Error,
}

/// Callbacks invoked, in order, as the cold-start run progresses
/// (`spec.md` §4.3 steps 1–5).
#[async_trait]
pub trait LoaderTaskCallback: Send + Sync {
    /// A cached launchable update was found. Returning `true` arms the
    /// `LaunchTimer`; returning `false` launches the cached update
    /// immediately once the remote check confirms it's current (or the
    /// remote check fails).
    async fn on_cached_update_loaded(&self, update: &UpdateEntity) -> bool;

    async fn on_remote_check_for_update_started(&self);
    async fn on_remote_check_for_update_finished(&self, response: &ServerResponse);
    async fn on_remote_update_load_started(&self);
    async fn on_remote_update_finished(
        &self,
        status: RemoteUpdateStatus,
        update: Option<&UpdateEntity>,
        err: Option<&anyhow::Error>,
    );

    /// Delivered exactly once, terminating the run.
    async fn on_success(&self, launcher_update: Option<&UpdateEntity>, is_up_to_date: bool);

    /// Delivered only when no cached candidate exists and the Loader fails.
    async fn on_failure(&self, error: &anyhow::Error);
}

#[derive(Debug, Clone)]
pub struct LoaderTaskResult {
    pub launcher_update: Option<UpdateEntity>,
    pub is_up_to_date: bool,
}

struct RemoteOutcome {
    update: Option<UpdateEntity>,
    directive: Directive,
}

/// Bridges Loader's callback surface onto LoaderTaskCallback, and signals
/// `run()` via a one-shot channel when the remote attempt terminates.
struct LoaderTaskBridge {
    task_cb: Arc<dyn LoaderTaskCallback>,
    done_tx: Mutex<Option<oneshot::Sender<RemoteOutcome>>>,
}

#[async_trait]
impl LoaderCallback for LoaderTaskBridge {
    async fn on_update_response_loaded(&self, response: &ServerResponse) -> bool {
        self.task_cb.on_remote_check_for_update_finished(response).await;
        if response.manifest.is_some() {
            self.task_cb.on_remote_update_load_started().await;
        }
        true
    }

    async fn on_asset_loaded(&self, _asset_key: &str, _successful: usize, _failed: usize, _total: usize) {}

    async fn on_success(&self, result: &LoaderResult) {
        let status = match (&result.update, &result.directive) {
            (Some(_), _) => RemoteUpdateStatus::UpdateLoaded,
            (None, Directive::RollBackToEmbedded { .. }) => RemoteUpdateStatus::RollBack,
            (None, Directive::NoUpdateAvailable) => RemoteUpdateStatus::NoUpdate,
        };
        self.task_cb
            .on_remote_update_finished(status, result.update.as_ref(), None)
            .await;
        if let Some(tx) = self.done_tx.lock().await.take() {
            let _ = tx.send(RemoteOutcome {
                update: result.update.clone(),
                directive: result.directive.clone(),
            });
        }
    }

    async fn on_failure(&self, error: &anyhow::Error) {
        self.task_cb
            .on_remote_update_finished(RemoteUpdateStatus::Error, None, Some(error))
            .await;
        // No channel send — the receiver observes a dropped sender and
        // treats it as "remote did not produce an outcome".
    }
}

pub struct LoaderTask {
    config: Arc<UpdatesConfig>,
    catalog: Arc<Catalog>,
    file_store: Arc<FileStore>,
    selection_policy: Arc<SelectionPolicy>,
    server_client: Arc<dyn ManifestServerClient>,
}

impl LoaderTask {
    pub fn new(
        config: Arc<UpdatesConfig>,
        catalog: Arc<Catalog>,
        file_store: Arc<FileStore>,
        selection_policy: Arc<SelectionPolicy>,
        server_client: Arc<dyn ManifestServerClient>,
    ) -> Self {
        Self {
            config,
            catalog,
            file_store,
            selection_policy,
            server_client,
        }
    }

    pub async fn run(&self, task_cb: Arc<dyn LoaderTaskCallback>) -> Result<LoaderTaskResult> {
        let candidates = self.catalog.list_candidates(&self.config.runtime_version).await?;
        let filters = self.catalog.get_all_extra_params().await.unwrap_or_default();
        let cached = self
            .selection_policy
            .launcher
            .choose_launcher_update(&candidates, &self.config.runtime_version, &filters)
            .cloned();

        let mut arm_timer = false;
        if let Some(cached_update) = &cached {
            arm_timer = task_cb.on_cached_update_loaded(cached_update).await;
            debug!(update_id = %cached_update.id, arm_timer, "cached launcher candidate loaded");
        }

        task_cb.on_remote_check_for_update_started().await;

        let (done_tx, done_rx) = oneshot::channel();
        let bridge = Arc::new(LoaderTaskBridge {
            task_cb: Arc::clone(&task_cb),
            done_tx: Mutex::new(Some(done_tx)),
        });

        let loader = Loader::new(
            Arc::clone(&self.config),
            Arc::clone(&self.catalog),
            Arc::clone(&self.file_store),
            Arc::clone(&self.server_client),
        )?;
        let previously_launched = cached.as_ref().map(|u| u.id.clone());
        let bridge_for_task = Arc::clone(&bridge);
        // Not awaited below unless we explicitly wait on `done_rx`: the
        // in-flight Loader always runs to completion even once `run()`
        // returns (`spec.md` §5 "Cancellation & timeouts").
        tokio::spawn(async move {
            let _ = loader.load(bridge_for_task.as_ref(), previously_launched.as_deref()).await;
        });

        let result = if let Some(cached_update) = cached {
            if arm_timer && self.config.launch_wait_ms > 0 {
                let launch_wait = std::time::Duration::from_millis(self.config.launch_wait_ms);
                tokio::select! {
                    _ = tokio::time::sleep(launch_wait) => {
                        info!(update_id = %cached_update.id, "launch timer expired — serving cached update");
                        LoaderTaskResult { launcher_update: Some(cached_update), is_up_to_date: false }
                    }
                    outcome = done_rx => {
                        match outcome {
                            Ok(o) => resolve_with_cached(cached_update, o),
                            Err(_) => LoaderTaskResult { launcher_update: Some(cached_update), is_up_to_date: false },
                        }
                    }
                }
            } else {
                LoaderTaskResult { launcher_update: Some(cached_update), is_up_to_date: false }
            }
        } else {
            match done_rx.await {
                Ok(o) => match o.update {
                    Some(update) => LoaderTaskResult { launcher_update: Some(update), is_up_to_date: false },
                    None => LoaderTaskResult {
                        launcher_update: None,
                        is_up_to_date: matches!(o.directive, Directive::NoUpdateAvailable),
                    },
                },
                Err(_) => {
                    let err = anyhow!("no cached candidate and remote Loader failed");
                    task_cb.on_failure(&err).await;
                    return Err(err);
                }
            }
        };

        task_cb
            .on_success(result.launcher_update.as_ref(), result.is_up_to_date)
            .await;
        Ok(result)
    }
}

fn resolve_with_cached(cached: UpdateEntity, outcome: RemoteOutcome) -> LoaderTaskResult {
    match outcome.update {
        Some(update) => LoaderTaskResult {
            launcher_update: Some(update),
            is_up_to_date: false,
        },
        None => LoaderTaskResult {
            launcher_update: Some(cached),
            is_up_to_date: true,
        },
    }
}
