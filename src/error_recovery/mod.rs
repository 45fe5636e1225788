//! Post-launch watchdog (`spec.md` §4.5).
//!
//! Runs as a background tokio task spawned once the host signals JS
//! instance creation. Races a `successTimeoutMs` timer against the
//! host's error stream, exactly the `tokio::select!` shape `LoaderTask`
//! uses for its own launch timer — the same primitive reused for a
//! different race.

use crate::catalog::Catalog;
use crate::errors::{Result, UpdatesError};
use crate::host::{HostError, HostErrorStream, HostReloader};
use crate::selection_policy::SelectionPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub const DEFAULT_SUCCESS_TIMEOUT_MS: u64 = 10_000;

/// Tracks whether a remote load is in flight so the watchdog can hold
/// off its success/failure decision until the replacement resolves
/// (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteLoadStatus {
    #[default]
    Idle,
    NewUpdateLoading,
    NewUpdateLoaded,
}

/// Outcomes `ErrorRecovery` drives the host through.
#[async_trait]
pub trait ErrorRecoveryCallback: Send + Sync {
    async fn on_successful_launch(&self, update_id: &str);
    async fn on_relaunch(&self, update_id: &str);
    async fn on_rollback_to_embedded(&self);
    /// No fallback exists; the host should treat this as fatal
    /// (`spec.md` §7 `LaunchFailure`).
    async fn on_unrecoverable(&self, err: UpdatesError);
}

/// Publishes [`RemoteLoadStatus`] changes to a running watchdog. Cloned
/// and handed to the `LoaderTask`/`Engine` so they can report progress.
#[derive(Clone)]
pub struct RemoteLoadStatusHandle {
    tx: watch::Sender<RemoteLoadStatus>,
}

impl RemoteLoadStatusHandle {
    pub fn set(&self, status: RemoteLoadStatus) {
        let _ = self.tx.send(status);
    }
}

pub struct ErrorRecovery {
    catalog: Catalog,
    selection_policy: Arc<SelectionPolicy>,
    success_timeout: Duration,
    status_tx: watch::Sender<RemoteLoadStatus>,
}

impl ErrorRecovery {
    pub fn new(catalog: Catalog, selection_policy: Arc<SelectionPolicy>, success_timeout_ms: u64) -> Self {
        let (status_tx, _) = watch::channel(RemoteLoadStatus::Idle);
        Self {
            catalog,
            selection_policy,
            success_timeout: Duration::from_millis(success_timeout_ms),
            status_tx,
        }
    }

    pub fn remote_load_status_handle(&self) -> RemoteLoadStatusHandle {
        RemoteLoadStatusHandle {
            tx: self.status_tx.clone(),
        }
    }

    /// Begin watching `launched_update_id`. Call once per launch, after
    /// the host signals JS instance creation.
    pub fn start_monitoring<E, C>(
        &self,
        launched_update_id: String,
        embedded_id: String,
        runtime_version: String,
        error_stream: Arc<E>,
        reloader: Arc<dyn HostReloader>,
        callback: Arc<C>,
    ) where
        E: HostErrorStream + 'static,
        C: ErrorRecoveryCallback + 'static,
    {
        let catalog = self.catalog.clone();
        let selection_policy = Arc::clone(&self.selection_policy);
        let success_timeout = self.success_timeout;
        let mut status_rx = self.status_tx.subscribe();
        let mut error_rx = error_stream.subscribe();

        tokio::spawn(async move {
            let fatal = tokio::select! {
                _ = tokio::time::sleep(success_timeout) => {
                    wait_for_remote_load_to_settle(&mut status_rx, &mut error_rx).await
                }
                err = error_rx.recv() => err.ok(),
            };

            match fatal {
                None => {
                    handle_successful_launch(&catalog, &launched_update_id, &callback).await;
                }
                Some(err) => {
                    handle_fatal_launch(
                        &catalog,
                        &selection_policy,
                        &launched_update_id,
                        &embedded_id,
                        &runtime_version,
                        err,
                        reloader.as_ref(),
                        callback.as_ref(),
                    )
                    .await;
                }
            }
        });
    }
}

/// Returns `None` once the remote load settles to `Idle` with no fatal
/// error in the meantime, or `Some(err)` if a fatal error arrives while
/// waiting (`spec.md` §4.5 "delay the final success/fail decision").
async fn wait_for_remote_load_to_settle(
    status_rx: &mut watch::Receiver<RemoteLoadStatus>,
    error_rx: &mut tokio::sync::broadcast::Receiver<HostError>,
) -> Option<HostError> {
    loop {
        if *status_rx.borrow() == RemoteLoadStatus::Idle {
            return None;
        }
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            err = error_rx.recv() => {
                return err.ok();
            }
        }
    }
}

async fn handle_successful_launch<C: ErrorRecoveryCallback + ?Sized>(
    catalog: &Catalog,
    launched_update_id: &str,
    callback: &Arc<C>,
) {
    match catalog.mark_successful_launch(launched_update_id).await {
        Ok(count) => info!(update_id = launched_update_id, count, "launch confirmed successful"),
        Err(e) => warn!(update_id = launched_update_id, error = %e, "failed to record successful launch"),
    }
    callback.on_successful_launch(launched_update_id).await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_fatal_launch<C: ErrorRecoveryCallback + ?Sized>(
    catalog: &Catalog,
    selection_policy: &SelectionPolicy,
    launched_update_id: &str,
    embedded_id: &str,
    runtime_version: &str,
    err: HostError,
    reloader: &dyn HostReloader,
    callback: &C,
) {
    warn!(update_id = launched_update_id, error = %err.message, "fatal JS error within success timeout");
    if let Err(e) = catalog.mark_failed_launch(launched_update_id).await {
        warn!(update_id = launched_update_id, error = %e, "failed to record failed launch");
    }

    let candidates = match catalog.list_candidates(runtime_version).await {
        Ok(c) => c,
        Err(e) => {
            callback.on_unrecoverable(UpdatesError::from(e)).await;
            return;
        }
    };

    let alternative = selection_policy
        .launcher
        .choose_launcher_update(&candidates, runtime_version, &Default::default())
        .filter(|u| u.id != launched_update_id)
        .map(|u| u.id.clone());

    if let Some(other_id) = alternative {
        info!(update_id = other_id, "relaunching with alternative update");
        reloader.restart().await;
        callback.on_relaunch(&other_id).await;
        return;
    }

    let embedded_available = candidates.iter().any(|u| u.id == embedded_id);
    if embedded_available {
        info!("no alternative update; rolling back to embedded");
        reloader.restart().await;
        callback.on_rollback_to_embedded().await;
        return;
    }

    callback
        .on_unrecoverable(UpdatesError::LaunchFailure(err.message))
        .await;
}
