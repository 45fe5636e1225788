//! Event-driven automaton for update lifecycle state (`spec.md` §4.4).
//!
//! A single dedicated tokio task owns the `UpdateContext` and applies
//! events serially through [`reduce`], a pure function — the same shape
//! as the host daemon's task reducer. Every accepted transition
//! publishes a fresh snapshot on a broadcast channel; rejected events
//! are logged and dropped, mirroring the reducer's invalid-transition
//! handling without ever panicking the owning task.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// The four states named in `spec.md` §4.4. There is no terminal state —
/// `Restart` always loops back to `Idle`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Checking,
    Downloading,
    Restarting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackInfo {
    pub commit_time: i64,
}

/// An event posted to the state machine. Callers may post from any task;
/// processing itself is serialized on the owning task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StateMachineEvent {
    Check,
    CheckCompleteUnavailable,
    CheckCompleteWithUpdate { manifest: serde_json::Value },
    CheckCompleteWithRollback { commit_time: i64 },
    CheckError { message: String },
    Download,
    DownloadComplete,
    DownloadCompleteWithUpdate { manifest: serde_json::Value },
    DownloadCompleteWithRollback,
    DownloadError { message: String },
    Restart,
}

impl StateMachineEvent {
    fn is_check_completion(&self) -> bool {
        matches!(
            self,
            StateMachineEvent::CheckCompleteUnavailable
                | StateMachineEvent::CheckCompleteWithUpdate { .. }
                | StateMachineEvent::CheckCompleteWithRollback { .. }
                | StateMachineEvent::CheckError { .. }
        )
    }

    fn is_download_completion(&self) -> bool {
        matches!(
            self,
            StateMachineEvent::DownloadComplete
                | StateMachineEvent::DownloadCompleteWithUpdate { .. }
                | StateMachineEvent::DownloadCompleteWithRollback
                | StateMachineEvent::DownloadError { .. }
        )
    }

    fn name(&self) -> &'static str {
        match self {
            StateMachineEvent::Check => "Check",
            StateMachineEvent::CheckCompleteUnavailable => "CheckCompleteUnavailable",
            StateMachineEvent::CheckCompleteWithUpdate { .. } => "CheckCompleteWithUpdate",
            StateMachineEvent::CheckCompleteWithRollback { .. } => "CheckCompleteWithRollback",
            StateMachineEvent::CheckError { .. } => "CheckError",
            StateMachineEvent::Download => "Download",
            StateMachineEvent::DownloadComplete => "DownloadComplete",
            StateMachineEvent::DownloadCompleteWithUpdate { .. } => "DownloadCompleteWithUpdate",
            StateMachineEvent::DownloadCompleteWithRollback => "DownloadCompleteWithRollback",
            StateMachineEvent::DownloadError { .. } => "DownloadError",
            StateMachineEvent::Restart => "Restart",
        }
    }
}

/// Snapshot published to the host after every accepted transition
/// (`spec.md` §4.4). `sequence_number` is monotonic so the host can
/// drop stale snapshots received out of order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateContext {
    pub state: UpdateState,
    pub is_update_available: bool,
    pub is_update_pending: bool,
    pub latest_manifest: Option<serde_json::Value>,
    pub downloaded_manifest: Option<serde_json::Value>,
    pub check_error: Option<String>,
    pub download_error: Option<String>,
    pub rollback: Option<RollbackInfo>,
    pub last_check_for_update_time: Option<chrono::DateTime<chrono::Utc>>,
    pub sequence_number: u64,
}

impl UpdateContext {
    fn initial() -> Self {
        Self {
            state: UpdateState::Idle,
            is_update_available: false,
            is_update_pending: false,
            latest_manifest: None,
            downloaded_manifest: None,
            check_error: None,
            download_error: None,
            rollback: None,
            last_check_for_update_time: None,
            sequence_number: 0,
        }
    }
}

/// Apply one event to `context`, returning `Some(new_context)` if the
/// transition table (`spec.md` §4.4) accepts it, or `None` if it is
/// rejected — the caller logs and discards rejected events, it never
/// treats this as an error.
pub fn reduce(context: &UpdateContext, event: &StateMachineEvent) -> Option<UpdateContext> {
    use UpdateState::*;

    let next_state = match (context.state, event) {
        (Idle, StateMachineEvent::Check) => Checking,
        (Idle, StateMachineEvent::Download) => Downloading,
        (Idle, StateMachineEvent::Restart) => Restarting,

        (Checking, e) if e.is_check_completion() => Idle,
        (Checking, StateMachineEvent::Download) => Downloading,
        (Checking, StateMachineEvent::Restart) => Restarting,

        (Downloading, e) if e.is_download_completion() => Idle,
        (Downloading, StateMachineEvent::Restart) => Restarting,

        (Restarting, StateMachineEvent::Restart) => Restarting,

        _ => return None,
    };

    let mut next = context.clone();
    next.state = next_state;
    next.sequence_number += 1;

    match event {
        StateMachineEvent::Check => {
            next.last_check_for_update_time = Some(chrono::Utc::now());
        }
        StateMachineEvent::CheckCompleteUnavailable => {
            next.is_update_available = false;
        }
        StateMachineEvent::CheckCompleteWithUpdate { manifest } => {
            next.is_update_available = true;
            next.latest_manifest = Some(manifest.clone());
        }
        StateMachineEvent::CheckCompleteWithRollback { commit_time } => {
            next.rollback = Some(RollbackInfo {
                commit_time: *commit_time,
            });
        }
        StateMachineEvent::CheckError { message } => {
            next.check_error = Some(message.clone());
        }
        StateMachineEvent::Download => {
            next.is_update_pending = true;
        }
        StateMachineEvent::DownloadComplete => {
            next.is_update_pending = false;
        }
        StateMachineEvent::DownloadCompleteWithUpdate { manifest } => {
            next.is_update_pending = false;
            next.downloaded_manifest = Some(manifest.clone());
        }
        StateMachineEvent::DownloadCompleteWithRollback => {
            next.is_update_pending = false;
        }
        StateMachineEvent::DownloadError { message } => {
            next.is_update_pending = false;
            next.download_error = Some(message.clone());
        }
        StateMachineEvent::Restart => {}
    }

    Some(next)
}

/// A cheap handle for posting events into the state machine's dedicated
/// task. Clonable, `Send + Sync` — callers from any task hold one.
#[derive(Clone)]
pub struct StateMachineHandle {
    events: mpsc::UnboundedSender<StateMachineEvent>,
    snapshots: broadcast::Sender<UpdateContext>,
}

impl StateMachineHandle {
    /// Post an event. Never blocks; the owning task applies it in order.
    pub fn post(&self, event: StateMachineEvent) {
        // The receiver only goes away when the owning task is dropped,
        // which only happens at process shutdown.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateContext> {
        self.snapshots.subscribe()
    }
}

/// Owns the `UpdateContext` and runs the single serializing task
/// described in `spec.md` §5 ("one dedicated state-machine thread").
pub struct StateMachine {
    handle: StateMachineHandle,
}

impl StateMachine {
    /// Spawn the owning task and return a handle. The task runs until
    /// the returned handle (and all its clones) are dropped.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StateMachineEvent>();
        let (snapshot_tx, _) = broadcast::channel(1024);
        let handle = StateMachineHandle {
            events: tx,
            snapshots: snapshot_tx.clone(),
        };

        tokio::spawn(async move {
            let mut context = UpdateContext::initial();
            while let Some(event) = rx.recv().await {
                let name = event.name();
                match reduce(&context, &event) {
                    Some(next) => {
                        debug!(event = name, state = ?next.state, seq = next.sequence_number, "state machine transition");
                        context = next;
                        let _ = snapshot_tx.send(context.clone());
                    }
                    None => {
                        warn!(event = name, state = ?context.state, "state machine rejected event");
                    }
                }
            }
        });

        Self { handle }
    }

    pub fn handle(&self) -> StateMachineHandle {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_check_transitions_to_checking() {
        let ctx = UpdateContext::initial();
        let next = reduce(&ctx, &StateMachineEvent::Check).unwrap();
        assert_eq!(next.state, UpdateState::Checking);
        assert_eq!(next.sequence_number, 1);
    }

    #[test]
    fn checking_rejects_another_check() {
        let ctx = UpdateContext {
            state: UpdateState::Checking,
            ..UpdateContext::initial()
        };
        assert!(reduce(&ctx, &StateMachineEvent::Check).is_none());
    }

    #[test]
    fn checking_accepts_any_check_completion_back_to_idle() {
        let ctx = UpdateContext {
            state: UpdateState::Checking,
            ..UpdateContext::initial()
        };
        let next = reduce(&ctx, &StateMachineEvent::CheckCompleteUnavailable).unwrap();
        assert_eq!(next.state, UpdateState::Idle);
        assert!(!next.is_update_available);
    }

    #[test]
    fn downloading_rejects_check_completion() {
        let ctx = UpdateContext {
            state: UpdateState::Downloading,
            ..UpdateContext::initial()
        };
        assert!(reduce(&ctx, &StateMachineEvent::CheckCompleteUnavailable).is_none());
    }

    #[test]
    fn restart_is_always_accepted_and_loops_to_restarting() {
        for state in [
            UpdateState::Idle,
            UpdateState::Checking,
            UpdateState::Downloading,
            UpdateState::Restarting,
        ] {
            let ctx = UpdateContext {
                state,
                ..UpdateContext::initial()
            };
            let next = reduce(&ctx, &StateMachineEvent::Restart).unwrap();
            assert_eq!(next.state, UpdateState::Restarting);
        }
    }

    #[test]
    fn sequence_number_is_monotonic_across_accepted_transitions() {
        let mut ctx = UpdateContext::initial();
        ctx = reduce(&ctx, &StateMachineEvent::Check).unwrap();
        ctx = reduce(&ctx, &StateMachineEvent::CheckCompleteWithUpdate {
            manifest: serde_json::json!({"id": "u1"}),
        })
        .unwrap();
        ctx = reduce(&ctx, &StateMachineEvent::Download).unwrap();
        let before_seq = ctx.sequence_number;
        let rejected = reduce(&ctx, &StateMachineEvent::Check);
        assert!(rejected.is_none());
        ctx = reduce(&ctx, &StateMachineEvent::DownloadComplete).unwrap();
        assert_eq!(ctx.sequence_number, before_seq + 1);
        assert_eq!(ctx.state, UpdateState::Idle);
    }

    #[tokio::test]
    async fn spawned_machine_publishes_snapshots_to_subscribers() {
        let machine = StateMachine::spawn();
        let handle = machine.handle();
        let mut rx = handle.subscribe();

        handle.post(StateMachineEvent::Check);
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.state, UpdateState::Checking);

        handle.post(StateMachineEvent::CheckCompleteUnavailable);
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.state, UpdateState::Idle);
    }

    #[tokio::test]
    async fn spawned_machine_drops_rejected_events_without_publishing() {
        let machine = StateMachine::spawn();
        let handle = machine.handle();
        let mut rx = handle.subscribe();

        // Idle rejects a bare Download-completion event.
        handle.post(StateMachineEvent::DownloadComplete);
        // Followed by a valid Check, which should be the only snapshot seen.
        handle.post(StateMachineEvent::Check);
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.state, UpdateState::Checking);
        assert_eq!(snapshot.sequence_number, 1);
    }
}
