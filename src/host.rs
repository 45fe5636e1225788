//! Narrow capability interfaces the engine consumes from its embedding
//! host (`spec.md` §6 "Host bridge interface", §9 Design Notes).
//!
//! The host is otherwise out of scope (`spec.md` §1): it owns the JS
//! runtime, the bundle loader, and the UI thread. Rather than depend on
//! a monolithic host object — which would tie `Engine`, `StateMachine`,
//! and `ErrorRecovery` into the three-way cycle the spec calls out —
//! each subsystem depends only on the narrow trait it actually calls,
//! the same way the host daemon's `health::checks` module depends on a
//! `HealthCheck` trait rather than the whole `AppContext`.

use async_trait::async_trait;
use std::path::Path;

/// The host's bundle loader and restart controls. `spec.md` §9 notes
/// the reference implementation resets a private field via reflection
/// because the host API has no public setter for it; this trait models
/// the proper API a host should expose instead, with failure treated as
/// non-fatal (`spec.md` §7 `BundleLoaderReflectionFailure`).
#[async_trait]
pub trait HostReloader: Send + Sync {
    /// Point the host's bundle loader at a new JS bundle file.
    async fn set_js_bundle_file(&self, path: &Path) -> Result<(), crate::errors::UpdatesError>;

    /// Ask the host to restart JS execution against the bundle last set
    /// via [`set_js_bundle_file`](Self::set_js_bundle_file).
    async fn restart(&self);
}

/// A fatal JS error reported by the host after launch, consumed by
/// `ErrorRecovery` (`spec.md` §4.5).
#[derive(Debug, Clone)]
pub struct HostError {
    pub message: String,
}

/// The error-event source `ErrorRecovery` subscribes to once the host
/// signals JS instance creation. Implemented as a `broadcast` source so
/// one host error can fan out to `ErrorRecovery` and any diagnostic
/// subscribers simultaneously.
pub trait HostErrorStream: Send + Sync {
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<HostError>;
}

/// An in-memory `HostErrorStream` the engine owns and the host drives by
/// calling [`HostErrorBus::report`]. This is the concrete type wired by
/// default; a real host embedding could instead bridge its own error
/// channel by implementing `HostErrorStream` directly.
#[derive(Clone)]
pub struct HostErrorBus {
    tx: tokio::sync::broadcast::Sender<HostError>,
}

impl Default for HostErrorBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HostErrorBus {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(64);
        Self { tx }
    }

    pub fn report(&self, message: impl Into<String>) {
        let _ = self.tx.send(HostError {
            message: message.into(),
        });
    }
}

impl HostErrorStream for HostErrorBus {
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<HostError> {
        self.tx.subscribe()
    }
}

/// A `HostReloader` that records calls instead of touching a real JS
/// runtime — used by the CLI demonstration binary and by engine tests.
#[derive(Default)]
pub struct NullHostReloader {
    pub calls: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl HostReloader for NullHostReloader {
    async fn set_js_bundle_file(&self, path: &Path) -> Result<(), crate::errors::UpdatesError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("set_js_bundle_file({})", path.display()));
        Ok(())
    }

    async fn restart(&self) {
        self.calls.lock().unwrap().push("restart".to_string());
    }
}
