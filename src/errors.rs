//! Error taxonomy for the update engine.
//!
//! Mirrors the split the host daemon uses throughout: narrow, typed
//! `thiserror` enums at subsystem boundaries, `anyhow::Result` at call
//! sites that aggregate several fallible subsystems.

use thiserror::Error;

/// Errors surfaced by the engine's public operations.
///
/// Recovery-vs-surface classification (see module docs on each variant):
/// network/remote errors are recovered locally by the `StateMachine`;
/// storage/integrity errors are surfaced to callbacks; only
/// `ConfigInvalid` and an unrecoverable `LaunchFailure` should crash the
/// host process.
#[derive(Debug, Error)]
pub enum UpdatesError {
    /// Fatal during `Engine::start` — thrown to the caller, never recovered.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The updates directory or catalog database could not be opened.
    /// Non-fatal: the engine enters emergency-launch mode and serves the
    /// embedded update.
    #[error("updates directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// Transport-level failure talking to the update server.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// A downloaded asset's SHA-256 did not match `expected_hash`.
    #[error("digest mismatch for asset {asset_key}: expected {expected}, got {actual}")]
    DigestMismatch {
        asset_key: String,
        expected: String,
        actual: String,
    },

    /// An asset file referenced by a `Ready`/`Launchable` update is
    /// missing or unreadable on disk.
    #[error("asset corrupt or missing: {0}")]
    AssetCorrupt(String),

    /// A fatal JS error was reported post-launch and no fallback update
    /// or embedded rollback was available.
    #[error("launch failure with no recoverable fallback: {0}")]
    LaunchFailure(String),

    /// The host bridge could not install the new bundle path (e.g. the
    /// reflection-based setter the reference implementation relies on
    /// is unavailable). Logged, not fatal — the bridge will pick up the
    /// new path at the next natural reload.
    #[error("host bundle loader update failed: {0}")]
    BundleLoaderReflectionFailure(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catches failures from subsystems (Catalog, Loader, FileStore) that
    /// use `anyhow::Result` internally, at the point they cross into a
    /// public `Engine` operation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, UpdatesError>;
