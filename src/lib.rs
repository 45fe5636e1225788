//! Over-the-air update lifecycle engine.
//!
//! Mirrors the host daemon's module layout: each subsystem owns its
//! storage and policy, and [`engine`] wires them into the single
//! `Engine` façade a host process constructs once per app.

pub mod build_data;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error_recovery;
pub mod errors;
pub mod file_store;
pub mod host;
pub mod loader;
pub mod loader_task;
pub mod selection_policy;
pub mod state_machine;

pub use config::UpdatesConfig;
pub use engine::{CheckForUpdateOutcome, EmbeddedUpdate, Engine, FetchUpdateOutcome, ReloadOutcome};
pub use errors::{Result, UpdatesError};
