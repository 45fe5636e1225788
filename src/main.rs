use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use update_engine::engine::{CheckForUpdateOutcome, EmbeddedUpdate, FetchUpdateOutcome, ReloadOutcome};
use update_engine::host::NullHostReloader;
use update_engine::{Engine, UpdatesConfig};

#[derive(Parser)]
#[command(
    name = "update-engine-cli",
    about = "Drives the OTA update engine from a terminal",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Directory holding the catalog database and downloaded assets
    #[arg(long, env = "UPDATES_DIR", default_value = "./updates-data")]
    updates_dir: PathBuf,

    /// Runtime version the embedded bundle and any remote update must match
    #[arg(long, env = "UPDATES_RUNTIME_VERSION", default_value = "1.0.0")]
    runtime_version: String,

    /// Manifest/directive endpoint
    #[arg(long, env = "UPDATES_URL")]
    update_url: Option<String>,

    /// Scope key sent as the `expo-scope-key` header
    #[arg(long, env = "UPDATES_SCOPE_KEY")]
    scope_key: Option<String>,

    /// Milliseconds the cold-start launch waits on a remote check/download
    #[arg(long, env = "UPDATES_LAUNCH_WAIT_MS")]
    launch_wait_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "UPDATES_LOG", default_value = "info")]
    log: String,
}

#[derive(Subcommand)]
enum Command {
    /// Cold-start the engine and report which bundle it would launch.
    ///
    /// Runs the full cold-start sequence — BuildData reconciliation,
    /// embedded-update registration, and the LoaderTask race against
    /// `--launch-wait-ms` — then prints the resolved launch asset.
    ///
    /// Examples:
    ///   update-engine-cli run
    ///   update-engine-cli --launch-wait-ms 2000 run
    Run,
    /// Check the update server for a new manifest or rollback directive.
    Check,
    /// Download and persist the update found by a prior `check`.
    Fetch,
    /// Apply the best ready update and ask the host to restart.
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log);

    let config = UpdatesConfig::new(
        args.updates_dir.clone(),
        args.runtime_version.clone(),
        Some(true),
        args.update_url.clone(),
        args.scope_key.clone(),
        args.launch_wait_ms,
    )
    .context("invalid configuration")?;

    info!(
        updates_dir = %config.updates_dir.display(),
        runtime_version = %config.runtime_version,
        "starting update engine"
    );

    let embedded = demo_embedded_update(&args.runtime_version);
    let reloader = Arc::new(NullHostReloader::default());
    let engine = Engine::start_global(config, embedded, reloader)
        .await
        .context("engine failed to start")?;

    if engine.is_emergency_launch() {
        warn!("updates directory unavailable — running in emergency launch mode");
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let asset = engine.launch_asset_file().await;
            match asset {
                Some(path) => println!("launching downloaded bundle: {}", path.display()),
                None => println!(
                    "launching embedded bundle: {}",
                    engine.bundle_asset_name().unwrap_or_default()
                ),
            }
        }
        Command::Check => match engine.check_for_update().await {
            CheckForUpdateOutcome::NoUpdateAvailable => println!("no update available"),
            CheckForUpdateOutcome::UpdateAvailable(update) => {
                println!("update available: {} (commit_time={})", update.id, update.commit_time)
            }
            CheckForUpdateOutcome::RollBackToEmbedded { commit_time } => {
                println!("server directed rollback to embedded update (commit_time={commit_time})")
            }
            CheckForUpdateOutcome::Error(e) => {
                eprintln!("check failed: {e}");
                std::process::exit(1);
            }
        },
        Command::Fetch => match engine.fetch_update().await {
            FetchUpdateOutcome::Success(update) => println!("fetched update: {}", update.id),
            FetchUpdateOutcome::Failure => println!("fetch failed; no update persisted"),
            FetchUpdateOutcome::RollBackToEmbedded { commit_time } => {
                println!("rollback to embedded update recorded (commit_time={commit_time})")
            }
            FetchUpdateOutcome::Error(e) => {
                eprintln!("fetch failed: {e}");
                std::process::exit(1);
            }
        },
        Command::Reload => match engine.reload().await {
            Ok(ReloadOutcome::Reloaded { launcher_update_id }) => {
                println!("reloaded onto update: {launcher_update_id}")
            }
            Ok(ReloadOutcome::NothingToLaunch) => println!("no launchable update; nothing to do"),
            Err(e) => {
                eprintln!("reload failed: {e}");
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

/// Placeholder embedded-update metadata for the demonstration binary —
/// a real host supplies this from its own build output (`spec.md` §2).
fn demo_embedded_update(runtime_version: &str) -> EmbeddedUpdate {
    EmbeddedUpdate {
        id: "embedded".to_string(),
        commit_time: 0,
        runtime_version: runtime_version.to_string(),
        manifest: serde_json::json!({}),
        launch_asset_filename: "index.bundle".to_string(),
        asset_hash: "embedded-placeholder".to_string(),
    }
}

fn setup_logging(log_level: &str) {
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
}
