//! Raider Sync server
//!
//! Starts the rebuild and update workers and the HTTP sync endpoint, then
//! runs until interrupted. Snapshots are published into the given directory;
//! serve that directory from a front-end web server under the same URL path
//! passed here.

use clap::Parser;
use raider_sync::config::Config;
use raider_sync::coordinator::{Rebuilder, SyncContext, Updater};
use raider_sync::source::HttpSource;
use raider_sync::web::{self, AppState};
use raider_sync::{migrate, SyncError};
use std::path::PathBuf;
use std::sync::Arc;

/// Raider database sync server - merges game data into SQLite and publishes
/// compressed snapshots
#[derive(Parser, Debug)]
#[command(name = "raider_sync")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory where published snapshots are written
    #[arg(short = 'd', long)]
    www_dir: String,

    /// URL path under which the snapshot directory is served
    #[arg(short = 'u', long, default_value = "/db")]
    url_path: String,

    /// Directory for working database files
    #[arg(short, long, default_value_t = default_work_dir())]
    work_dir: String,

    /// Base URL of the game REST API
    #[arg(long)]
    api_url: String,

    /// Base URL of the private inventory API
    #[arg(long)]
    inventory_url: String,

    /// API key for the game REST API
    #[arg(long)]
    game_api_key: Option<String>,

    /// File holding the API key clients must present to /rebuild and /update
    #[arg(short = 'k', long)]
    api_key_file: Option<PathBuf>,

    /// Port for the sync endpoint
    #[arg(short, long, default_value_t = 8412)]
    port: u16,
}

fn default_work_dir() -> String {
    Config::default_work_dir().to_string_lossy().to_string()
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config {
        work_dir: PathBuf::from(&args.work_dir),
        www_dir: PathBuf::from(&args.www_dir),
        base_url_path: args.url_path.clone(),
        api_url: args.api_url.clone(),
        inventory_url: args.inventory_url.clone(),
        game_api_key: args.game_api_key.clone(),
    };
    log::info!("work dir: {}", config.work_dir.display());
    log::info!("snapshot dir: {}", config.www_dir.display());

    let api_key = match &args.api_key_file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(contents) => Some(contents.trim().to_string()),
            Err(e) => {
                log::error!("failed to read API key file {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => None,
    };

    let source = match HttpSource::new(&config) {
        Ok(source) => source,
        Err(e) => {
            log::error!("failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };

    let ctx = match SyncContext::initialize(config, Box::new(source)) {
        Ok(ctx) => Arc::new(ctx),
        Err(SyncError::SchemaVersion { found, expected }) => {
            log::error!(
                "update base has schema version {found}, expected {expected}: {}",
                migrate::version_advice(found)
            );
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    let (rebuilder, rebuild_handle) = match Rebuilder::spawn(Arc::clone(&ctx)) {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("failed to start rebuild worker: {e}");
            std::process::exit(1);
        }
    };
    let (updater, update_handle) = match Updater::spawn(Arc::clone(&ctx)) {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("failed to start update worker: {e}");
            std::process::exit(1);
        }
    };

    let state = AppState {
        ctx: Arc::clone(&ctx),
        rebuilder: Arc::new(rebuilder),
        updater: Arc::new(updater),
        api_key,
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install shutdown handler: {e}");
        }
        log::info!("shutdown requested");
    };

    let serve_state = state.clone();
    if let Err(e) = web::serve(serve_state, args.port, shutdown).await {
        log::error!("web server error: {e}");
    }

    // flip the exiting flag and wake both workers so in-flight subscribers
    // get their sentinel and the threads exit at the next yield point
    ctx.exiting.cancel();
    state.rebuilder.kick();
    state.updater.kick();
    if rebuild_handle.join().is_err() {
        log::error!("rebuild worker panicked during shutdown");
    }
    if update_handle.join().is_err() {
        log::error!("update worker panicked during shutdown");
    }
    log::info!("shutdown complete");
}
