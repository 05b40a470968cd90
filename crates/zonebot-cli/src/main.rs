//! Zonebot CLI
//!
//! Entry point wiring the Telegram poller, the trigger dispatcher, the
//! release coordinator, and the HTTP gateway together.

mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use zonebot_cache::TtlCache;
use zonebot_config::Config;
use zonebot_core::Dispatcher;
use zonebot_gateway::{keepalive, AppState};
use zonebot_release::ReleaseCoordinator;
use zonebot_storage::Storage;
use zonebot_telegram::TelegramAdapter;

const CACHE_SWEEP_INTERVAL_SECS: u64 = 60;
const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "zonebot")]
#[command(about = "Hashtag trigger bot with delayed replies and quarantine release", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let log_level = cli
        .log_level
        .or_else(|| config.core.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let _logging = logging::init_logging(&data_dir.join("logs"), &log_level)?;

    info!(
        "Zonebot v{} starting as '{}'",
        env!("CARGO_PKG_VERSION"),
        config.release.self_bot_id
    );

    let db_path = config.db_path();
    let storage = Storage::new(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    let storage = Arc::new(tokio::sync::Mutex::new(storage));

    let cache = Arc::new(TtlCache::new());
    tokio::spawn(Arc::clone(&cache).run_sweeper(CACHE_SWEEP_INTERVAL_SECS));

    let release = Arc::new(ReleaseCoordinator::new(
        config.release.clone(),
        Arc::clone(&cache),
    ));

    let telegram = Arc::new(TelegramAdapter::new(
        &config.telegram.bot_token,
        data_dir.clone(),
        config.telegram.poll_timeout_secs,
        config.telegram.client_recreate_interval_secs,
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&telegram),
        storage,
        Arc::clone(&cache),
        release,
        config.telegram.owner_id,
    ));

    if let Some(external_url) = config.gateway.external_url.clone() {
        tokio::spawn(keepalive::run_self_ping(external_url));
    }

    let gateway_state = AppState::from_config(&config);
    let gateway_port = config.gateway.port;
    let gateway = tokio::spawn(zonebot_gateway::serve(gateway_state, gateway_port));

    let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let dispatch = tokio::spawn(dispatcher.run(update_rx));

    let poller = {
        let telegram = Arc::clone(&telegram);
        tokio::spawn(async move { telegram.poll(update_tx).await })
    };

    // All three tasks are expected to run forever; whichever stops first
    // brings the process down so the supervisor can restart it.
    tokio::select! {
        result = poller => {
            warn!("Telegram poller exited");
            result.context("poller task panicked")??;
        }
        result = gateway => {
            warn!("Gateway exited");
            result.context("gateway task panicked")??;
        }
        _ = dispatch => {
            warn!("Dispatcher exited");
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<Config> {
    if let Some(path) = path {
        return Config::load(path).with_context(|| format!("failed to load config {}", path));
    }
    if let Some(default_path) = Config::default_path() {
        if default_path.exists() {
            return Config::load(&default_path)
                .with_context(|| format!("failed to load config {}", default_path.display()));
        }
    }
    Config::from_env().context("no config file found and environment configuration incomplete")
}
