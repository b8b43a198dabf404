//! mibridge Daemon - Main entry point
//!
//! Runs device discovery, reconciliation and polling, and serves the
//! accessory REST API.

mod api;
mod config;
mod server;
mod state;
mod store;

use anyhow::Result;
use clap::Parser;
use mibridge_core::SCHEMA_VERSION;
use mibridge_discovery::{MdnsBrowser, Resolver, StaticDevice};
use mibridge_platform::Platform;
use mibridge_rpc::GatewayConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::store::AccessoryStore;

/// Discovery events buffered ahead of the reconciler
const EVENT_BUFFER: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "mibridge")]
#[command(about = "Xiaomi miio device discovery and polling bridge")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mibridge.toml")]
    config: PathBuf,

    /// Bind address for the REST API
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("mibridge v{}", SCHEMA_VERSION);

    let mut config = config::load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        gateway = %config.rpc.gateway,
        poll_changes = config.platform.poll_changes,
        poll_interval = config.platform.poll_interval,
        "Configuration loaded"
    );

    // Persisted records and the bridge they are registered with
    let store = Arc::new(AccessoryStore::open(&config.daemon.store)?);
    let persisted = store.persisted().await;

    let timeout = config.platform.query_timeout();
    let connector = Arc::new(GatewayConnector::new(&config.rpc.gateway, timeout)?);
    let resolver = Arc::new(Resolver::new(connector, config.credentials(), timeout));

    let platform = Arc::new(
        Platform::start(
            SCHEMA_VERSION,
            persisted,
            resolver,
            store.clone(),
            config.platform.to_platform_config(),
        )
        .await,
    );

    let (events, rx) = mpsc::channel(EVENT_BUFFER);
    platform.spawn(rx).await;

    if config.discovery.mdns {
        let browser = MdnsBrowser::new(config.platform.search_interval())?;
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = browser.run(events).await {
                error!(error = %e, "mDNS browser failed");
            }
        });
    }

    let static_devices = config.static_devices();
    if !static_devices.is_empty() {
        let events = events.clone();
        tokio::spawn(async move {
            StaticDevice::announce_all(&static_devices, &events).await;
        });
    }

    let state = state::AppState::new(platform.clone(), store);
    tokio::select! {
        result = server::run(state, &config.daemon.bind) => {
            if let Err(e) = result {
                error!(error = %e, "API server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    drop(events);
    platform.shutdown().await;
    Ok(())
}
