//! parley-relay binary entry point.
//!
//! Usage:
//! ```bash
//! parley-relay --config relay.toml
//! parley-relay --help
//! ```

use anyhow::Context;
use clap::Parser;
use parley_relay::cleanup::spawn_cleanup_task;
use parley_relay::config::Config;
use parley_relay::http::{build_router, health::init_start_time};
use parley_relay::kv::{KeyValueStore, MemoryStore};
use parley_relay::server::ChatRelay;
use parley_relay::storage::SqliteStorage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Time given to sessions to flush their shutdown notices.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "parley-relay", version, about = "Realtime chat relay")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley_relay=info")),
        )
        .init();

    let args = Args::parse();
    let config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        tracing::warn!(path = %args.config.display(), "config file not found, using defaults");
        Config::default()
    };

    let storage = SqliteStorage::new(&config.storage.database)
        .await
        .with_context(|| format!("opening {}", config.storage.database.display()))?;
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let relay = Arc::new(ChatRelay::new(config.clone(), Arc::new(storage), kv.clone()));
    init_start_time();

    let cleanup = spawn_cleanup_task(kv, relay.rate_limits().clone(), config.cleanup.clone());

    let http_listener = tokio::net::TcpListener::bind(&config.http.bind_address)
        .await
        .with_context(|| format!("binding {}", config.http.bind_address))?;
    tracing::info!(addr = %config.http.bind_address, "http listener started");
    let router = build_router(relay.clone());
    let http = tokio::spawn(async move { axum::serve(http_listener, router).await });

    let ws_listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    let realtime = tokio::spawn(parley_relay::ws::serve(relay.clone(), ws_listener));

    tokio::signal::ctrl_c().await?;
    let notified = relay.shutdown_all();
    tracing::info!(connections = notified, "shutting down");
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    cleanup.abort();
    http.abort();
    realtime.await??;
    Ok(())
}
