//! Sasi Relay - Entry Point
//!
//! Loads configuration, connects to the WhatsApp bridge and serves the event
//! and admin endpoints until Ctrl+C/SIGTERM.

use sasi_relay::channels::BridgeClient;
use sasi_relay::{Config, MemorySync, RelayEngine, RelayServer, SqliteMemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!("Sasi Relay v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: sasi-relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config, -c <PATH>  JSON config file");
    println!("  --help, -h           Show this help");
    println!();
    println!("Environment variables:");
    println!("  SASI_CONFIG          Config file (when --config is not given)");
    println!("  SASI_BRIDGE_URL      WhatsApp bridge base URL");
    println!("  SASI_BRIDGE_TOKEN    Bridge bearer token");
    println!("  SASI_ALLOWED_GROUPS  Comma-separated group IDs, or *");
    println!("  SASI_DB_PATH         SQLite memory database");
    println!("  SASI_PORT            HTTP port (default: 8080)");
    println!("  SASI_LLM_MODEL       Chat model name");
    println!("  SASI_LOG_JSON        Log as JSON when set to 1/true");
    println!("  RUST_LOG             Log filter (default: info)");
}

fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SASI_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.with_ansi(true).finish())?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }
    let config_path = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .map(|i| {
            args.get(i + 1)
                .map(PathBuf::from)
                .ok_or_else(|| anyhow::anyhow!("--config requires a path"))
        })
        .transpose()?;

    init_logging()?;
    info!("Sasi Relay v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(config_path.as_deref())?;

    let db_path = config.memory.resolved_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let storage = Arc::new(SqliteMemoryStore::open(&db_path)?);
    info!("Memory database at {}", db_path.display());

    let bridge = Arc::new(BridgeClient::new(config.bridge.clone())?);
    if let Err(e) = bridge.refresh_status().await {
        warn!("Bridge not reachable yet: {}", e);
    }

    let engine = RelayEngine::new(&config, bridge.clone(), storage);

    let status_task = tokio::spawn(bridge.clone().watch_status(engine.shutdown_signal()));
    let sync: Arc<MemorySync> = engine.memory_sync().clone();
    let sync_task = tokio::spawn(sync.run(engine.shutdown_signal()));

    let served = RelayServer::new(config.server.clone(), engine.clone()).run().await;

    // Make sure background tasks see shutdown even if the server failed
    engine.shutdown();
    let report = sync_task.await?;
    status_task.await?;
    info!(
        "Shutdown complete: {} sessions synced, {} failed",
        report.success_count, report.failure_count
    );

    served
}
