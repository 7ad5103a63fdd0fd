use clap::Parser;
use relay_core::RelayConfig;
use relay_ingest::FanOutWriter;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use relay_server::{http, logging};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "relay.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real app settings)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config; missing connectivity values are fatal here, never per message
    let config = match RelayConfig::load(Some(args.config.as_str())) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over [service] log_level
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    fmt()
        .with_env_filter(logging::env_filter(
            rust_log.as_deref(),
            &config.service.log_level,
        ))
        .init();

    // Connect to the document store once for the whole process
    let store = match relay_core::create_store(&config.store).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to create {:?} document store: {}", config.store.backend, e);
            std::process::exit(1);
        }
    };

    if args.health {
        match store.health().await {
            Ok(v) => println!("✅ {} store reachable: {}", store.name(), v),
            Err(e) => {
                println!("❌ {} store check failed: {}", store.name(), e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    tracing::info!(
        backend = store.name(),
        database = %config.store.database,
        containers = ?config.store.containers.names(),
        "Document store ready"
    );

    let writer = FanOutWriter::new(store, config.store.containers.clone());

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    http::start_http_server(writer, config, tx.subscribe()).await?;

    Ok(())
}
