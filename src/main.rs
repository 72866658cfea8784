use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slidegate::config::{format_duration, SlidegateConfig, StoreBackend};
use slidegate::http::HttpServer;
use slidegate::ratelimit::{RateLimiter, RateLimiterConfig};
use slidegate::store::{CounterStore, MemoryStore, RedisStore};

/// Sliding window rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "slidegate", version, about)]
struct Args {
    /// Path to the service configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Path to the endpoint rules file (overrides rate_limiting.config_path)
    #[arg(short, long)]
    rules: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Slidegate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = SlidegateConfig::load(args.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        store_timeout = %format_duration(config.store.timeout),
        "Configuration loaded"
    );

    let rules_path = args.rules.or(config.rate_limiting.config_path.clone());
    let rules = match rules_path {
        Some(path) => RateLimiterConfig::from_file(path)?,
        None => {
            info!("No rules file configured, using demo rules");
            RateLimiterConfig::demo()
        }
    };
    info!(endpoints = rules.len(), "Rate limit rules loaded");

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_purge_task(store.clone(), config.store.purge_interval);
            store
        }
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.store.redis_url, config.store.scan_batch_size)
                .await?
                .with_key_prefix(config.store.key_prefix.clone()),
        ),
    };

    let rate_limiter = Arc::new(
        RateLimiter::new(rules, store).with_store_timeout(config.store.timeout),
    );
    info!("Rate limiter initialized");

    let http_server = HttpServer::new(config.server.http_addr, rate_limiter);

    // Run the server with graceful shutdown on Ctrl+C
    http_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Slidegate Rate Limiting Service stopped");
    Ok(())
}

/// Periodically drop expired buckets from the in-memory store.
fn spawn_purge_task(store: Arc<MemoryStore>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
