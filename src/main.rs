use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use herdguard::broadcast::Broadcaster;
use herdguard::cache::ResponseCache;
use herdguard::coalesce::Coalescer;
use herdguard::config::{self, Config, StoreBackend};
use herdguard::handlers::{AppState, build_router};
use herdguard::metrics::MetricsAggregator;
use herdguard::origin::OriginFetcher;
use herdguard::proxy::Proxy;
use herdguard::store::{MemoryStore, RedisStore, SharedStore};
use herdguard::ttl::TtlPolicy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path =
        std::env::var("HERDGUARD_CONFIG").unwrap_or_else(|_| "config/herdguard.toml".to_string());
    let (config, source) = load_config(&config_path)?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Herdguard proxy v{}", env!("CARGO_PKG_VERSION"));
    match source {
        ConfigSource::File => info!("Loaded configuration from {}", config_path),
        ConfigSource::Defaults => {
            info!("No config file at {}, using default configuration", config_path)
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared store
    let store: Arc<dyn SharedStore> = match config.store.backend {
        StoreBackend::Memory => {
            let memory = Arc::new(MemoryStore::new());
            spawn_store_sweep(
                memory.clone(),
                Duration::from_secs(config.store.sweep_interval_secs.max(1)),
                shutdown_rx.clone(),
            );
            info!("Using in-memory store (single instance coalescing)");
            memory as Arc<dyn SharedStore>
        }
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.store.redis_url, config.store.key_prefix.clone()).await?,
        ),
    };

    // Pipeline components
    let upstream = Arc::new(OriginFetcher::new(config.upstream.clone())?);
    let metrics = Arc::new(MetricsAggregator::new(store.clone())?);
    let cache = ResponseCache::new(store.clone());
    let coalescer = Arc::new(Coalescer::new(
        store.clone(),
        cache.clone(),
        config.coalesce.clone(),
    ));
    let ttl = TtlPolicy::from_config(&config.cache)?;

    if !config.cache.enabled {
        info!("Smart cache disabled, all requests go straight upstream");
    } else if config.coalesce.enabled {
        info!(
            lease_secs = config.coalesce.lease_secs,
            follower_budget_ms = config.coalesce.follower_budget().as_millis() as u64,
            local_waiters = config.coalesce.local_waiters,
            "Request coalescing enabled"
        );
    }

    let proxy = Arc::new(Proxy::new(
        upstream,
        cache,
        coalescer.clone(),
        ttl,
        metrics.clone(),
        config.cache.enabled,
    ));

    // Realtime metrics feed
    let broadcaster = Arc::new(Broadcaster::new(metrics.clone(), config.broadcast.clone()));
    tokio::spawn(broadcaster.clone().run(shutdown_rx));

    let state = Arc::new(AppState {
        proxy,
        metrics,
        broadcaster,
        coalescer,
        config: Arc::new(config.clone()),
    });

    let app = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr().parse()?;
    info!(
        "Listening on http://{} (proxying {} to {})",
        addr, config.server.route_prefix, config.upstream.url
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_tasks(shutdown_tx))
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ConfigSource {
    File,
    Defaults,
}

// Called before logging is initialized
fn load_config(path: &str) -> anyhow::Result<(Config, ConfigSource)> {
    if std::path::Path::new(path).exists() {
        Ok((Config::load(path)?, ConfigSource::File))
    } else {
        Ok((Config::default(), ConfigSource::Defaults))
    }
}

fn init_logging(config: &config::LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn spawn_store_sweep(store: Arc<MemoryStore>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    store.cleanup_expired();
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_tasks(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    // Stop the broadcaster and store sweep
    let _ = shutdown_tx.send(true);
}
