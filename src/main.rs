use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use turnstile::config::{ServiceConfig, Settings, StoreBackend, ThresholdSource};
use turnstile::http::{HttpServer, RequestGate};
use turnstile::ratelimit::{
    DynamicThreshold, DynamicThresholdConfig, HttpFlagSource, MemoryCounterStore, RateLimiter,
    RedisCounterStore, StaticThreshold, ThresholdProvider, WindowCounterStore,
};

/// How often elapsed in-memory windows are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Per-client rate limited HTTP service")]
struct Cli {
    /// YAML configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding PORT
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let dotenv_loaded = dotenv::dotenv().is_ok();

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    let settings = config.validate()?;

    turnstile::telemetry::init(settings.log_format);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if dotenv_loaded {
        info!("Loaded environment from .env");
    } else {
        warn!("No .env file loaded, using process environment only");
    }

    let thresholds = build_threshold_provider(&settings)?;
    let store = build_store(&settings)?;

    let limiter = RateLimiter::new(thresholds, store, settings.window)
        .with_failure_mode(settings.failure_mode);
    info!(
        window_secs = settings.window.as_secs(),
        failure_mode = ?settings.failure_mode,
        "Rate limiter initialized"
    );

    let gate = Arc::new(RequestGate::new(Arc::new(limiter)).trust_proxy(settings.trust_proxy));
    if settings.trust_proxy {
        warn!("Trusting X-Forwarded-For / X-Real-IP for client identity");
    }

    HttpServer::new(settings.listen_addr, gate)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile stopped");
    Ok(())
}

fn build_threshold_provider(settings: &Settings) -> anyhow::Result<Arc<dyn ThresholdProvider>> {
    let provider: Arc<dyn ThresholdProvider> = match &settings.threshold {
        ThresholdSource::Static(threshold) => {
            info!(threshold = %threshold, "Using static threshold");
            Arc::new(StaticThreshold::new(*threshold))
        }
        ThresholdSource::Flag {
            key,
            url,
            timeout,
            refresh_interval,
            fallback,
        } => {
            info!(flag = %key, url = %url, fallback = ?fallback, "Using flag-driven threshold");
            let source = HttpFlagSource::new(url, *timeout)?;
            let config = DynamicThresholdConfig {
                flag_key: key.clone(),
                timeout: *timeout,
                refresh_interval: *refresh_interval,
                fallback: *fallback,
            };
            Arc::new(DynamicThreshold::new(Arc::new(source), config))
        }
    };
    Ok(provider)
}

fn build_store(settings: &Settings) -> anyhow::Result<Arc<dyn WindowCounterStore>> {
    let store: Arc<dyn WindowCounterStore> = match &settings.store {
        StoreBackend::Memory => {
            info!("Using in-memory counter store");
            let store = Arc::new(MemoryCounterStore::new());
            let sweeper = Arc::clone(&store);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    ticker.tick().await;
                    sweeper.purge_expired();
                }
            });
            store
        }
        StoreBackend::Redis(url) => {
            info!("Using Redis counter store");
            Arc::new(RedisCounterStore::new(url)?)
        }
    };
    Ok(store)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
