use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use txsentry::config::Config;
use txsentry::db::SqliteRepository;
use txsentry::feed::start_zmq_subscriber;
use txsentry::notifications::Notifier;
use txsentry::{Engine, EngineError, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("txsentry=info")),
        )
        .init();

    tracing::info!("txsentry starting...");

    // Load configuration
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".into());
    let config = Config::load(&config_path);
    tracing::debug!("Config: {:?}", config);

    let mut engine = Engine::new(config.clone());
    if config.database.enabled {
        let repo = SqliteRepository::open(Path::new(&config.database.path))?;
        tracing::info!("State database opened at {}", config.database.path);
        engine = engine.with_repository(Box::new(repo));
    }
    let engine = Arc::new(engine);
    let feed = engine.start()?;

    // Alerts
    let notifier_task = if config.notifications.enabled {
        let notifier = Notifier::new(&config.notifications);
        let subscription = engine.subscribe(notifier.filter())?;
        Some(notifier.spawn(subscription))
    } else {
        None
    };

    // ZMQ feed thread
    let feed_shutdown = Arc::new(AtomicBool::new(false));
    let zmq_handle = if config.feed.enabled {
        match start_zmq_subscriber(&config.feed, feed.clone(), feed_shutdown.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("ZMQ feed unavailable: {e}, continuing without it");
                None
            }
        }
    } else {
        None
    };

    // Control API
    let (api_stop_tx, api_stop_rx) = oneshot::channel::<()>();
    let api_task = if config.api.enabled {
        let addr: SocketAddr = config
            .api
            .bind
            .parse()
            .map_err(|e| EngineError::Fatal(format!("invalid api.bind {:?}: {e}", config.api.bind)))?;
        let api_engine = engine.clone();
        Some(tokio::spawn(async move {
            let shutdown = async {
                let _ = api_stop_rx.await;
            };
            if let Err(e) = txsentry::api::serve(api_engine, addr, shutdown).await {
                tracing::error!("Control API failed: {e}");
            }
        }))
    } else {
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    tracing::info!("Shutdown requested");

    feed_shutdown.store(true, Ordering::Release);
    if let Some(handle) = zmq_handle {
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            _ => tracing::warn!("ZMQ subscriber thread did not exit cleanly"),
        }
    }

    let _ = api_stop_tx.send(());
    let stopped = engine.stop().await;
    if let Some(task) = api_task {
        let _ = task.await;
    }
    if let Some(task) = notifier_task {
        let _ = task.await;
    }

    let stats = engine.stats();
    tracing::info!(
        ingested = stats.total_ingested,
        rejected = stats.rejected_count,
        dropped = stats.dropped_events,
        "txsentry stopped"
    );
    stopped
}
