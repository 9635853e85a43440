use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use ingest::cache::EventsCache;
use ingest::concurrency::create_shutdown;
use ingest::coordination::InMemoryCoordination;
use ingest::enrichment::{IpResolver, UaResolver};
use ingest::fallback::FallbackService;
use ingest::routing::DestinationRegistry;
use ingest_config::{AppConfig, ConfigLocation};
use ingest_destinations::DestinationFactory;

use crate::error::ServerResult;

/// Interval of the configuration reload watcher.
const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period between signaling shutdown and closing destinations, so
/// workers can observe the flag at their loop boundary.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Runs the service until SIGINT/SIGTERM.
pub async fn start(config: AppConfig, location: ConfigLocation, config_hash: u64) -> ServerResult<()> {
    config.validate()?;

    let events_dir = PathBuf::from(&config.log.path);
    std::fs::create_dir_all(&events_dir)?;

    let (shutdown_tx, shutdown_rx) = create_shutdown();
    let coordination = Arc::new(InMemoryCoordination::new());
    let cache = Arc::new(EventsCache::default());

    // The geo and user-agent databases live outside this service; inert
    // resolvers keep the default enrichment rules as no-ops until they are
    // wired in.
    let ip_resolver: IpResolver = Arc::new(|_| None);
    let ua_resolver: UaResolver = Arc::new(|_| None);
    if let Some(path) = &config.geo.maxmind_path {
        warn!(path, "geo database configured but no resolver is linked in");
    }

    let factory = Arc::new(DestinationFactory::new(
        events_dir.clone(),
        Duration::from_secs(config.log.rotation_min.max(1) * 60),
        coordination,
        Arc::clone(&cache),
        config.users_recognition.clone(),
        config.max_columns,
        ip_resolver,
        ua_resolver,
        shutdown_rx.clone(),
    ));

    let registry = DestinationRegistry::new(factory, &config, config_hash).await;
    registry.spawn_retry_task(shutdown_rx.clone());
    registry.spawn_reload_task(location, CONFIG_RELOAD_INTERVAL, shutdown_rx.clone());

    let fallback = FallbackService::new(&events_dir, Arc::clone(&registry))?;
    let pending = fallback.file_statuses(None);
    if !pending.is_empty() {
        info!(
            files = pending.len(),
            "fallback files awaiting operator replay"
        );
    }

    info!(
        destinations = registry.destination_ids().len(),
        events_dir = %events_dir.display(),
        "service started"
    );

    wait_for_termination().await?;

    info!("shutdown signal received, stopping workers");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    // Workers have observed the flag; queues, adapters and async loggers
    // close last.
    registry.close().await;
    info!("service stopped");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
