//! Token-to-destination fan-out.
//!
//! The registry owns every destination proxy and two maps rebuilt on config
//! reload: token id to destination ids, and destination id to proxy.
//! Readers never take a writer-visible lock: the maps live behind an `Arc`
//! snapshot that reload swaps wholesale, so in-flight events finish against
//! the routing they started with.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use ingest_config::{AppConfig, ConfigLocation, DestinationConfig, content_hash, parse_config};

use crate::concurrency::ShutdownRx;
use crate::error::IngestResult;
use crate::queue::PersistentQueue;
use crate::sink::Storage;
use crate::types::{Event, TokenId};

/// Interval between proxy initialization retries after a failed destination
/// construction.
pub const PROXY_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// A destination built by the factory: the storage plus its event queue
/// when it runs in streaming mode.
pub struct CreatedDestination {
    pub storage: Arc<dyn Storage>,
    pub queue: Option<Arc<PersistentQueue>>,
}

/// Builds a destination from its configuration. Implemented by the
/// destinations crate; the core only sees the trait.
#[async_trait::async_trait]
pub trait StorageFactory: Send + Sync {
    async fn create(
        &self,
        destination_id: &str,
        config: &DestinationConfig,
    ) -> IngestResult<CreatedDestination>;
}

/// Lazily initialized handle to one destination.
///
/// A destination whose construction fails (sink unreachable, bad
/// credentials at runtime) stays in the registry and is retried in the
/// background; until then `get()` returns `None` and events for it stay
/// queued or are dropped by the caller.
pub struct StorageProxy {
    id: String,
    config: DestinationConfig,
    inner: RwLock<Option<Arc<CreatedDestination>>>,
}

impl StorageProxy {
    fn new(id: &str, config: DestinationConfig) -> Self {
        Self {
            id: id.to_owned(),
            config,
            inner: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    /// The storage, once initialization has succeeded.
    pub fn get(&self) -> Option<Arc<dyn Storage>> {
        self.inner.read().as_ref().map(|d| Arc::clone(&d.storage))
    }

    /// The streaming queue, for stream-mode destinations.
    pub fn queue(&self) -> Option<Arc<PersistentQueue>> {
        self.inner.read().as_ref().and_then(|d| d.queue.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.read().is_some()
    }

    async fn try_init(&self, factory: &dyn StorageFactory) -> bool {
        if self.is_ready() {
            return true;
        }

        match factory.create(&self.id, &self.config).await {
            Ok(created) => {
                *self.inner.write() = Some(Arc::new(created));
                info!(destination = %self.id, "destination initialized");
                true
            }
            Err(err) => {
                error!(destination = %self.id, error = %err, "destination initialization failed");
                false
            }
        }
    }

    async fn close(&self) {
        let created = self.inner.write().take();
        if let Some(created) = created {
            if let Some(queue) = &created.queue {
                queue.close();
            }
            if let Err(err) = created.storage.close().await {
                error!(destination = %self.id, error = %err, "error closing destination");
            }
        }
    }
}

struct RoutingSnapshot {
    by_token: HashMap<TokenId, Vec<Arc<StorageProxy>>>,
    by_id: HashMap<String, Arc<StorageProxy>>,
}

impl RoutingSnapshot {
    fn empty() -> Self {
        Self {
            by_token: HashMap::new(),
            by_id: HashMap::new(),
        }
    }
}

/// The destination router: owns proxies and the atomic routing snapshot.
pub struct DestinationRegistry {
    factory: Arc<dyn StorageFactory>,
    snapshot: RwLock<Arc<RoutingSnapshot>>,
    config_hash: RwLock<u64>,
}

impl DestinationRegistry {
    /// Builds the registry from the initial configuration and eagerly
    /// initializes every destination. Destinations that fail to initialize
    /// are kept and retried by [`DestinationRegistry::spawn_retry_task`].
    pub async fn new(factory: Arc<dyn StorageFactory>, config: &AppConfig, hash: u64) -> Arc<Self> {
        let registry = Arc::new(Self {
            factory,
            snapshot: RwLock::new(Arc::new(RoutingSnapshot::empty())),
            config_hash: RwLock::new(hash),
        });

        registry.apply(config).await;
        registry
    }

    /// Destination proxies targeted by a token. Unknown tokens route
    /// nowhere; token validation happens at the front door.
    pub fn storages_for_token(&self, token_id: &str) -> Vec<Arc<StorageProxy>> {
        let snapshot = self.snapshot.read().clone();
        snapshot
            .by_token
            .get(token_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn storage_by_id(&self, destination_id: &str) -> Option<Arc<StorageProxy>> {
        let snapshot = self.snapshot.read().clone();
        snapshot.by_id.get(destination_id).cloned()
    }

    pub fn destination_ids(&self) -> Vec<String> {
        let snapshot = self.snapshot.read().clone();
        snapshot.by_id.keys().cloned().collect()
    }

    /// Fans one accepted event out to every streaming destination of its
    /// token. Batch-mode destinations consume rotated logs written by the
    /// front door and are not touched here.
    ///
    /// Acceptance stamps the two system fields: the ingest timestamp and,
    /// when the client didn't send one, a fresh event id.
    pub fn distribute(&self, mut event: Event, token_id: &str) {
        event.ensure_timestamp(chrono::Utc::now());
        event.ensure_event_id(uuid::Uuid::new_v4().to_string());

        for proxy in self.storages_for_token(token_id) {
            let Some(queue) = proxy.queue() else {
                continue;
            };
            if let Err(err) = queue.enqueue(event.clone(), token_id) {
                error!(
                    destination = %proxy.id(),
                    error = %err,
                    "failed to enqueue event"
                );
            }
        }
    }

    /// Applies a new configuration when its payload hash changed.
    ///
    /// Unchanged destinations keep their proxies (and queues, and workers);
    /// removed or changed ones are closed; new ones are created. The
    /// snapshot swap is atomic with respect to readers.
    pub async fn reload(&self, config: &AppConfig, hash: u64) {
        {
            let current = *self.config_hash.read();
            if current == hash {
                return;
            }
        }

        info!("configuration changed, rebuilding destinations");
        self.apply(config).await;
        *self.config_hash.write() = hash;
    }

    async fn apply(&self, config: &AppConfig) {
        let previous = self.snapshot.read().clone();

        let mut by_id: HashMap<String, Arc<StorageProxy>> = HashMap::new();
        let mut to_close: Vec<Arc<StorageProxy>> = Vec::new();

        for (id, destination_config) in &config.destinations {
            match previous.by_id.get(id) {
                Some(existing) if existing.config() == destination_config => {
                    by_id.insert(id.clone(), Arc::clone(existing));
                }
                Some(existing) => {
                    to_close.push(Arc::clone(existing));
                    by_id.insert(
                        id.clone(),
                        Arc::new(StorageProxy::new(id, destination_config.clone())),
                    );
                }
                None => {
                    by_id.insert(
                        id.clone(),
                        Arc::new(StorageProxy::new(id, destination_config.clone())),
                    );
                }
            }
        }

        for (id, proxy) in &previous.by_id {
            if !config.destinations.contains_key(id) {
                to_close.push(Arc::clone(proxy));
            }
        }

        let mut by_token: HashMap<TokenId, Vec<Arc<StorageProxy>>> = HashMap::new();
        for (token_id, _origins) in config.tokens.all() {
            let proxies: Vec<Arc<StorageProxy>> = by_id
                .values()
                .filter(|proxy| {
                    let only = &proxy.config().only_tokens;
                    only.is_empty() || only.iter().any(|t| t == &token_id)
                })
                .cloned()
                .collect();
            by_token.insert(token_id, proxies);
        }

        // Initialize new proxies before the swap so readers of the new
        // snapshot mostly see ready destinations.
        for proxy in by_id.values() {
            proxy.try_init(self.factory.as_ref()).await;
        }

        *self.snapshot.write() = Arc::new(RoutingSnapshot { by_token, by_id });

        for proxy in to_close {
            info!(destination = %proxy.id(), "closing replaced destination");
            proxy.close().await;
        }
    }

    /// Closes every destination. Called once at shutdown, after workers
    /// observed the shutdown flag.
    pub async fn close(&self) {
        let snapshot = {
            let mut guard = self.snapshot.write();
            std::mem::replace(&mut *guard, Arc::new(RoutingSnapshot::empty()))
        };

        for proxy in snapshot.by_id.values() {
            proxy.close().await;
        }
    }

    /// Spawns the background task retrying failed destination
    /// initializations every [`PROXY_RETRY_INTERVAL`].
    pub fn spawn_retry_task(self: &Arc<Self>, mut shutdown: ShutdownRx) {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(PROXY_RETRY_INTERVAL) => {}
                    _ = shutdown.changed() => return,
                }

                let snapshot = registry.snapshot.read().clone();
                for proxy in snapshot.by_id.values() {
                    if !proxy.is_ready() {
                        proxy.try_init(registry.factory.as_ref()).await;
                    }
                }
            }
        });
    }

    /// Spawns the periodic reload task watching the configuration source.
    /// A change is detected by payload hash; unparseable payloads are
    /// logged and skipped.
    pub fn spawn_reload_task(
        self: &Arc<Self>,
        location: ConfigLocation,
        interval: Duration,
        mut shutdown: ShutdownRx,
    ) {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }

                let payload = match ingest_config::read_config_payload(&location).await {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "failed to re-read configuration source");
                        continue;
                    }
                };

                let hash = content_hash(&payload);
                if hash == *registry.config_hash.read() {
                    continue;
                }

                match parse_config(&payload) {
                    Ok(config) => registry.reload(&config, hash).await,
                    Err(err) => warn!(error = %err, "ignoring unparseable configuration payload"),
                }
            }
        });
    }
}
