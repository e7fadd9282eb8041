/**
Cache manager for `navicache`

Composes the TTL cache, the watcher and discovery into the read path a UI
uses. Reads are cache-aside; watch events delete the affected entries so
the next read always goes back to the cluster, whatever the TTL says.
*/
use crate::error::{Error, Result};
use crate::k8s::api::ClusterClient;
use crate::k8s::cache::{
    CacheConfig, CacheStats, ErrorHandler, REFRESH_RESOURCE_TYPES, TtlCache, WatchCallback,
    WatchEvent, WatchStats, Watcher,
};
use crate::k8s::discovery::{Discovery, VERB_LIST, VERB_WATCH};
use crate::k8s::namespaces::Namespace;
use crate::k8s::resource::Resource;
use crate::k8s::search::{SearchFilters, matches_query};
use itertools::Itertools;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cache key of the namespace list
pub const NAMESPACES_KEY: &str = "namespaces";

/// Cache key of one `(namespace, type)` list. An empty namespace stands for
/// all namespaces or a cluster-scoped type.
#[must_use]
pub fn resources_key(namespace: &str, resource_type: &str) -> String {
    format!("resources:{namespace}:{resource_type}")
}

/// What the manager stores in its cache
#[derive(Debug, Clone)]
pub enum CachedValue {
    Namespaces(Arc<Vec<Namespace>>),
    Resources(Arc<Vec<Resource>>),
}

/// Cache-aside access layer over a [`ClusterClient`]
pub struct CacheManager {
    client: Arc<dyn ClusterClient>,
    cache: Arc<TtlCache<CachedValue>>,
    watcher: Option<Arc<Watcher>>,
    discovery: Discovery,
    config: CacheConfig,
    cancel: CancellationToken,
    /// Serialises composite refreshes
    lock: Mutex<()>,
    closed: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    /// Build a manager and start its background tasks. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` does not validate.
    pub fn new(client: Arc<dyn ClusterClient>, config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let cache = Arc::new(TtlCache::new(config.max_cache_size, config.cache_ttl));
        let mut tasks = Vec::new();

        let watcher = if config.watch_enabled {
            let watcher = Arc::new(Watcher::with_cancellation(
                client.clone(),
                &config,
                cancel.child_token(),
            ));
            if let Some(events) = watcher.take_event_receiver() {
                tasks.push(tokio::spawn(invalidation_loop(
                    cache.clone(),
                    events,
                    cancel.clone(),
                )));
            }
            Some(watcher)
        } else {
            info!("Watching disabled, cache entries expire by TTL only");
            None
        };

        tasks.push(tokio::spawn(cleanup_loop(
            cache.clone(),
            config.refresh_interval,
            cancel.clone(),
        )));

        info!(
            "🚀 Cache manager started (ttl {}s, max {} entries, watch {})",
            config.cache_ttl.as_secs(),
            config.max_cache_size,
            config.watch_enabled
        );

        Ok(Self {
            discovery: Discovery::new(client.clone()),
            client,
            cache,
            watcher,
            config,
            cancel,
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub const fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() { Err(Error::Closed) } else { Ok(()) }
    }

    /// All namespaces, served from cache when fresh.
    ///
    /// # Errors
    ///
    /// Returns the client error unchanged; nothing is cached in that case.
    pub async fn get_namespaces(&self) -> Result<Arc<Vec<Namespace>>> {
        self.ensure_open()?;

        if let Some(CachedValue::Namespaces(namespaces)) = self.cache.get(NAMESPACES_KEY).await {
            debug!("cache hit: {}", NAMESPACES_KEY);
            return Ok(namespaces);
        }

        debug!("cache miss: {}", NAMESPACES_KEY);
        let namespaces = Arc::new(self.client.list_namespaces().await?);
        self.cache
            .set(NAMESPACES_KEY, CachedValue::Namespaces(namespaces.clone()))
            .await;
        Ok(namespaces)
    }

    /// Resources of one type in one namespace, served from cache when fresh.
    /// The type may be given by plural, kind or short name.
    ///
    /// # Errors
    ///
    /// Returns the client error unchanged, or a discovery error if the type
    /// is not served or cannot be listed.
    pub async fn get_resources_by_type(
        &self,
        namespace: &str,
        resource_type: &str,
    ) -> Result<Arc<Vec<Resource>>> {
        self.ensure_open()?;
        let (namespace, resource_type) = self.scope(namespace, resource_type, VERB_LIST).await?;
        self.fetch_resources(namespace, &resource_type).await
    }

    /// Canonical type name and the namespace to key it under. Cluster-scoped
    /// types always use the empty namespace, whatever the caller passed.
    async fn scope<'a>(
        &self,
        namespace: &'a str,
        resource_type: &str,
        verb: &str,
    ) -> Result<(&'a str, String)> {
        let info = self.discovery.resolve_for(resource_type, verb).await?;
        let namespace = if info.namespaced { namespace } else { "" };
        Ok((namespace, info.name))
    }

    async fn fetch_resources(&self, namespace: &str, resource_type: &str) -> Result<Arc<Vec<Resource>>> {
        let key = resources_key(namespace, resource_type);

        if let Some(CachedValue::Resources(resources)) = self.cache.get(&key).await {
            debug!("cache hit: {}", key);
            return Ok(resources);
        }

        debug!("cache miss: {}", key);
        let resources = Arc::new(self.client.list_resources(resource_type, namespace).await?);
        self.cache
            .set(key, CachedValue::Resources(resources.clone()))
            .await;
        Ok(resources)
    }

    /// Drop every cached list for `namespace` and eagerly reload the common
    /// workload types.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first client error. Types fetched before it
    /// stay cached.
    pub async fn refresh_namespace(&self, namespace: &str) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.lock().await;

        let removed = self
            .cache
            .invalidate_pattern(&format!("resources:{namespace}:*"))
            .await;
        info!("🔄 Refreshing namespace {} ({} entries invalidated)", namespace, removed);

        for resource_type in REFRESH_RESOURCE_TYPES {
            self.fetch_resources(namespace, resource_type).await?;
        }
        Ok(())
    }

    /// Clear the whole cache and reload only the namespace list.
    ///
    /// # Errors
    ///
    /// Returns the client error from listing namespaces.
    pub async fn refresh_all(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.lock().await;

        self.cache.clear().await;
        info!("🔄 Cache cleared, reloading namespaces");
        self.get_namespaces().await?;
        Ok(())
    }

    /// Resources matching `query` across the filtered namespaces and types.
    ///
    /// Types the cluster does not serve are skipped. Cluster-scoped types are
    /// listed once and are not narrowed by the namespace filter.
    ///
    /// # Errors
    ///
    /// Returns the first client error.
    pub async fn search_resources(&self, query: &str, filters: &SearchFilters) -> Result<Vec<Resource>> {
        self.ensure_open()?;
        debug!("🔍 search '{}' {}", query, filters);

        let namespaces: Vec<String> = if filters.namespaces.is_empty() {
            self.get_namespaces()
                .await?
                .iter()
                .map(|ns| ns.name.clone())
                .collect()
        } else {
            filters.namespaces.clone()
        };

        let requested: Vec<String> = if filters.resource_types.is_empty() {
            REFRESH_RESOURCE_TYPES.iter().map(|t| (*t).to_string()).collect()
        } else {
            filters.resource_types.clone()
        };

        let mut namespaced = Vec::new();
        let mut cluster_scoped = Vec::new();
        for resource_type in &requested {
            match self.discovery.resolve_for(resource_type, VERB_LIST).await {
                Ok(info) => {
                    let bucket = if info.namespaced { &mut namespaced } else { &mut cluster_scoped };
                    if !bucket.contains(&info.name) {
                        bucket.push(info.name);
                    }
                }
                Err(e @ (Error::UnknownResourceType(_) | Error::UnsupportedVerb { .. })) => {
                    debug!("search skipping {}: {}", resource_type, e);
                }
                Err(e) => return Err(e),
            }
        }

        // cluster-scoped types are listed once, not once per namespace
        let targets = namespaces
            .iter()
            .map(String::as_str)
            .cartesian_product(namespaced.iter())
            .chain(cluster_scoped.iter().map(|t| ("", t)));

        let mut found = Vec::new();
        for (namespace, resource_type) in targets {
            let resources = self.fetch_resources(namespace, resource_type).await?;
            found.extend(
                resources
                    .iter()
                    .filter(|r| matches_query(r, query) && filters.accepts(r))
                    .cloned(),
            );
        }

        debug!("search '{}' matched {} resources", query, found.len());
        Ok(found)
    }

    /// Subscribe `callback` to changes of one type in one namespace. A
    /// cluster-scoped type is watched cluster-wide.
    ///
    /// # Errors
    ///
    /// Returns `Error::WatchDisabled` if watching is off, a discovery error if
    /// the type cannot be watched, or `Error::Closed`.
    pub async fn watch_resources(
        &self,
        namespace: &str,
        resource_type: &str,
        callback: WatchCallback,
    ) -> Result<String> {
        self.ensure_open()?;
        let watcher = self.watcher.as_ref().ok_or(Error::WatchDisabled)?;
        let (namespace, resource_type) = self.scope(namespace, resource_type, VERB_WATCH).await?;
        watcher.watch_resources(namespace, &resource_type, callback).await
    }

    /// Remove a subscriber returned by [`CacheManager::watch_resources`].
    pub fn unwatch(&self, subscriber_id: &str) -> bool {
        self.watcher
            .as_ref()
            .is_some_and(|watcher| watcher.unwatch(subscriber_id))
    }

    pub fn set_watch_error_handler(&self, handler: ErrorHandler) {
        if let Some(watcher) = &self.watcher {
            watcher.set_error_handler(handler);
        }
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// `None` when watching is disabled
    #[must_use]
    pub fn watch_stats(&self) -> Option<WatchStats> {
        self.watcher.as_ref().map(|w| w.stats())
    }

    /// # Errors
    ///
    /// Returns `Error::Closed` after [`CacheManager::close`], or the
    /// watcher's health error. Without a watcher the manager is healthy.
    pub fn health_check(&self) -> Result<()> {
        self.ensure_open()?;
        self.watcher.as_ref().map_or(Ok(()), |w| w.health_check())
    }

    /// Stop every background task and empty the cache. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.cache.clear().await;
        info!("🛑 Cache manager closed");
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .field("watcher", &self.watcher)
            .finish_non_exhaustive()
    }
}

/// Delete every entry a watch event may have made stale.
async fn invalidate_for_event(cache: &TtlCache<CachedValue>, event: &WatchEvent) {
    let mut keys = vec![resources_key(&event.namespace, &event.resource_type)];

    let own_namespace = event.resource.namespace();
    if !own_namespace.is_empty() && own_namespace != event.namespace {
        keys.push(resources_key(own_namespace, &event.resource_type));
    }
    if !event.namespace.is_empty() {
        keys.push(resources_key("", &event.resource_type));
    }
    if event.resource_type == NAMESPACES_KEY {
        keys.push(NAMESPACES_KEY.to_string());
    }

    for key in keys {
        if cache.delete(&key).await {
            debug!("🗑️  {} {} invalidated {}", event.event_type, event.resource.name(), key);
        }
    }
}

async fn invalidation_loop(
    cache: Arc<TtlCache<CachedValue>>,
    mut events: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => None,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        invalidate_for_event(&cache, &event).await;
    }
    debug!("invalidation loop finished");
}

async fn cleanup_loop(
    cache: Arc<TtlCache<CachedValue>>,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let removed = cache.clean_expired().await;
                if removed > 0 {
                    debug!("🧹 Removed {} expired cache entries", removed);
                }
            }
        }
    }
    debug!("cleanup loop finished");
}
