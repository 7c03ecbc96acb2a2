//! The cache proxy: install, fetch interception, and activation.
//!
//! Install performs an all-or-nothing bulk precache of the manifest into the
//! current generation. Fetch interception is read-through for that set only:
//! hits are served from the generation, misses go to the network and are not
//! written back. Activation deletes every generation whose name is not the
//! current version tag.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use kidaily_common::KidailyError;
use kidaily_net::{Fetcher, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStorage};
use crate::routes::{RouteClass, RoutePolicy};
use crate::SwError;

/// Fixed ordered list of root-relative asset paths precached at install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecacheManifest {
    paths: Vec<String>,
}

impl PrecacheManifest {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Default for PrecacheManifest {
    fn default() -> Self {
        Self::new(vec![
            "/".to_string(),
            "/static/js/bundle.js".to_string(),
            "/static/css/main.css".to_string(),
            "/manifest.json".to_string(),
            "/favicon.ico".to_string(),
        ])
    }
}

/// Cache proxy configuration for one deployed version.
///
/// Bumping `cache_name` triggers full cache invalidation at the next
/// activate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Cache generation name (the version tag).
    pub cache_name: String,

    /// Assets precached at install time.
    pub manifest: PrecacheManifest,

    /// Routing policy.
    pub policy: RoutePolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cache_name: "kidaily-v1".to_string(),
            manifest: PrecacheManifest::default(),
            policy: RoutePolicy::default(),
        }
    }
}

impl ProxyConfig {
    /// Load and validate a configuration from JSON (the shape the deploy
    /// pipeline ships alongside the asset bundle).
    pub fn from_json(json: &str) -> kidaily_common::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KidailyError::config(format!("invalid proxy config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> kidaily_common::Result<()> {
        if self.cache_name.is_empty() {
            return Err(KidailyError::config("cache generation name is empty"));
        }
        if self.manifest.is_empty() {
            return Err(KidailyError::config("precache manifest is empty"));
        }
        if !self.policy.api_prefix.starts_with('/') {
            return Err(KidailyError::config(format!(
                "API prefix must be root-relative: {}",
                self.policy.api_prefix
            )));
        }
        Ok(())
    }
}

/// Response surface handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchServed {
    /// Status code.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Bytes,

    /// Whether this was served from the cache store.
    pub from_cache: bool,
}

impl FetchServed {
    /// Serve a stored cache entry.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: Bytes::from(entry.body.clone()),
            from_cache: true,
        }
    }

    /// Wrap a network response.
    pub fn from_network(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            status: response.status.as_u16(),
            headers,
            body: response.body().clone(),
            from_cache: false,
        }
    }
}

/// The cache proxy for one worker version.
///
/// The cache store and the network fetcher are injected, so the proxy is
/// testable without a browser runtime.
#[derive(Clone)]
pub struct CacheProxy {
    config: ProxyConfig,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
}

impl CacheProxy {
    /// Create a proxy over a shared cache store and fetcher.
    pub fn new(
        config: ProxyConfig,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, SwError> {
        config.validate()?;
        Ok(Self {
            config,
            caches,
            fetcher,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Install: bulk fetch-and-store of the precache manifest.
    ///
    /// All entries are staged before anything is committed, so a failed
    /// asset leaves no generation behind. Any non-2xx response fails the
    /// whole install.
    pub async fn install(&self) -> Result<(), SwError> {
        info!(
            cache = %self.config.cache_name,
            assets = self.config.manifest.len(),
            "Precaching application shell"
        );

        let mut staged = Vec::with_capacity(self.config.manifest.len());
        for path in self.config.manifest.paths() {
            let url = self.config.policy.origin.join(path).map_err(|e| {
                SwError::InstallFailed {
                    asset: path.clone(),
                    reason: e.to_string(),
                }
            })?;

            let request = Request::get(url.clone());
            let method = request.method.clone();
            let key = CacheKey::new(&method, &url);

            let response =
                self.fetcher
                    .fetch(request)
                    .await
                    .map_err(|e| SwError::InstallFailed {
                        asset: path.clone(),
                        reason: e.to_string(),
                    })?;

            if !response.ok() {
                warn!(asset = %path, status = %response.status, "Precache asset fetch failed");
                return Err(SwError::InstallFailed {
                    asset: path.clone(),
                    reason: format!("status {}", response.status),
                });
            }

            staged.push((key, CacheEntry::from_response(&method, &response)));
        }

        let mut caches = self.caches.write().await;
        let generation = caches.open(&self.config.cache_name);
        for (key, entry) in staged {
            generation.put(key, entry);
        }

        debug!(cache = %self.config.cache_name, "Install complete");
        Ok(())
    }

    /// Fetch interception: classify, then serve from cache or network.
    ///
    /// Misses are returned from the network without being written back.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchServed, SwError> {
        let class =
            self.config
                .policy
                .classify(&request.method, &request.url, &self.config.manifest);

        match class {
            RouteClass::PassThrough => {
                trace!(url = %request.url, "Pass-through");
                self.fetch_network(request).await
            }
            RouteClass::Precache | RouteClass::CacheRead => {
                let key = CacheKey::new(&request.method, &request.url);
                {
                    let caches = self.caches.read().await;
                    if let Some(generation) = caches.get(&self.config.cache_name) {
                        if let Some(entry) = generation.match_key(&key) {
                            debug!(url = %request.url, "Serving from cache");
                            return Ok(FetchServed::from_entry(entry));
                        }
                    }
                }

                trace!(url = %request.url, "Cache miss");
                self.fetch_network(request).await
            }
        }
    }

    async fn fetch_network(&self, request: Request) -> Result<FetchServed, SwError> {
        let response = self.fetcher.fetch(request).await?;
        Ok(FetchServed::from_network(&response))
    }

    /// Activate: delete every generation whose name is not the current tag.
    ///
    /// Returns the purged generation names. Idempotent.
    pub async fn activate(&self) -> Result<Vec<String>, SwError> {
        let mut caches = self.caches.write().await;
        let stale: Vec<String> = caches
            .keys()
            .into_iter()
            .filter(|name| *name != self.config.cache_name)
            .map(|name| name.to_string())
            .collect();

        for name in &stale {
            caches.delete(name);
            info!(cache = %name, "Purged stale cache generation");
        }

        Ok(stale)
    }
}
