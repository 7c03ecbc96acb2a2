//! Cache generations: named, versioned containers of captured responses.
//!
//! Exactly one active generation exists per version tag; stale generations
//! remain enumerable by name until the next activate purges them.

use hashbrown::HashMap;
use http::Method;
use kidaily_net::Response;
use serde::{Deserialize, Serialize};
use url::Url;

/// Full request identity used as the cache slot key.
///
/// Two requests differing in method or URL occupy distinct slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.to_string(),
        }
    }
}

/// A captured request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Stored-at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a buffered response under the request method that produced it.
    pub fn from_response(method: &Method, response: &Response) -> Self {
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
            url: response.url.to_string(),
            method: method.as_str().to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }
}

/// A named cache generation.
#[derive(Debug, Default)]
pub struct CacheGeneration {
    name: String,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl CacheGeneration {
    /// Create an empty generation.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Generation name (the version tag).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request identity.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry.
    pub fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Delete an entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All stored keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The set of cache generations, keyed by name.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, CacheGeneration>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a generation (creates if it doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut CacheGeneration {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| CacheGeneration::new(name))
    }

    /// Get a generation without creating it.
    pub fn get(&self, name: &str) -> Option<&CacheGeneration> {
        self.caches.get(name)
    }

    /// Check if a generation exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a generation.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All generation names.
    pub fn keys(&self) -> Vec<&str> {
        self.caches.keys().map(|s| s.as_str()).collect()
    }

    /// Match a request identity across all generations.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        for cache in self.caches.values() {
            if let Some(entry) = cache.match_key(key) {
                return Some(entry);
            }
        }
        None
    }
}
