//! # Kidaily Service Worker
//!
//! Cache proxy for the Kidaily application shell: intercepts outgoing
//! fetches, serves precached static assets, bypasses API and local
//! development traffic, and garbage-collects stale cache generations across
//! deployments.
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost
//!     ├── Registration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     └── CacheProxy (per version)
//!             ├── RoutePolicy ── classify ──→ PassThrough | CacheRead | Precache
//!             └── CacheStorage
//!                     └── CacheGeneration ("kidaily-v1")
//!                             └── CacheKey → CacheEntry
//! ```
//!
//! Install populates one named generation from the precache manifest
//! (all-or-nothing); fetch interception is read-through for that set only
//! (misses are never written back); activate deletes every generation whose
//! name is not the current version tag.

use thiserror::Error;

pub mod cache;
pub mod lifecycle;
pub mod proxy;
pub mod routes;

pub use cache::{CacheEntry, CacheGeneration, CacheKey, CacheStorage};
pub use lifecycle::{Registration, ServiceWorker, WorkerEvent, WorkerHost, WorkerId, WorkerState};
pub use proxy::{CacheProxy, FetchServed, PrecacheManifest, ProxyConfig};
pub use routes::{RouteClass, RoutePolicy};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    /// A precache asset could not be fetched or stored at install time.
    /// Fatal to that worker version; no partial generation is retained.
    #[error("Install failed for {asset}: {reason}")]
    InstallFailed { asset: String, reason: String },

    #[error("Config error: {0}")]
    Config(#[from] kidaily_common::KidailyError),

    #[error("Network error: {0}")]
    Network(#[from] kidaily_net::NetError),

    #[error("State error: {0}")]
    State(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
pub(crate) mod testutil {
    use async_trait::async_trait;
    use bytes::Bytes;
    use hashbrown::HashMap;
    use http::{HeaderMap, StatusCode};
    use kidaily_net::{Fetcher, NetError, Request, Response};
    use std::sync::Mutex;

    /// Canned-response fetcher that records every URL it is asked for.
    pub struct MockFetcher {
        responses: HashMap<String, (u16, Vec<u8>)>,
        calls: Mutex<Vec<String>>,
    }

    impl MockFetcher {
        pub fn new() -> Self {
            Self {
                responses: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn respond(mut self, url: &str, status: u16, body: &[u8]) -> Self {
            self.responses
                .insert(url.to_string(), (status, body.to_vec()));
            self
        }

        /// URLs fetched so far, in order.
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            self.calls.lock().unwrap().push(request.url.to_string());
            match self.responses.get(request.url.as_str()) {
                Some((status, body)) => Ok(Response::new(
                    request.id,
                    request.url.clone(),
                    StatusCode::from_u16(*status).unwrap(),
                    HeaderMap::new(),
                    Bytes::from(body.clone()),
                )),
                None => Err(NetError::RequestFailed(format!(
                    "connection refused: {}",
                    request.url
                ))),
            }
        }
    }
}
