//! Request classification: pass-through vs cache-path routing.
//!
//! A pure predicate over request method and URL (scheme, host, port, path).
//! Nothing here touches the cache store or the network, so classification is
//! unit-testable without a runtime.

use http::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::proxy::PrecacheManifest;

/// How an outgoing request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Bypass the cache store entirely; always hit the network.
    PassThrough,
    /// Consult the current generation; network on miss, no write-back.
    CacheRead,
    /// Manifest member, expected to be resident since install.
    Precache,
}

/// Classification inputs that stay fixed for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// The application origin; requests elsewhere pass through.
    pub origin: Url,

    /// Path prefix identifying dynamic API traffic.
    pub api_prefix: String,

    /// Local development backend host.
    pub dev_host: String,

    /// Local development backend port.
    pub dev_port: u16,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            origin: Url::parse("https://app.kidaily.example").expect("default origin is valid"),
            api_prefix: "/api".to_string(),
            dev_host: "localhost".to_string(),
            dev_port: 3000,
        }
    }
}

impl RoutePolicy {
    /// Classify a request.
    ///
    /// API traffic, the local development backend, non-GET methods, and
    /// cross-origin requests all pass through untouched. Qualifying requests
    /// are `Precache` when their path is a manifest member, `CacheRead`
    /// otherwise.
    pub fn classify(&self, method: &Method, url: &Url, manifest: &PrecacheManifest) -> RouteClass {
        // API responses are dynamic and must never be served stale.
        if url.path().starts_with(&self.api_prefix) {
            return RouteClass::PassThrough;
        }

        // Local development backend bypass, checked before any cache path so
        // a cached same-origin twin never shadows it.
        if self.is_dev_backend(url) {
            return RouteClass::PassThrough;
        }

        // Only idempotent reads are safe to cache.
        if *method != Method::GET {
            return RouteClass::PassThrough;
        }

        if !self.same_origin(url) {
            return RouteClass::PassThrough;
        }

        if manifest.contains(url.path()) {
            RouteClass::Precache
        } else {
            RouteClass::CacheRead
        }
    }

    fn is_dev_backend(&self, url: &Url) -> bool {
        url.host_str() == Some(self.dev_host.as_str())
            && url.port_or_known_default() == Some(self.dev_port)
    }

    fn same_origin(&self, url: &Url) -> bool {
        url.scheme() == self.origin.scheme()
            && url.host_str() == self.origin.host_str()
            && url.port_or_known_default() == self.origin.port_or_known_default()
    }
}
