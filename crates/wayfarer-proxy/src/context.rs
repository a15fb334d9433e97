//! Per-request correlation state.

use std::sync::Arc;

use hyper::Method;
use uuid::Uuid;

use crate::cache::SmartCache;

/// State threaded from the request phase to the response phase of a single
/// intercepted round trip. Created once per request, discarded after the
/// response phase.
#[derive(Clone)]
pub struct ProxyContext {
    /// Correlation id, shared by the request and response events.
    pub id: Uuid,
    /// Full request URL (hostname + path + query, no scheme).
    pub url: String,
    /// Request method.
    pub method: Method,
    /// Whether a request-phase rewrite ran.
    pub proxied_request: bool,
    /// Whether a response-phase rewrite ran.
    pub proxied_response: bool,
    /// Whether the response was synthesized from the smart cache.
    pub served_from_cache: bool,
    /// Whether the response was stored into the smart cache.
    pub stored_to_cache: bool,
    /// Cache handle, attached only when caching is enabled and the request
    /// is eligible.
    pub cache: Option<Arc<SmartCache>>,
    /// Derived cache key, present iff `cache` is.
    pub cache_key: Option<String>,
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("method", &self.method)
            .field("proxied_request", &self.proxied_request)
            .field("proxied_response", &self.proxied_response)
            .field("served_from_cache", &self.served_from_cache)
            .field("stored_to_cache", &self.stored_to_cache)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl ProxyContext {
    /// Creates a fresh context with a generated correlation id.
    pub fn new(url: String, method: Method) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            method,
            proxied_request: false,
            proxied_response: false,
            served_from_cache: false,
            stored_to_cache: false,
            cache: None,
            cache_key: None,
        }
    }

    /// True when either phase applied a rewrite.
    pub fn proxied(&self) -> bool {
        self.proxied_request || self.proxied_response
    }

    /// True when the smart cache touched this round trip.
    pub fn smart_cached(&self) -> bool {
        self.served_from_cache || self.stored_to_cache
    }
}
