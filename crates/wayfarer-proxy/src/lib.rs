//! Wayfarer Proxy - TLS-intercepting rewrite proxy for game services.
//!
//! This crate provides the MITM core: a TLS-terminating proxy scoped to a
//! fixed umbrella of game-service domains, a placeholder-pattern compiler
//! for declarative path rules, and a smart response cache.
//!
//! ## Architecture
//!
//! ```text
//! Client Request → CONNECT → umbrella domain?
//!                                │
//!              ┌─────────────────┴─────────────────┐
//!              │ No                                │ Yes (mint leaf cert)
//!              ▼                                   ▼
//!        Encrypted tunnel                 Route table match → rewrite
//!                                                  │
//!                                                  ▼
//!                                    Smart cache check → HIT? synthesize
//!                                                  │
//!                                                  ▼
//!                                      Upstream → store MISS → client
//! ```
//!
//! Events (request-sent, response-received, status) stream out through the
//! [`wayfarer_core::EventBus`] for UI and log consumers.

mod ca;
mod context;
mod error;
mod handler;
mod proxy;
pub mod cache;
pub mod domains;
pub mod pattern;
pub mod routes;

pub use ca::{CaManager, CaManagerError};
pub use cache::{create_key, is_cachable, CacheEntry, SmartCache};
pub use context::ProxyContext;
pub use domains::{is_intercepted_host, Domain, ROOT_DOMAIN, SERVICE_SUFFIX};
pub use error::{CacheError, PatternError, ProxyError, Result};
pub use handler::{HandlerConfig, ProxyHandler, CACHE_STATUS_HEADER, VERSION_HEADER};
pub use pattern::{replace_matches, Pattern, Placeholder};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use routes::{RewriteSpec, RouteMatch, RouteTable};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8670;
