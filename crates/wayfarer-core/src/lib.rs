//! Wayfarer Core - configuration schema and event stream.
//!
//! This crate holds the pieces shared between the proxy core and its
//! consumers: the versioned YAML configuration (`mitm.yaml`) and the typed
//! event bus the dispatch pipeline publishes to.

pub mod config;
pub mod error;
pub mod events;

pub use config::{
    CacheStrategy, Config, Options, RewriteConfig, RuleConfig, SmartCacheOptions, TrafficDisplay,
    CONFIG_SCHEMA_VERSION, DEFAULT_CACHE_TTL_HOURS,
};
pub use error::ConfigError;
pub use events::{EventBus, ProxyEvent, EVENT_CHANNEL_CAPACITY};
