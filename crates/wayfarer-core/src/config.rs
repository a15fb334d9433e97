//! Versioned YAML configuration (`mitm.yaml`).
//!
//! The config file carries a schema `version`, a per-domain map of ordered
//! rewrite rules, and runtime options. Header maps decode directly into
//! `HashMap<String, String>` so malformed shapes are rejected at load time
//! rather than at use time.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Schema version this build understands.
///
/// A config file with any other version is rejected for handler
/// registration; the proxy itself still starts with zero handlers.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Default smart-cache TTL in hours.
pub const DEFAULT_CACHE_TTL_HOURS: u64 = 48;

/// Which categories of proxied traffic are surfaced as events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficDisplay {
    /// Every intercepted request/response.
    #[default]
    All,
    /// Only traffic touched by a rewrite rule.
    Overrides,
    /// Only traffic served from or stored into the smart cache.
    SmartCached,
    /// Nothing.
    Silent,
}

impl TrafficDisplay {
    /// Decides whether an event for a request with the given flags should
    /// be emitted under this policy.
    pub fn should_emit(&self, proxied: bool, smart_cached: bool) -> bool {
        match self {
            TrafficDisplay::All => true,
            TrafficDisplay::Overrides => proxied,
            TrafficDisplay::SmartCached => smart_cached,
            TrafficDisplay::Silent => false,
        }
    }
}

/// Smart-cache storage strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// In-memory only; entries die with the process.
    #[default]
    Memory,
    /// In-memory, mirrored to one file per key on disk.
    Persistent,
}

/// `options.smart_cache` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartCacheOptions {
    /// Master switch for response caching.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Storage strategy.
    #[serde(default)]
    pub strategy: CacheStrategy,
    /// Entry lifetime from last write, in hours.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for SmartCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CacheStrategy::default(),
            ttl_hours: DEFAULT_CACHE_TTL_HOURS,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ttl_hours() -> u64 {
    DEFAULT_CACHE_TTL_HOURS
}

/// `options` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Options {
    /// Event emission policy.
    #[serde(default)]
    pub traffic_display: TrafficDisplay,
    /// Smart-cache settings.
    #[serde(default)]
    pub smart_cache: SmartCacheOptions,
}

/// A request or response rewrite spec attached to a rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Replacement body. May carry `$N` backreferences into the path
    /// template's captures.
    #[serde(default)]
    pub body: Option<String>,
    /// Headers to set. Values may carry `$N` backreferences.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Response status override.
    #[serde(default)]
    pub status: Option<u16>,
    /// Shell commands run before the rewrite is applied. Failures are
    /// logged and swallowed.
    #[serde(default)]
    pub pre_hooks: Vec<String>,
}

impl RewriteConfig {
    /// A rewrite spec with no body, headers, status, or hooks does nothing.
    pub fn is_empty(&self) -> bool {
        self.body.is_none()
            && self.headers.is_empty()
            && self.status.is_none()
            && self.pre_hooks.is_empty()
    }
}

/// One configured rule under a domain section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Path template, must start with `/`. May contain placeholders.
    pub path: String,
    /// Allowed methods; empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Optional request-phase rewrite.
    #[serde(default)]
    pub request: Option<RewriteConfig>,
    /// Optional response-phase rewrite.
    #[serde(default)]
    pub response: Option<RewriteConfig>,
}

/// Top-level config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Schema version; must equal [`CONFIG_SCHEMA_VERSION`] for handler
    /// registration.
    pub version: u32,
    /// Per-domain ordered rule lists, keyed by domain section name
    /// (e.g. `settings`, `gamecms`). Unknown sections are ignored by the
    /// route table.
    #[serde(default)]
    pub domains: HashMap<String, Vec<RuleConfig>>,
    /// Runtime options.
    #[serde(default)]
    pub options: Options,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_SCHEMA_VERSION,
            domains: HashMap::new(),
            options: Options::default(),
        }
    }
}

impl Config {
    /// Loads and validates a config file.
    ///
    /// A missing file is not an error; it yields the default config with no
    /// rules, so the proxy runs as a transparent pass-through.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("no config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a config from a YAML string (used by tests and embedders).
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks structural invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        for (domain, rules) in &self.domains {
            for rule in rules {
                if !rule.path.starts_with('/') {
                    return Err(ConfigError::Invalid(format!(
                        "domain '{}': path '{}' must start with '/'",
                        domain, rule.path
                    )));
                }
                for method in &rule.methods {
                    if !is_known_method(method) {
                        return Err(ConfigError::Invalid(format!(
                            "domain '{}': unknown method '{}'",
                            domain, method
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns an error if the declared schema version is not the one this
    /// build understands.
    pub fn check_schema(&self) -> Result<()> {
        if self.version != CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::SchemaOutdated {
                expected: CONFIG_SCHEMA_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

fn is_known_method(method: &str) -> bool {
    matches!(
        method.to_ascii_uppercase().as_str(),
        "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "OPTIONS" | "PATCH"
    )
}
