//! Smart response cache.
//!
//! Caches idempotent GET responses for an enumerated allow-list of service
//! hosts. Keys are SHA-1 digests over a normalized resource identity; values
//! live in memory and, under the persistent strategy, are mirrored to one
//! JSON file per key under the cache directory.
//!
//! Locking: the memory map sits behind its own RwLock and disk I/O behind a
//! separate Mutex. A read racing a concurrent write on the same key may see
//! a transient miss, which is acceptable for a soft cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use wayfarer_core::{CacheStrategy, SmartCacheOptions};

use crate::domains::{strip_port, Domain};
use crate::error::CacheError;

/// Query parameters stripped before key derivation, per host.
const VOLATILE_QUERY_PARAMS: &[(Domain, &str)] = &[(Domain::GameCms, "flight")];

/// A cached response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response body bytes.
    pub body: Vec<u8>,
    /// Response header snapshot, in arrival order.
    pub headers: Vec<(String, String)>,
    /// Absolute expiry; `None` counts as already expired.
    pub expiry: Option<DateTime<Utc>>,
    /// Whether this entry has been written to disk.
    pub persisted: bool,
}

impl CacheEntry {
    /// Creates a fresh, unexpired-stamped-later entry.
    pub fn new(body: Vec<u8>, headers: Vec<(String, String)>) -> Self {
        Self {
            body,
            headers,
            expiry: None,
            persisted: false,
        }
    }

    /// An entry with a zero/unset expiry is treated as already expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_none_or(|expiry| expiry <= now)
    }

    /// Updates the named header in place if it is present.
    fn refresh_header(&mut self, name: &str, value: String) {
        for (header, v) in &mut self.headers {
            if header.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
    }

    /// Returns the named header value, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Formats a timestamp as an HTTP date header value.
fn httpdate(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Derives a cache key from a request URL and content-negotiation headers.
///
/// Normalization: scheme and port stripped, duplicate path separators
/// collapsed, host-specific volatile query parameters removed, negotiation
/// header values appended, the whole string lowercased, SHA-1 hashed, and
/// hex-encoded.
pub fn create_key(url: &str, accept: &str, accept_language: &str) -> String {
    let (host, path, query) = split_url(url);

    let mut identity = String::new();
    identity.push_str(&host);
    identity.push_str(&collapse_slashes(&path));
    let query = filter_volatile_params(&host, &query);
    if !query.is_empty() {
        identity.push('?');
        identity.push_str(&query);
    }
    identity.push_str(accept);
    identity.push_str(accept_language);

    let digest = Sha1::digest(identity.to_lowercase().as_bytes());
    hex::encode(digest)
}

/// Eligibility policy: GET only, for an enumerated allow-list of hosts with
/// per-host path rules. The allow-list is fixed, not inferred.
pub fn is_cachable(url: &str, method: &str) -> bool {
    if !method.eq_ignore_ascii_case("GET") {
        return false;
    }

    let (host, path, _) = split_url(url);
    let path = collapse_slashes(&path).to_lowercase();

    match Domain::from_host(&host) {
        Some(Domain::Settings) | Some(Domain::Profile) => true,
        Some(Domain::Discovery) => path.ends_with("/spec"),
        Some(Domain::GameCms) => gamecms_path_cachable(&path),
        _ => false,
    }
}

/// GameCms paths cache only when pinned to a concrete content version:
/// they must carry a versioned segment, must not end in `latest`, and the
/// branch/flight/session sub-trees are excluded outright.
fn gamecms_path_cachable(path: &str) -> bool {
    if path.ends_with("latest") {
        return false;
    }
    if ["/branches/", "/flights/", "/sessions/"]
        .iter()
        .any(|sub| path.contains(sub))
    {
        return false;
    }
    path.split('/').any(is_version_segment)
}

/// A version segment looks like `123.456` or `6.10022.13411`.
fn is_version_segment(segment: &str) -> bool {
    segment.contains('.')
        && !segment.is_empty()
        && segment.split('.').all(|part| {
            !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
        })
}

/// Splits a URL into (host without port, path, query). Tolerates missing
/// scheme.
fn split_url(url: &str) -> (String, String, String) {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| {
            // Case-insensitive scheme handling without allocating twice.
            let lower = url.to_ascii_lowercase();
            if lower.starts_with("https://") {
                Some(&url[8..])
            } else if lower.starts_with("http://") {
                Some(&url[7..])
            } else {
                None
            }
        })
        .unwrap_or(url);

    let (host_port, path_query) = match rest.find('/') {
        Some(at) => (&rest[..at], &rest[at..]),
        None => (rest, "/"),
    };

    let (path, query) = match path_query.find('?') {
        Some(at) => (&path_query[..at], &path_query[at + 1..]),
        None => (path_query, ""),
    };

    (
        strip_port(host_port).to_string(),
        path.to_string(),
        query.to_string(),
    )
}

/// Collapses repeated `/` separators into one.
fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

/// Drops volatile query parameters for the given host.
fn filter_volatile_params(host: &str, query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }

    let volatile: Vec<&str> = VOLATILE_QUERY_PARAMS
        .iter()
        .filter(|(domain, _)| Some(*domain) == Domain::from_host(host))
        .map(|(_, param)| *param)
        .collect();

    if volatile.is_empty() {
        return query.to_string();
    }

    query
        .split('&')
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or(pair);
            !volatile.iter().any(|v| name.eq_ignore_ascii_case(v))
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// The smart response cache.
pub struct SmartCache {
    strategy: CacheStrategy,
    ttl: Duration,
    dir: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
    disk: Mutex<()>,
}

impl std::fmt::Debug for SmartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartCache")
            .field("strategy", &self.strategy)
            .field("ttl_hours", &self.ttl.num_hours())
            .field("dir", &self.dir)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl SmartCache {
    /// Creates a cache with the given options and disk directory.
    pub fn new(options: &SmartCacheOptions, dir: impl AsRef<Path>) -> Self {
        Self {
            strategy: options.strategy,
            ttl: Duration::hours(options.ttl_hours as i64),
            dir: dir.as_ref().to_path_buf(),
            entries: RwLock::new(HashMap::new()),
            disk: Mutex::new(()),
        }
    }

    /// Creates a cache under the default Wayfarer data directory.
    pub fn with_default_dir(options: &SmartCacheOptions) -> Result<Self, CacheError> {
        let project_dirs = directories::ProjectDirs::from("com", "wayfarer", "Wayfarer")
            .ok_or_else(|| {
                CacheError::Io(std::io::Error::other("failed to resolve project dirs"))
            })?;
        Ok(Self::new(options, project_dirs.data_dir().join("cache")))
    }

    /// The configured storage strategy.
    pub fn strategy(&self) -> CacheStrategy {
        self.strategy
    }

    /// Looks up an entry: memory first, then (persistent strategy only) the
    /// on-disk record, which is promoted into memory on success. A hit gets
    /// its `Date` header refreshed to now.
    pub fn read(&self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();

        {
            let mut entries = self.entries.write();
            match entries.get_mut(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.refresh_header("date", httpdate(now));
                    return Some(entry.clone());
                }
                Some(_) => {
                    entries.remove(key);
                    return None;
                }
                None => {}
            }
        }

        if self.strategy != CacheStrategy::Persistent {
            return None;
        }

        let mut entry = {
            let _disk = self.disk.lock();
            match std::fs::read(self.entry_path(key)) {
                Ok(raw) => match serde_json::from_slice::<CacheEntry>(&raw) {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!("discarding unreadable cache record {}: {}", key, e);
                        return None;
                    }
                },
                Err(_) => return None,
            }
        };

        if entry.is_expired(now) {
            return None;
        }

        entry.persisted = true;
        entry.refresh_header("date", httpdate(now));
        self.entries.write().insert(key.to_string(), entry.clone());
        Some(entry)
    }

    /// Stores an entry: stamps `expiry = now + ttl`, refreshes the
    /// `Expires`/`Date`/`Age` headers if present, inserts into memory, and
    /// (persistent strategy) serializes to disk once.
    pub fn write(&self, key: &str, mut entry: CacheEntry) {
        let now = Utc::now();
        let expiry = now + self.ttl;
        entry.expiry = Some(expiry);
        entry.refresh_header("expires", httpdate(expiry));
        entry.refresh_header("date", httpdate(now));
        entry.refresh_header("age", "0".to_string());

        if self.strategy == CacheStrategy::Persistent && !entry.persisted {
            // Disk failures degrade to memory-only; never surfaced to the
            // request path.
            match self.persist(key, &entry) {
                Ok(()) => entry.persisted = true,
                Err(e) => tracing::warn!("failed to persist cache entry {}: {}", key, e),
            }
        }

        self.entries.write().insert(key.to_string(), entry);
    }

    /// Deletes and recreates the on-disk cache directory and clears the
    /// in-memory map.
    pub fn flush(&self) -> Result<(), CacheError> {
        {
            let _disk = self.disk.lock();
            match std::fs::remove_dir_all(&self.dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::Io(e)),
            }
            std::fs::create_dir_all(&self.dir)?;
        }
        self.entries.write().clear();
        Ok(())
    }

    /// Number of entries currently held in memory.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no entries are held in memory.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn persist(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let _disk = self.disk.lock();
        std::fs::create_dir_all(&self.dir)?;
        let raw = serde_json::to_vec(&CacheEntry {
            persisted: true,
            ..entry.clone()
        })?;
        std::fs::write(self.entry_path(key), raw)?;
        Ok(())
    }
}
