//! Result cache
//!
//! Successful outputs are stored under a fingerprint of the capability name
//! and its canonicalized input. Failures never reach the cache: the write
//! path only accepts an output value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::capability::CapabilityInput;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; when off no request reads or writes the cache
    pub enabled: bool,

    /// Whether requests that do not say otherwise use the cache
    pub default_for_requests: bool,

    /// Time-to-live for stored results
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Upper bound on stored entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_for_requests: true,
            ttl: Duration::from_secs(300),
            max_entries: 1024,
        }
    }
}

/// Deterministic key for a (capability, input) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a capability call
    ///
    /// Object keys are sorted at every depth, so inputs that differ only in
    /// key order share a fingerprint.
    pub fn compute(capability: &str, input: &CapabilityInput) -> Self {
        let mut canonical = String::new();
        write_canonical_object(input, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(capability.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical_object(map: &serde_json::Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        if let Some(value) = map.get(key) {
            write_canonical(value, out);
        }
    }
    out.push('}');
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A stored successful output
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub output: Value,
    pub stored_at: DateTime<Utc>,
}

/// Storage backend for successful results
///
/// Implementations must be safe for concurrent use. Entries past their TTL
/// must never be returned.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Look up a live entry
    async fn get(&self, fingerprint: &Fingerprint) -> Option<CachedResult>;

    /// Store an output for `ttl`
    async fn put(&self, fingerprint: Fingerprint, output: Value, ttl: Duration);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    output: Value,
    stored_at: DateTime<Utc>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Process-local cache with lazy expiry and bounded size
#[derive(Debug)]
pub struct InMemoryResultCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    max_entries: usize,
}

impl Default for InMemoryResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default().max_entries)
    }
}

impl InMemoryResultCache {
    /// Create a cache holding at most `max_entries` results
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of stored entries, expired ones included
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop every entry
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Option<CachedResult> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(fingerprint) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => {
                    return Some(CachedResult {
                        output: entry.output.clone(),
                        stored_at: entry.stored_at,
                    });
                }
                Some(_) => {}
            }
        }

        // Expired; drop it unless a fresh value replaced it meanwhile
        let mut entries = self.entries.write().await;
        if entries
            .get(fingerprint)
            .is_some_and(|entry| entry.is_expired(Instant::now()))
        {
            entries.remove(fingerprint);
        }
        None
    }

    async fn put(&self, fingerprint: Fingerprint, output: Value, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&fingerprint) && entries.len() >= self.max_entries {
            entries.retain(|_, entry| !entry.is_expired(now));

            if entries.len() >= self.max_entries {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(key, _)| key.clone());
                if let Some(victim) = victim {
                    debug!(fingerprint = %victim, "Evicting cache entry closest to expiry");
                    entries.remove(&victim);
                }
            }
        }

        entries.insert(
            fingerprint,
            CacheEntry {
                output,
                stored_at: Utc::now(),
                expires_at: super::instant_after(now, ttl),
            },
        );
    }
}
