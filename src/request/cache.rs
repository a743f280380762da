//! In-memory response cache shared by call sites.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::config::RequestConfig;
use crate::Result;

/// How long a cached response stays fresh unless a call site configures otherwise.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_millis(300_000);
/// How often [`ResponseCache::start_sweeper`] is usually asked to evict expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Deterministic identity of a request: endpoint plus the configuration that shapes the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct Fingerprint<'cfg> {
    endpoint: &'cfg str,
    method: &'cfg str,
    headers: &'cfg std::collections::BTreeMap<String, String>,
    query: &'cfg std::collections::BTreeMap<String, String>,
    body: Option<&'cfg Value>,
}

impl CacheKey {
    /// Hash `endpoint` with the fields of `config` that affect the response.
    ///
    /// Timeout and retry budget are left out: they change how a response is fetched, not what it is.
    pub fn fingerprint(endpoint: &str, config: &RequestConfig) -> Result<Self> {
        let fingerprint = Fingerprint {
            endpoint,
            method: config.method.as_str(),
            headers: &config.headers,
            query: &config.query,
            body: config.body.as_ref(),
        };
        let digest = Sha256::digest(serde_json::to_vec(&fingerprint)?);
        Ok(Self(URL_SAFE_NO_PAD.encode(digest)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.age(now) >= self.ttl
    }
}

/// Concurrent map of cached responses.
///
/// Cloning shares the same entries. Each cache is constructed explicitly and handed to the call
/// sites that should share it.
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
}

impl ResponseCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `key` if it has not expired.
    ///
    /// Expiry is checked while holding the entry's shard lock, so a concurrent overwrite is never
    /// judged by the previous entry's age.
    #[must_use]
    pub fn get_fresh(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: CacheKey, value: Value, ttl: Duration) {
        let entry = CacheEntry {
            key: key.clone(),
            value,
            stored_at: Instant::now(),
            ttl,
        };
        self.entries.insert(key, entry);
    }

    pub fn invalidate(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict every entry whose age reached its own TTL. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = before.saturating_sub(self.entries.len());

        #[cfg(feature = "tracing")]
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.entries.len(), "swept response cache");
        }
        evicted
    }

    /// Sweep every `every` on a background task until the returned handle is dropped.
    #[must_use = "the sweeper stops when the handle is dropped"]
    pub fn start_sweeper(&self, every: Duration) -> SweepHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let cache = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
        });

        SweepHandle { cancel }
    }
}

/// Stops the background sweep when dropped.
#[derive(Debug)]
pub struct SweepHandle {
    cancel: CancellationToken,
}

impl SweepHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use reqwest::Method;
    use serde_json::json;
    use tokio::time::advance;

    use super::*;

    fn key(endpoint: &str) -> CacheKey {
        CacheKey::fingerprint(endpoint, &RequestConfig::default()).unwrap()
    }

    #[test]
    fn fingerprint_is_deterministic_and_ignores_retry_budget() {
        let config = RequestConfig::builder()
            .query(BTreeMap::from([
                ("b".to_owned(), "2".to_owned()),
                ("a".to_owned(), "1".to_owned()),
            ]))
            .build();
        let mut patient = config.clone();
        patient.retries = 10;
        patient.timeout = Some(Duration::from_secs(1));

        assert_eq!(
            CacheKey::fingerprint("/portfolio", &config).unwrap(),
            CacheKey::fingerprint("/portfolio", &patient).unwrap()
        );
        assert_ne!(
            CacheKey::fingerprint("/portfolio", &config).unwrap(),
            CacheKey::fingerprint("/orders", &config).unwrap()
        );

        let mut post = config.clone();
        post.method = Method::POST;
        post.body = Some(json!({"symbol": "AAPL"}));
        assert_ne!(
            CacheKey::fingerprint("/portfolio", &config).unwrap(),
            CacheKey::fingerprint("/portfolio", &post).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_served_until_its_ttl_elapses() {
        let cache = ResponseCache::new();
        let key = key("/portfolio");
        cache.insert(key.clone(), json!({"cash": 10}), Duration::from_secs(5));

        advance(Duration::from_millis(4_999)).await;
        assert_eq!(
            cache.get_fresh(&key).map(|entry| entry.value),
            Some(json!({"cash": 10}))
        );

        advance(Duration::from_millis(1)).await;
        assert!(cache.get_fresh(&key).is_none(), "age == ttl is expired");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_expired_entries() {
        let cache = ResponseCache::new();
        cache.insert(key("/short"), json!(1), Duration::from_secs(1));
        cache.insert(key("/long"), json!(2), Duration::from_secs(60));

        advance(Duration::from_secs(2)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_fresh(&key("/long")).is_some(), "long-lived entry survives");
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_handle_is_dropped() {
        let cache = ResponseCache::new();
        let handle = cache.start_sweeper(Duration::from_secs(60));

        cache.insert(key("/a"), json!(1), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.is_empty(), "sweeper should have evicted the expired entry");

        drop(handle);
        cache.insert(key("/b"), json!(2), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(cache.len(), 1, "stopped sweeper leaves entries alone");
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = ResponseCache::new();
        let key = key("/a");
        cache.insert(key.clone(), json!(1), DEFAULT_CACHE_TIME);

        assert!(cache.invalidate(&key).is_some());
        assert!(cache.invalidate(&key).is_none());
        assert!(cache.is_empty());
    }
}
