//! Distributed cache (C2) — a K/V store over a primary remote backend with
//! an in-process fallback.
//!
//! `get`/`set`/`delete` never propagate errors to callers: failures log and
//! degrade to "not cached", per the error taxonomy's rule that cache
//! failures are always soft.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use tracing::{debug, warn};

/// The enumerated, closed set of cache categories and their TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    AgentResponseQuick,
    AgentResponseStandard,
    AgentResponseDeep,
    UserContext,
    PipelineSnapshot,
    TaskStatus,
    BreakerState,
}

impl CacheCategory {
    pub fn ttl(self) -> Duration {
        match self {
            CacheCategory::AgentResponseQuick => Duration::from_secs(15 * 60),
            CacheCategory::AgentResponseStandard => Duration::from_secs(2 * 60 * 60),
            CacheCategory::AgentResponseDeep => Duration::from_secs(4 * 60 * 60),
            CacheCategory::UserContext => Duration::from_secs(60 * 60),
            CacheCategory::PipelineSnapshot => Duration::from_secs(15 * 60),
            CacheCategory::TaskStatus => Duration::from_secs(60 * 60),
            CacheCategory::BreakerState => Duration::from_secs(60),
        }
    }
}

/// A remote K/V backend. The core ships no concrete network-backed
/// implementation — a real remote store (Redis, memcached, ...) is an
/// external collaborator a host plugs in separately. [`NullRemoteStore`] is
/// used whenever `cache.remote_url` is unset.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), String>;
    async fn delete(&self, key: &str) -> Result<bool, String>;
    async fn invalidate_prefix(&self, prefix: &str) -> Result<u64, String>;
    /// Cheap reachability probe used by the reconnect loop.
    async fn ping(&self) -> bool;
}

/// Stand-in used when no remote store is configured; every operation
/// reports unreachable so all traffic routes to the local fallback.
pub struct NullRemoteStore;

#[async_trait]
impl RemoteStore for NullRemoteStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, String> {
        Err("no remote store configured".to_string())
    }
    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), String> {
        Err("no remote store configured".to_string())
    }
    async fn delete(&self, _key: &str) -> Result<bool, String> {
        Err("no remote store configured".to_string())
    }
    async fn invalidate_prefix(&self, _prefix: &str) -> Result<u64, String> {
        Err("no remote store configured".to_string())
    }
    async fn ping(&self) -> bool {
        false
    }
}

struct TtlExpiry;

impl Expiry<String, (Vec<u8>, Duration)> for TtlExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &(Vec<u8>, Duration),
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.1)
    }
}

/// Bounded in-process LRU used whenever the remote store is unreachable.
struct LocalFallback {
    inner: MokaCache<String, (Vec<u8>, Duration)>,
}

impl LocalFallback {
    fn new(capacity: u64) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(capacity)
            .expire_after(TtlExpiry)
            .build();
        LocalFallback { inner }
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.get(key).await.map(|(v, _)| v)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.inner.insert(key.to_string(), (value, ttl)).await;
    }

    async fn delete(&self, key: &str) -> bool {
        let existed = self.inner.contains_key(key);
        self.inner.invalidate(key).await;
        existed
    }

    async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        let keys: Vec<String> = self
            .inner
            .iter()
            .map(|(k, _)| (*k).clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        let count = keys.len() as u64;
        for key in keys {
            self.inner.invalidate(&key).await;
        }
        count
    }

    async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }
}

/// The public cache façade: routes to the remote store when reachable,
/// falls back to an in-process LRU otherwise. Fallback contents are never
/// promoted back to remote on reconnect — they are not authoritative.
pub struct Cache {
    remote: Arc<dyn RemoteStore>,
    fallback: LocalFallback,
    remote_healthy: AtomicBool,
}

impl Cache {
    pub fn new(remote: Arc<dyn RemoteStore>, local_capacity: u64) -> Self {
        Cache { remote, fallback: LocalFallback::new(local_capacity), remote_healthy: AtomicBool::new(false) }
    }

    pub fn with_no_remote(local_capacity: u64) -> Self {
        Self::new(Arc::new(NullRemoteStore), local_capacity)
    }

    fn using_remote(&self) -> bool {
        self.remote_healthy.load(Ordering::Relaxed)
    }

    /// Never errors. Absence and failure are indistinguishable to the
    /// caller.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if self.using_remote() {
            match self.remote.get(key).await {
                Ok(value) => return value,
                Err(e) => {
                    warn!(key, error = %e, "remote cache get failed, falling back");
                    self.remote_healthy.store(false, Ordering::Relaxed);
                }
            }
        }
        self.fallback.get(key).await
    }

    /// Returns whether the write is believed to have succeeded. Callers
    /// must treat `false` as non-fatal.
    pub async fn set(&self, key: &str, value: Vec<u8>, category: CacheCategory) -> bool {
        let ttl = category.ttl();
        if self.using_remote() {
            match self.remote.set(key, value.clone(), ttl).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(key, error = %e, "remote cache set failed, falling back");
                    self.remote_healthy.store(false, Ordering::Relaxed);
                }
            }
        }
        self.fallback.set(key, value, ttl).await;
        true
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut deleted = false;
        if self.using_remote() {
            if let Ok(existed) = self.remote.delete(key).await {
                deleted = existed;
            }
        }
        deleted || self.fallback.delete(key).await
    }

    pub async fn invalidate(&self, prefix: &str) -> u64 {
        let mut count = 0;
        if self.using_remote() {
            if let Ok(n) = self.remote.invalidate_prefix(prefix).await {
                count += n;
            }
        }
        count + self.fallback.invalidate_prefix(prefix).await
    }

    /// Background probe that reconnects to the remote store on a fixed
    /// interval, without promoting fallback contents.
    pub async fn run_reconnect_probe(self: Arc<Self>, period: Duration, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reachable = self.remote.ping().await;
                    let was_healthy = self.remote_healthy.swap(reachable, Ordering::Relaxed);
                    if reachable && !was_healthy {
                        debug!("remote cache reconnected");
                    } else if !reachable && was_healthy {
                        warn!("remote cache connection lost, serving from local fallback");
                    }
                    self.fallback.run_pending_tasks().await;
                }
            }
        }
    }

    /// Convenience helper for serde-able values.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T, category: CacheCategory) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, bytes, category).await,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;
    use std::collections::HashMap;

    /// An in-memory remote store double used by integration tests.
    #[derive(Default)]
    pub struct MockRemoteStore {
        data: Mutex<HashMap<String, Vec<u8>>>,
        pub reachable: AtomicBool,
    }

    impl MockRemoteStore {
        pub fn new(reachable: bool) -> Self {
            MockRemoteStore { data: Mutex::new(HashMap::new()), reachable: AtomicBool::new(reachable) }
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemoteStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
            if !self.reachable.load(Ordering::Relaxed) {
                return Err("unreachable".to_string());
            }
            Ok(self.data.lock().unwrap().get(key).cloned())
        }
        async fn set(&self, key: &str, value: Vec<u8>, _ttl: Duration) -> Result<(), String> {
            if !self.reachable.load(Ordering::Relaxed) {
                return Err("unreachable".to_string());
            }
            self.data.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<bool, String> {
            Ok(self.data.lock().unwrap().remove(key).is_some())
        }
        async fn invalidate_prefix(&self, prefix: &str) -> Result<u64, String> {
            let mut data = self.data.lock().unwrap();
            let keys: Vec<String> = data.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
            let count = keys.len() as u64;
            for k in keys {
                data.remove(&k);
            }
            Ok(count)
        }
        async fn ping(&self) -> bool {
            self.reachable.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_returns_none_without_erroring() {
        let cache = Cache::with_no_remote(100);
        assert!(cache.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips_via_fallback() {
        let cache = Cache::with_no_remote(100);
        assert!(cache.set("k", b"v".to_vec(), CacheCategory::UserContext).await);
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = Cache::with_no_remote(100);
        cache.set("k", b"v".to_vec(), CacheCategory::UserContext).await;
        assert!(cache.delete("k").await);
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_prefix_bulk_deletes() {
        let cache = Cache::with_no_remote(100);
        cache.set("user:1:a", b"v".to_vec(), CacheCategory::UserContext).await;
        cache.set("user:1:b", b"v".to_vec(), CacheCategory::UserContext).await;
        cache.set("user:2:a", b"v".to_vec(), CacheCategory::UserContext).await;

        let removed = cache.invalidate("user:1:").await;
        assert_eq!(removed, 2);
        assert!(cache.get("user:2:a").await.is_some());
    }
}
