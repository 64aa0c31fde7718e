//! kdash cache: the keyed read-cache contract the reconciler writes through,
//! plus `MemoryCache`, an in-process implementation with observer tracking
//! and deferred refetch.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use kdash_core::CacheKey;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

/// What `invalidate` should do about fetching fresh data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchMode {
    /// Refetch keys someone is observing now; leave the rest stale until observed.
    Active,
    /// Refetch every matching key now.
    All,
    /// Only mark stale.
    Never,
}

/// Narrow contract of the shared read cache.
///
/// The cache is the single source of truth for what the UI shows. Writers keep no
/// copy of the values they read beyond a single call.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Value>;

    /// Replace the value under `key`.
    fn set(&self, key: CacheKey, value: Value);

    /// Updater form of `set`: mutate the existing value in place. The updater
    /// returns whether it changed anything. Absent keys are left absent and
    /// `false` is returned.
    fn update(&self, key: &CacheKey, updater: &mut dyn FnMut(&mut Value) -> bool) -> bool;

    /// Keys currently holding a value and matching `filter`.
    fn keys(&self, filter: &dyn Fn(&CacheKey) -> bool) -> Vec<CacheKey>;

    /// Mark every key matching `filter` stale. Returns the number of keys touched.
    fn invalidate(&self, filter: &dyn Fn(&CacheKey) -> bool, refetch: RefetchMode) -> usize;
}

/// Pull path used to refill invalidated keys (typically REST calls).
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> anyhow::Result<Value>;
}

/// Per-key metadata for display and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub stale: bool,
    pub observers: usize,
    pub fetching: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Slot {
    value: Option<Value>,
    stale: bool,
    observers: usize,
    fetching: bool,
    updated_at: Option<DateTime<Utc>>,
}

struct Inner {
    slots: Mutex<FxHashMap<CacheKey, Slot>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    epoch: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, FxHashMap<CacheKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.epoch.send_modify(|e| *e = e.wrapping_add(1));
    }

    fn spawn_refetch(self: &Arc<Self>, keys: Vec<CacheKey>) {
        if keys.is_empty() {
            return;
        }
        let Some(fetcher) = self.fetcher.clone() else { return };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                warn!(count = keys.len(), "cache: no runtime to refetch on; keys stay stale");
                let mut slots = self.lock();
                for k in &keys {
                    if let Some(slot) = slots.get_mut(k) {
                        slot.fetching = false;
                    }
                }
                return;
            }
        };
        for key in keys {
            let inner = Arc::clone(self);
            let fetcher = Arc::clone(&fetcher);
            handle.spawn(async move {
                counter!("cache_refetch_total", 1u64);
                let res = fetcher.fetch(&key).await;
                inner.finish_refetch(&key, res);
            });
        }
    }

    fn finish_refetch(&self, key: &CacheKey, res: anyhow::Result<Value>) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else { return };
        slot.fetching = false;
        match res {
            Ok(v) => {
                slot.value = Some(v);
                slot.stale = false;
                slot.updated_at = Some(Utc::now());
                drop(slots);
                debug!(key = %key, "cache: refetch ok");
                self.bump();
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache: refetch failed; key stays stale");
            }
        }
    }
}

/// In-memory `CacheStore`. Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Cache that refills invalidated keys through `fetcher`.
    pub fn with_fetcher(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::build(Some(fetcher))
    }

    fn build(fetcher: Option<Arc<dyn Fetcher>>) -> Self {
        let (epoch, _) = watch::channel(0u64);
        Self { inner: Arc::new(Inner { slots: Mutex::new(FxHashMap::default()), fetcher, epoch }) }
    }

    /// Register interest in `key`. While the returned guard lives, `Active`
    /// invalidations refetch this key immediately. Observing an empty or stale
    /// key triggers the refetch that was deferred.
    pub fn observe(&self, key: CacheKey) -> Observer {
        let needs_fetch = {
            let mut slots = self.inner.lock();
            let slot = slots.entry(key.clone()).or_default();
            slot.observers += 1;
            let needs = (slot.value.is_none() || slot.stale) && !slot.fetching && self.inner.fetcher.is_some();
            if needs {
                slot.fetching = true;
            }
            needs
        };
        if needs_fetch {
            self.inner.spawn_refetch(vec![key.clone()]);
        }
        Observer { inner: Arc::clone(&self.inner), key }
    }

    /// Receiver bumped on every mutation of the cache.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.inner.epoch.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        *self.inner.epoch.borrow()
    }

    pub fn info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.inner.lock().get(key).map(|s| EntryInfo {
            stale: s.stale,
            observers: s.observers,
            fetching: s.fetching,
            updated_at: s.updated_at,
        })
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.info(key).map(|i| i.stale).unwrap_or(false)
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.inner.lock().values().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of every key/value pair (for printing).
    pub fn snapshot(&self) -> Vec<(CacheKey, Value)> {
        let mut out: Vec<(CacheKey, Value)> = self
            .inner
            .lock()
            .iter()
            .filter_map(|(k, s)| s.value.clone().map(|v| (k.clone(), v)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<Value> {
        self.inner.lock().get(key).and_then(|s| s.value.clone())
    }

    fn set(&self, key: CacheKey, value: Value) {
        {
            let mut slots = self.inner.lock();
            let slot = slots.entry(key).or_default();
            slot.value = Some(value);
            slot.stale = false;
            slot.updated_at = Some(Utc::now());
        }
        self.inner.bump();
    }

    fn update(&self, key: &CacheKey, updater: &mut dyn FnMut(&mut Value) -> bool) -> bool {
        let changed = {
            let mut slots = self.inner.lock();
            match slots.get_mut(key) {
                Some(Slot { value: Some(v), updated_at, .. }) => {
                    let changed = updater(v);
                    if changed {
                        *updated_at = Some(Utc::now());
                    }
                    changed
                }
                _ => false,
            }
        };
        if changed {
            self.inner.bump();
        }
        changed
    }

    fn keys(&self, filter: &dyn Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        self.inner
            .lock()
            .iter()
            .filter(|(k, s)| s.value.is_some() && filter(k))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn invalidate(&self, filter: &dyn Fn(&CacheKey) -> bool, refetch: RefetchMode) -> usize {
        let has_fetcher = self.inner.fetcher.is_some();
        let (touched, to_fetch) = {
            let mut slots = self.inner.lock();
            let mut touched = 0usize;
            let mut to_fetch = Vec::new();
            for (k, slot) in slots.iter_mut().filter(|(k, _)| filter(k)) {
                touched += 1;
                slot.stale = true;
                let wanted = match refetch {
                    RefetchMode::All => true,
                    RefetchMode::Active => slot.observers > 0,
                    RefetchMode::Never => false,
                };
                if wanted && has_fetcher && !slot.fetching {
                    slot.fetching = true;
                    to_fetch.push(k.clone());
                }
            }
            (touched, to_fetch)
        };
        if touched > 0 {
            debug!(touched, refetching = to_fetch.len(), mode = ?refetch, "cache: invalidated");
            self.inner.bump();
        }
        self.inner.spawn_refetch(to_fetch);
        touched
    }
}

/// RAII interest in one cache key; see [`MemoryCache::observe`].
pub struct Observer {
    inner: Arc<Inner>,
    key: CacheKey,
}

impl Observer {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn get(&self) -> Option<Value> {
        self.inner.lock().get(&self.key).and_then(|s| s.value.clone())
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        let mut slots = self.inner.lock();
        let remove = match slots.get_mut(&self.key) {
            Some(slot) => {
                slot.observers = slot.observers.saturating_sub(1);
                slot.observers == 0 && slot.value.is_none() && !slot.fetching
            }
            None => false,
        };
        if remove {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdash_core::ResourceKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, key: &CacheKey) -> anyhow::Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!([{ "name": format!("{}-{}", key.kind(), n) }]))
        }
    }

    struct FailingFetcher;

    #[async_trait::async_trait]
    impl Fetcher for FailingFetcher {
        async fn fetch(&self, _key: &CacheKey) -> anyhow::Result<Value> {
            Err(anyhow::anyhow!("backend unavailable"))
        }
    }

    fn pods() -> CacheKey {
        CacheKey::list(ResourceKind::Pod, Some("default"))
    }

    fn nodes() -> CacheKey {
        CacheKey::list(ResourceKind::Node, None)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[test]
    fn set_get_update() {
        let c = MemoryCache::new();
        assert!(c.get(&pods()).is_none());
        c.set(pods(), json!([]));
        let changed = c.update(&pods(), &mut |v| {
            if let Some(arr) = v.as_array_mut() {
                arr.push(json!({"name": "a"}));
                return true;
            }
            false
        });
        assert!(changed);
        assert_eq!(c.get(&pods()), Some(json!([{"name": "a"}])));
        assert!(!c.update(&nodes(), &mut |_| true), "absent key must not be created");
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn epoch_moves_on_mutations_only() {
        let c = MemoryCache::new();
        let e0 = c.epoch();
        c.set(pods(), json!([]));
        let e1 = c.epoch();
        assert!(e1 > e0);
        c.update(&pods(), &mut |_| false);
        assert_eq!(c.epoch(), e1);
        assert_eq!(c.invalidate(&|k| k.kind() == ResourceKind::Node, RefetchMode::Never), 0);
        assert_eq!(c.epoch(), e1);
    }

    #[test]
    fn invalidate_marks_stale_and_set_clears() {
        let c = MemoryCache::new();
        c.set(pods(), json!([]));
        c.set(nodes(), json!([]));
        let n = c.invalidate(&|k| k.kind() == ResourceKind::Pod, RefetchMode::Active);
        assert_eq!(n, 1);
        assert!(c.is_stale(&pods()));
        assert!(!c.is_stale(&nodes()));
        c.set(pods(), json!([1]));
        assert!(!c.is_stale(&pods()));
    }

    #[tokio::test(start_paused = true)]
    async fn active_refetch_only_touches_observed_keys() {
        let fetcher = Arc::new(CountingFetcher { calls: AtomicUsize::new(0) });
        let c = MemoryCache::with_fetcher(fetcher.clone());
        c.set(pods(), json!([]));
        c.set(nodes(), json!([]));
        let _watching = c.observe(pods());
        settle().await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0, "fresh key needs no fetch");

        c.invalidate(&|_| true, RefetchMode::Active);
        settle().await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(!c.is_stale(&pods()));
        assert!(c.is_stale(&nodes()), "unobserved key stays stale");

        // Deferred refetch happens on first observation.
        let _later = c.observe(nodes());
        settle().await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(!c.is_stale(&nodes()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refetch_leaves_key_stale() {
        let c = MemoryCache::with_fetcher(Arc::new(FailingFetcher));
        c.set(pods(), json!(["old"]));
        let _w = c.observe(pods());
        c.invalidate(&|_| true, RefetchMode::All);
        settle().await;
        assert!(c.is_stale(&pods()));
        assert_eq!(c.get(&pods()), Some(json!(["old"])));
        assert!(!c.info(&pods()).unwrap().fetching);
    }

    #[test]
    fn dropping_last_observer_of_empty_slot_frees_it() {
        let c = MemoryCache::new();
        let obs = c.observe(pods());
        assert_eq!(c.info(&pods()).unwrap().observers, 1);
        drop(obs);
        assert!(c.info(&pods()).is_none());
    }

    #[test]
    fn keys_skip_slots_without_values() {
        let c = MemoryCache::new();
        let _o = c.observe(nodes());
        c.set(pods(), json!([]));
        assert_eq!(c.keys(&|_| true), vec![pods()]);
    }
}
