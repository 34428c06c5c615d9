//! Thread-safe map with per-entry TTL/sliding expiry and a background sweeper.
//!
//! Backs ban records, per-client connection counters, custom-DNS caches and
//! the token-bucket throttle. A single `tokio::sync::Mutex` guards the whole
//! table: per-key work here is cheap (a hash lookup plus a small struct
//! update), so a central lock is simpler and no slower in practice than a
//! sharded map, and it makes `do_locked` trivially correct.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

/// One entry in the store. Exactly one of `expiry_at` / `sliding` is
/// authoritative; both `None` means the entry never expires.
#[derive(Debug, Clone)]
pub struct ExpiringEntry<V> {
    pub value: V,
    expiry_at: Option<Instant>,
    sliding: Option<Duration>,
    last_access: Instant,
}

impl<V> ExpiringEntry<V> {
    fn new(value: V, now: Instant) -> Self {
        Self {
            value,
            expiry_at: None,
            sliding: None,
            last_access: now,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        if let Some(window) = self.sliding {
            now > self.last_access + window
        } else if let Some(at) = self.expiry_at {
            now > at
        } else {
            false
        }
    }
}

/// Event emitted by the periodic sweeper.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ItemExpired { removed: usize },
    CleanupCompleted {
        removed: usize,
        remaining: usize,
        at: Instant,
    },
}

struct Inner<K, V> {
    entries: HashMap<K, ExpiringEntry<V>>,
}

/// An expiring key-value store, generic over key `K` and value `V`.
///
/// Construct one per logical counter/cache (bans, per-client throttles,
/// DNS resolution cache, ...) — each gets its own lock and sweep loop.
pub struct ExpiringStore<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> Default for ExpiringStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
            }),
        }
    }
}

impl<K, V> ExpiringStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert/overwrite `k`, expiring at `now + ttl` (or never, if `ttl` is
    /// `None`).
    pub async fn add_or_update(&self, k: K, v: V, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let mut entry = ExpiringEntry::new(v, now);
        entry.expiry_at = ttl.map(|d| now + d);
        guard.entries.insert(k, entry);
    }

    /// Insert/overwrite `k` with a sliding-expiry window: the entry expires
    /// `window` after its *last access*, not after insertion.
    pub async fn add_or_update_sliding(&self, k: K, v: V, window: Duration) {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let mut entry = ExpiringEntry::new(v, now);
        entry.sliding = Some(window);
        guard.entries.insert(k, entry);
    }

    /// Returns `Some(value)` if present and not expired. Lazily removes an
    /// expired entry on access, and bumps `last_access` for sliding entries.
    pub async fn try_get(&self, k: &K) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let expired = match guard.entries.get(k) {
            Some(e) => e.is_expired(now),
            None => return None,
        };
        if expired {
            guard.entries.remove(k);
            return None;
        }
        let entry = guard.entries.get_mut(k).expect("checked above");
        if entry.sliding.is_some() {
            entry.last_access = now;
        }
        Some(entry.value.clone())
    }

    /// Atomically get-or-create: if `k` is absent or expired, `create` is
    /// invoked to produce the initial value, which is stored with `ttl`.
    pub async fn get_or_insert_with<F>(&self, k: K, create: F, ttl: Option<Duration>) -> V
    where
        F: FnOnce() -> V,
    {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let needs_init = match guard.entries.get(&k) {
            Some(e) => e.is_expired(now),
            None => true,
        };
        if needs_init {
            let mut entry = ExpiringEntry::new(create(), now);
            entry.expiry_at = ttl.map(|d| now + d);
            guard.entries.insert(k.clone(), entry);
        }
        guard.entries.get(&k).expect("just inserted").value.clone()
    }

    /// Run `f` while holding the store's lock, either against `create()`'s
    /// result (first access) or the existing value. Use this for read-modify
    /// -write sequences that must be atomic with respect to other store
    /// operations on the same key. `f` must not call back into this store.
    pub async fn do_locked<F, C, R>(&self, k: K, create: C, f: F) -> R
    where
        C: FnOnce() -> V,
        F: FnOnce(&mut V) -> R,
    {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let needs_init = match guard.entries.get(&k) {
            Some(e) => e.is_expired(now),
            None => true,
        };
        if needs_init {
            guard.entries.insert(k.clone(), ExpiringEntry::new(create(), now));
        }
        let entry = guard.entries.get_mut(&k).expect("just inserted");
        f(&mut entry.value)
    }

    pub async fn extend_expiration(&self, k: &K, delta: Duration) {
        let mut guard = self.inner.lock().await;
        if let Some(e) = guard.entries.get_mut(k) {
            e.expiry_at = Some(e.expiry_at.unwrap_or_else(Instant::now) + delta);
        }
    }

    /// Set (or reset) `k`'s absolute expiry to `now + delta`.
    pub async fn expire(&self, k: &K, delta: Duration) {
        let mut guard = self.inner.lock().await;
        if let Some(e) = guard.entries.get_mut(k) {
            e.expiry_at = Some(Instant::now() + delta);
            e.sliding = None;
        }
    }

    pub async fn expire_at(&self, k: &K, at: Instant) {
        let mut guard = self.inner.lock().await;
        if let Some(e) = guard.entries.get_mut(k) {
            e.expiry_at = Some(at);
            e.sliding = None;
        }
    }

    /// Remove any expiry from `k` — it lives until explicitly `remove`d.
    pub async fn del_ttl(&self, k: &K) {
        let mut guard = self.inner.lock().await;
        if let Some(e) = guard.entries.get_mut(k) {
            e.expiry_at = None;
            e.sliding = None;
        }
    }

    pub async fn remove(&self, k: &K) -> Option<V> {
        let mut guard = self.inner.lock().await;
        guard.entries.remove(k).map(|e| e.value)
    }

    /// A point-in-time copy of all non-expired entries.
    pub async fn snapshot(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        let guard = self.inner.lock().await;
        guard
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Atomically take all entries and clear the store.
    pub async fn dump_and_clear(&self) -> Vec<(K, V)> {
        let mut guard = self.inner.lock().await;
        guard
            .entries
            .drain()
            .map(|(k, e)| (k, e.value))
            .collect()
    }

    /// Remove every entry for which `pred` returns `true`.
    pub async fn filter_remove<P>(&self, mut pred: P)
    where
        P: FnMut(&K, &V) -> bool,
    {
        let mut guard = self.inner.lock().await;
        guard.entries.retain(|k, e| !pred(k, &e.value));
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Remove all expired entries now; returns how many were removed and how
    /// many remain. Used by both the periodic sweeper and ad-hoc callers.
    async fn sweep_once(&self) -> (usize, usize) {
        let now = Instant::now();
        let mut guard: MutexGuard<'_, Inner<K, V>> = self.inner.lock().await;
        let before = guard.entries.len();
        guard.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - guard.entries.len();
        (removed, guard.entries.len())
    }
}

impl<K, V> ExpiringStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Spawn the periodic sweeper task. `on_event` is invoked (synchronously,
    /// off the lock) after each sweep pass, even when nothing was removed.
    pub fn spawn_sweeper<F>(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        mut on_event: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(StoreEvent) + Send + 'static,
    {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let (removed, remaining) = store.sweep_once().await;
                if removed > 0 {
                    on_event(StoreEvent::ItemExpired { removed });
                }
                on_event(StoreEvent::CleanupCompleted {
                    removed,
                    remaining,
                    at: Instant::now(),
                });
            }
        })
    }
}

/// Typed numeric increment on a store keyed by integer counters. `incr`
/// returns 0 on type-coercion failure per spec rather than raising — there
/// is no type coercion in a generically-typed Rust store, so this simply
/// models the integer case directly.
impl<K> ExpiringStore<K, i64>
where
    K: Eq + Hash + Clone,
{
    pub async fn incr(&self, k: K, delta: i64, init: i64, _ttl: Option<Duration>) -> i64 {
        self.do_locked(
            k,
            || init,
            |v| {
                *v = v.saturating_add(delta);
                *v
            },
        )
        .await
    }
}

pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn add_and_get() {
        let store: ExpiringStore<String, i64> = ExpiringStore::new();
        store.add_or_update("a".to_string(), 1, None).await;
        assert_eq!(store.try_get(&"a".to_string()).await, Some(1));
    }

    #[tokio::test]
    async fn ttl_expires() {
        let store: ExpiringStore<String, i64> = ExpiringStore::new();
        store
            .add_or_update("a".to_string(), 1, Some(Duration::from_millis(10)))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.try_get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn sliding_resets_on_access() {
        let store: ExpiringStore<String, i64> = ExpiringStore::new();
        store
            .add_or_update_sliding("a".to_string(), 1, Duration::from_millis(50))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        // accessed before the window elapses — should reset the clock
        assert_eq!(store.try_get(&"a".to_string()).await, Some(1));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.try_get(&"a".to_string()).await, Some(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.try_get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn incr_default_and_accumulate() {
        let store: ExpiringStore<String, i64> = ExpiringStore::new();
        assert_eq!(store.incr("c".to_string(), 1, 0, None).await, 1);
        assert_eq!(store.incr("c".to_string(), 5, 0, None).await, 6);
    }

    #[tokio::test]
    async fn filter_remove_matches_predicate() {
        let store: ExpiringStore<String, i64> = ExpiringStore::new();
        store.add_or_update("keep".to_string(), 1, None).await;
        store.add_or_update("drop".to_string(), 2, None).await;
        store.filter_remove(|k, _| k == "drop").await;
        assert_eq!(store.try_get(&"drop".to_string()).await, None);
        assert_eq!(store.try_get(&"keep".to_string()).await, Some(1));
    }

    #[tokio::test]
    async fn dump_and_clear_empties_store() {
        let store: ExpiringStore<String, i64> = ExpiringStore::new();
        store.add_or_update("a".to_string(), 1, None).await;
        let dumped = store.dump_and_clear().await;
        assert_eq!(dumped.len(), 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let store = std::sync::Arc::new(ExpiringStore::<String, i64>::new());
        store
            .add_or_update("a".to_string(), 1, Some(Duration::from_millis(10)))
            .await;
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let events2 = events.clone();
        let handle = store.spawn_sweeper(Duration::from_millis(20), move |ev| {
            events2.lock().unwrap().push(ev);
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            StoreEvent::ItemExpired { removed } if *removed > 0
        )));
    }
}
