//! Named rate-limit policies: `Fixed`, `Sliding`, `Token`, `Concurrency`.
//!
//! Shape follows the original per-route `RateLimiter`: a `DashMap` per
//! partition key, `tokio::sync::Mutex`-protected inner state (the CAS-based
//! predecessor under-refilled under contention, so every per-key state here
//! uses the same async mutex), and a periodic GC sweep. `Fixed`/`Sliding`/
//! `Token` reuse that shape directly; `Concurrency` is new and tracks
//! in-flight counts plus an optional bounded wait queue instead of a
//! refillable budget.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use crate::config::types::{RateLimitKindConfig, RateLimitPolicyConfig};

const GC_EXPIRE_SECS: u64 = 300;
const GC_INTERVAL_SECS: u64 = 60;
const MAX_ENTRIES: usize = 100_000;
const PRECISION: u64 = 1_000_000;

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone)]
pub struct FixedConfig {
    pub limit: u64,
    pub period: Duration,
}

#[derive(Debug, Clone)]
pub struct SlidingConfig {
    pub limit: u64,
    pub window: Duration,
    pub segments_per_window: u32,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub tokens_per_period: u64,
    pub replenishment_period: Duration,
    pub burst: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub max_concurrent: u64,
    pub queue_limit: u64,
    pub queue_order: QueueOrder,
}

#[derive(Debug, Clone)]
pub enum PolicyKind {
    Fixed(FixedConfig),
    Sliding(SlidingConfig),
    Token(TokenConfig),
    Concurrency(ConcurrencyConfig),
}

/// Minimal partition-key grammar: the literal `all` collapses every caller
/// onto one shared counter; anything else is used as an opaque pre-computed
/// key (the pipeline resolves `{Path}`/`{IP}`/etc. templates the same way
/// the load balancer's `GenericHash` does, before calling in here).
#[derive(Debug, Clone)]
pub enum PartitionKey {
    All,
    Expr(String),
}

impl PartitionKey {
    pub fn resolve(&self, computed: &str) -> String {
        match self {
            PartitionKey::All => "all".to_string(),
            PartitionKey::Expr(_) => computed.to_string(),
        }
    }
}

pub struct PolicyResult {
    pub allowed: bool,
    pub rejected_status: u16,
}

struct TokenBucket {
    inner: Mutex<TokenBucketInner>,
    last_access: AtomicU64,
}

struct TokenBucketInner {
    tokens: u64,
    last_refill: u64,
    rate_per_us: f64,
    max_tokens: u64,
}

impl TokenBucket {
    fn new(cfg: &TokenConfig) -> Self {
        let rate_per_us = cfg.tokens_per_period as f64
            / cfg.replenishment_period.as_micros().max(1) as f64;
        let burst = cfg.burst.unwrap_or(cfg.tokens_per_period).max(1);
        let max_tokens = (cfg.tokens_per_period + burst) * PRECISION;
        let now = now_us();
        Self {
            inner: Mutex::new(TokenBucketInner {
                tokens: max_tokens,
                last_refill: now,
                rate_per_us,
                max_tokens,
            }),
            last_access: AtomicU64::new(now),
        }
    }

    async fn try_acquire(&self) -> bool {
        let now = now_us();
        self.last_access.store(now, Ordering::Relaxed);
        let mut b = self.inner.lock().await;
        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = (elapsed as f64 * b.rate_per_us * PRECISION as f64) as u64;
            b.tokens = (b.tokens + refill).min(b.max_tokens);
            b.last_refill = now;
        }
        if b.tokens >= PRECISION {
            b.tokens -= PRECISION;
            true
        } else {
            false
        }
    }
}

struct SlidingWindow {
    inner: Mutex<SlidingWindowInner>,
    last_access: AtomicU64,
}

struct SlidingWindowInner {
    current_count: u64,
    prev_count: u64,
    window_start: u64,
    max_count: u64,
    window_us: u64,
}

impl SlidingWindow {
    fn new(cfg: &SlidingConfig) -> Self {
        let now = now_us();
        Self {
            inner: Mutex::new(SlidingWindowInner {
                current_count: 0,
                prev_count: 0,
                window_start: now,
                max_count: cfg.limit.max(1),
                window_us: (cfg.window.as_micros() as u64).max(1),
            }),
            last_access: AtomicU64::new(now),
        }
    }

    async fn try_acquire(&self) -> bool {
        let now = now_us();
        self.last_access.store(now, Ordering::Relaxed);
        let mut w = self.inner.lock().await;
        while now.saturating_sub(w.window_start) >= w.window_us {
            w.prev_count = w.current_count;
            w.current_count = 0;
            w.window_start += w.window_us;
        }
        let elapsed = now.saturating_sub(w.window_start);
        let weight = 1.0 - (elapsed as f64 / w.window_us as f64);
        let estimated = (w.prev_count as f64 * weight) as u64 + w.current_count;
        if estimated < w.max_count {
            w.current_count += 1;
            true
        } else {
            false
        }
    }
}

struct FixedWindow {
    inner: Mutex<FixedWindowInner>,
    last_access: AtomicU64,
}

struct FixedWindowInner {
    count: u64,
    window_start: u64,
    limit: u64,
    window_us: u64,
}

impl FixedWindow {
    fn new(cfg: &FixedConfig) -> Self {
        let now = now_us();
        Self {
            inner: Mutex::new(FixedWindowInner {
                count: 0,
                window_start: now,
                limit: cfg.limit.max(1),
                window_us: (cfg.period.as_micros() as u64).max(1),
            }),
            last_access: AtomicU64::new(now),
        }
    }

    async fn try_acquire(&self) -> bool {
        let now = now_us();
        self.last_access.store(now, Ordering::Relaxed);
        let mut w = self.inner.lock().await;
        if now.saturating_sub(w.window_start) >= w.window_us {
            w.window_start = now;
            w.count = 0;
        }
        if w.count < w.limit {
            w.count += 1;
            true
        } else {
            false
        }
    }
}

struct ConcurrencyState {
    in_flight: u64,
    max_concurrent: u64,
    queue: VecDeque<oneshot::Sender<bool>>,
    queue_limit: u64,
    order: QueueOrder,
}

struct ConcurrencySlot {
    state: StdMutex<ConcurrencyState>,
    last_access: AtomicU64,
}

/// RAII guard: dropping it releases the concurrency slot (or hands it
/// straight to the next queued waiter).
pub struct ConcurrencyPermit {
    slot: Arc<ConcurrencySlot>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let mut state = self.slot.state.lock().unwrap();
        let next = match state.order {
            QueueOrder::OldestFirst => state.queue.pop_front(),
            QueueOrder::NewestFirst => state.queue.pop_back(),
        };
        if let Some(tx) = next {
            // Slot transfers directly to the waiter; in_flight is unchanged.
            let _ = tx.send(true);
        } else {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }
}

impl ConcurrencySlot {
    fn new(cfg: &ConcurrencyConfig) -> Self {
        Self {
            state: StdMutex::new(ConcurrencyState {
                in_flight: 0,
                max_concurrent: cfg.max_concurrent.max(1),
                queue: VecDeque::new(),
                queue_limit: cfg.queue_limit,
                order: cfg.queue_order,
            }),
            last_access: AtomicU64::new(now_us()),
        }
    }

    async fn acquire(self: &Arc<Self>) -> Option<ConcurrencyPermit> {
        self.last_access.store(now_us(), Ordering::Relaxed);
        let rx = {
            let mut state = self.state.lock().unwrap();
            if state.in_flight < state.max_concurrent {
                state.in_flight += 1;
                return Some(ConcurrencyPermit { slot: self.clone() });
            }
            if state.queue.len() as u64 >= state.queue_limit {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            rx
        };
        match rx.await {
            Ok(true) => Some(ConcurrencyPermit { slot: self.clone() }),
            _ => None,
        }
    }
}

enum LimiterState {
    Fixed(DashMap<String, Arc<FixedWindow>>, FixedConfig),
    Sliding(DashMap<String, Arc<SlidingWindow>>, SlidingConfig),
    Token(DashMap<String, Arc<TokenBucket>>, TokenConfig),
    Concurrency(DashMap<String, Arc<ConcurrencySlot>>, ConcurrencyConfig),
}

pub struct Policy {
    pub name: String,
    pub partition_key: PartitionKey,
    pub rejected_status: u16,
    state: LimiterState,
}

impl Policy {
    pub fn new(name: impl Into<String>, partition_key: PartitionKey, rejected_status: u16, kind: PolicyKind) -> Self {
        let state = match kind {
            PolicyKind::Fixed(cfg) => LimiterState::Fixed(DashMap::new(), cfg),
            PolicyKind::Sliding(cfg) => LimiterState::Sliding(DashMap::new(), cfg),
            PolicyKind::Token(cfg) => LimiterState::Token(DashMap::new(), cfg),
            PolicyKind::Concurrency(cfg) => LimiterState::Concurrency(DashMap::new(), cfg),
        };
        Self {
            name: name.into(),
            partition_key,
            rejected_status,
            state,
        }
    }

    /// Applies the policy for one request in a non-concurrency policy.
    /// Concurrency policies must call [`Policy::acquire_concurrency`] instead
    /// since they return a guard rather than a yes/no answer.
    pub async fn check(&self, key: &str) -> PolicyResult {
        let allowed = match &self.state {
            LimiterState::Fixed(map, cfg) => {
                let w = map
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(FixedWindow::new(cfg)))
                    .clone();
                w.try_acquire().await
            }
            LimiterState::Sliding(map, cfg) => {
                let w = map
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(SlidingWindow::new(cfg)))
                    .clone();
                w.try_acquire().await
            }
            LimiterState::Token(map, cfg) => {
                let b = map
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(TokenBucket::new(cfg)))
                    .clone();
                b.try_acquire().await
            }
            LimiterState::Concurrency(..) => {
                panic!("concurrency policies must use acquire_concurrency");
            }
        };
        PolicyResult {
            allowed,
            rejected_status: self.rejected_status,
        }
    }

    pub async fn acquire_concurrency(&self, key: &str) -> Option<ConcurrencyPermit> {
        match &self.state {
            LimiterState::Concurrency(map, cfg) => {
                let slot = map
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(ConcurrencySlot::new(cfg)))
                    .clone();
                slot.acquire().await
            }
            _ => None,
        }
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self.state, LimiterState::Concurrency(..))
    }

    fn gc(&self) {
        let now = now_us();
        let expire_us = GC_EXPIRE_SECS * 1_000_000;
        match &self.state {
            LimiterState::Fixed(map, _) => {
                map.retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
                evict_overflow(map, now);
            }
            LimiterState::Sliding(map, _) => {
                map.retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
                evict_overflow(map, now);
            }
            LimiterState::Token(map, _) => {
                map.retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
                evict_overflow(map, now);
            }
            LimiterState::Concurrency(map, _) => {
                map.retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
                evict_overflow(map, now);
            }
        }
    }
}

fn evict_overflow<V>(map: &DashMap<String, Arc<V>>, now: u64)
where
    V: HasLastAccess,
{
    let overflow = map.len().saturating_sub(MAX_ENTRIES);
    if overflow == 0 {
        return;
    }
    let mut entries: Vec<(String, u64)> = map
        .iter()
        .map(|r| (r.key().clone(), now.saturating_sub(r.value().last_access().load(Ordering::Relaxed))))
        .collect();
    entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
    for (key, _) in entries.into_iter().take(overflow) {
        map.remove(&key);
    }
}

trait HasLastAccess {
    fn last_access(&self) -> &AtomicU64;
}
impl HasLastAccess for FixedWindow {
    fn last_access(&self) -> &AtomicU64 {
        &self.last_access
    }
}
impl HasLastAccess for SlidingWindow {
    fn last_access(&self) -> &AtomicU64 {
        &self.last_access
    }
}
impl HasLastAccess for TokenBucket {
    fn last_access(&self) -> &AtomicU64 {
        &self.last_access
    }
}
impl HasLastAccess for ConcurrencySlot {
    fn last_access(&self) -> &AtomicU64 {
        &self.last_access
    }
}

/// Registry of named policies. `get` never errors: an unknown name falls
/// back to the configured default policy (if any), matching the spec's
/// `Get(key)` contract.
pub struct RateLimiterRegistry {
    policies: HashMap<String, Arc<Policy>>,
    default_name: Option<String>,
}

impl RateLimiterRegistry {
    pub fn new(policies: Vec<Policy>, default_name: Option<String>) -> Self {
        let policies = policies
            .into_iter()
            .map(|p| (p.name.clone(), Arc::new(p)))
            .collect();
        Self {
            policies,
            default_name,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        if let Some(p) = self.policies.get(name) {
            return Some(p.clone());
        }
        self.default_name
            .as_ref()
            .and_then(|d| self.policies.get(d))
            .cloned()
    }

    /// Builds a registry from config, dropping (with a Warn log) any policy
    /// whose `queue_order` string is unrecognized rather than aborting the
    /// whole load.
    pub fn from_config(policies: &[RateLimitPolicyConfig], default_name: Option<String>) -> Self {
        let built = policies
            .iter()
            .filter_map(|p| {
                let partition_key = if p.partition_key == "all" {
                    PartitionKey::All
                } else {
                    PartitionKey::Expr(p.partition_key.clone())
                };
                let kind = match &p.kind {
                    RateLimitKindConfig::Fixed { limit, period_secs } => PolicyKind::Fixed(FixedConfig {
                        limit: *limit,
                        period: Duration::from_secs(*period_secs),
                    }),
                    RateLimitKindConfig::Sliding {
                        limit,
                        window_secs,
                        segments_per_window,
                    } => PolicyKind::Sliding(SlidingConfig {
                        limit: *limit,
                        window: Duration::from_secs(*window_secs),
                        segments_per_window: *segments_per_window,
                    }),
                    RateLimitKindConfig::Token {
                        tokens_per_period,
                        replenishment_period_secs,
                        burst,
                    } => PolicyKind::Token(TokenConfig {
                        tokens_per_period: *tokens_per_period,
                        replenishment_period: Duration::from_secs(*replenishment_period_secs),
                        burst: *burst,
                    }),
                    RateLimitKindConfig::Concurrency {
                        max_concurrent,
                        queue_limit,
                        queue_order,
                    } => {
                        let order = match queue_order.as_str() {
                            "oldest_first" => QueueOrder::OldestFirst,
                            "newest_first" => QueueOrder::NewestFirst,
                            other => {
                                warn!("ratelimit: policy {} dropped, unknown queue_order {other}", p.name);
                                return None;
                            }
                        };
                        PolicyKind::Concurrency(ConcurrencyConfig {
                            max_concurrent: *max_concurrent,
                            queue_limit: *queue_limit,
                            queue_order: order,
                        })
                    }
                };
                Some(Policy::new(p.name.clone(), partition_key, p.rejected_status, kind))
            })
            .collect();
        Self::new(built, default_name)
    }

    pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                for policy in registry.policies.values() {
                    policy.gc();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_window_allows_up_to_limit() {
        let policy = Policy::new(
            "f",
            PartitionKey::All,
            429,
            PolicyKind::Fixed(FixedConfig {
                limit: 3,
                period: Duration::from_secs(60),
            }),
        );
        let mut allowed = 0;
        for _ in 0..5 {
            if policy.check("k").await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn token_bucket_allows_burst_then_throttles() {
        let policy = Policy::new(
            "t",
            PartitionKey::All,
            429,
            PolicyKind::Token(TokenConfig {
                tokens_per_period: 1,
                replenishment_period: Duration::from_secs(10),
                burst: Some(1),
            }),
        );
        assert!(policy.check("k").await.allowed);
        assert!(policy.check("k").await.allowed);
        assert!(!policy.check("k").await.allowed);
    }

    #[tokio::test]
    async fn sliding_window_independent_per_key() {
        let policy = Policy::new(
            "s",
            PartitionKey::Expr("route".into()),
            429,
            PolicyKind::Sliding(SlidingConfig {
                limit: 2,
                window: Duration::from_secs(60),
                segments_per_window: 4,
            }),
        );
        assert!(policy.check("a").await.allowed);
        assert!(policy.check("a").await.allowed);
        assert!(!policy.check("a").await.allowed);
        assert!(policy.check("b").await.allowed);
    }

    #[tokio::test]
    async fn concurrency_rejects_beyond_max_and_queue() {
        let policy = Policy::new(
            "c",
            PartitionKey::All,
            429,
            PolicyKind::Concurrency(ConcurrencyConfig {
                max_concurrent: 1,
                queue_limit: 0,
                queue_order: QueueOrder::OldestFirst,
            }),
        );
        let p1 = policy.acquire_concurrency("k").await;
        assert!(p1.is_some());
        let p2 = policy.acquire_concurrency("k").await.map(|_| ());
        assert!(p2.is_none());
        drop(p1);
        let p3 = policy.acquire_concurrency("k").await;
        assert!(p3.is_some());
    }

    #[tokio::test]
    async fn concurrency_queue_hands_off_slot_on_release() {
        let policy = Arc::new(Policy::new(
            "c2",
            PartitionKey::All,
            429,
            PolicyKind::Concurrency(ConcurrencyConfig {
                max_concurrent: 1,
                queue_limit: 1,
                queue_order: QueueOrder::OldestFirst,
            }),
        ));
        let permit = policy.acquire_concurrency("k").await.unwrap();

        let waiter_policy = policy.clone();
        let waiter = tokio::spawn(async move { waiter_policy.acquire_concurrency("k").await });

        tokio::task::yield_now().await;
        drop(permit);

        let result = waiter.await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn from_config_builds_working_policies_and_skips_bad_queue_order() {
        let policies = vec![
            RateLimitPolicyConfig {
                name: "fixed".to_string(),
                partition_key: "all".to_string(),
                rejected_status: 429,
                kind: RateLimitKindConfig::Fixed {
                    limit: 1,
                    period_secs: 60,
                },
            },
            RateLimitPolicyConfig {
                name: "bad-concurrency".to_string(),
                partition_key: "all".to_string(),
                rejected_status: 429,
                kind: RateLimitKindConfig::Concurrency {
                    max_concurrent: 1,
                    queue_limit: 0,
                    queue_order: "sideways".to_string(),
                },
            },
        ];
        let registry = RateLimiterRegistry::from_config(&policies, None);
        let policy = registry.get("fixed").unwrap();
        assert!(policy.check("k").await.allowed);
        assert!(!policy.check("k").await.allowed);
        assert!(registry.get("bad-concurrency").is_none());
    }

    #[tokio::test]
    async fn registry_falls_back_to_default() {
        let policy = Policy::new(
            "named",
            PartitionKey::All,
            429,
            PolicyKind::Fixed(FixedConfig {
                limit: 1,
                period: Duration::from_secs(1),
            }),
        );
        let registry = RateLimiterRegistry::new(vec![policy], Some("named".to_string()));
        assert!(registry.get("named").is_some());
        assert!(registry.get("unknown").is_some());

        let registry_no_default = RateLimiterRegistry::new(vec![], None);
        assert!(registry_no_default.get("anything").is_none());
    }
}
