//! Per-client token-bucket throttle for response-body egress.
//!
//! Not a reservation system: unused budget simply accumulates up to
//! `capacity_bytes`, same spirit as the rate limiter's token bucket but
//! measured in bytes rather than requests, and backed by the expiring store
//! so idle clients are reclaimed instead of leaking one bucket per IP
//! forever.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::types::ThrottleSecurityConfig;
use crate::store::ExpiringStore;

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub capacity_bytes: u64,
    pub period: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 1_000_000,
            period: Duration::from_secs(1),
        }
    }
}

impl From<&ThrottleSecurityConfig> for ThrottleConfig {
    fn from(cfg: &ThrottleSecurityConfig) -> Self {
        Self {
            capacity_bytes: cfg.capacity_bytes,
            period: Duration::from_secs(cfg.period_secs),
        }
    }
}

struct BucketInner {
    bytes: u64,
    last_refill: Instant,
}

/// A single client's byte budget. `alloc_token` is the only mutating
/// operation — callers ask for up to `n` bytes and get back however many
/// are currently available (possibly 0, possibly all of `n`).
pub struct ClientThrottledLimit {
    inner: Mutex<BucketInner>,
    capacity_bytes: u64,
    bytes_per_sec: f64,
}

impl ClientThrottledLimit {
    fn new(config: &ThrottleConfig) -> Self {
        Self {
            inner: Mutex::new(BucketInner {
                bytes: config.capacity_bytes,
                last_refill: Instant::now(),
            }),
            capacity_bytes: config.capacity_bytes,
            bytes_per_sec: config.capacity_bytes as f64 / config.period.as_secs_f64().max(1e-6),
        }
    }

    /// Returns the number of bytes (`<= requested`) the caller may send now.
    pub async fn alloc_token(&self, requested: u64) -> u64 {
        let now = Instant::now();
        let mut b = self.inner.lock().await;
        let elapsed = now.saturating_duration_since(b.last_refill);
        if !elapsed.is_zero() {
            let refill = (elapsed.as_secs_f64() * self.bytes_per_sec) as u64;
            b.bytes = (b.bytes + refill).min(self.capacity_bytes);
            b.last_refill = now;
        }
        let granted = requested.min(b.bytes);
        b.bytes -= granted;
        granted
    }
}

/// Registry of per-client throttles, keyed by an opaque client key (usually
/// the client IP).
pub struct Throttle {
    store: ExpiringStore<String, Arc<ClientThrottledLimit>>,
    config: ThrottleConfig,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            store: ExpiringStore::new(),
            config,
        }
    }

    /// How long to back off when less than the requested amount was granted.
    pub fn backoff(&self) -> Duration {
        self.config.period / 4
    }

    pub async fn alloc_token(&self, client_key: &str, requested: u64) -> u64 {
        let idle_ttl = self.config.period * 8;
        let config = self.config;
        let bucket = self
            .store
            .get_or_insert_with(
                client_key.to_string(),
                move || Arc::new(ClientThrottledLimit::new(&config)),
                Some(idle_ttl),
            )
            .await;
        bucket.alloc_token(requested).await
    }
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<Throttle>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_up_to_capacity_then_throttles() {
        let throttle = Throttle::new(ThrottleConfig {
            capacity_bytes: 100,
            period: Duration::from_secs(1),
        });
        let granted = throttle.alloc_token("client-a", 150).await;
        assert_eq!(granted, 100);
        let granted2 = throttle.alloc_token("client-a", 50).await;
        assert_eq!(granted2, 0);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let throttle = Throttle::new(ThrottleConfig {
            capacity_bytes: 100,
            period: Duration::from_millis(100),
        });
        throttle.alloc_token("client-b", 100).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        let granted = throttle.alloc_token("client-b", 100).await;
        assert!(granted > 0, "expected some refill, got {}", granted);
    }

    #[tokio::test]
    async fn clients_are_independent() {
        let throttle = Throttle::new(ThrottleConfig {
            capacity_bytes: 10,
            period: Duration::from_secs(1),
        });
        assert_eq!(throttle.alloc_token("a", 10).await, 10);
        assert_eq!(throttle.alloc_token("b", 10).await, 10);
    }
}
