//! Custom DNS override: an exact/wildcard host map with a configurable
//! address-selection policy, sitting in front of the system resolver.
//!
//! New module — the teacher has no DNS override layer — but it reuses the
//! crate's established idioms: `ArcSwap` for the hot-reloadable mapping
//! table (`server/state.rs`'s `RoutingState` pattern), the expiring store
//! for the per-host resolved-address cache, and `DashMap` for the
//! round-robin counters (`upstream/loadbalance/round_robin.rs`'s atomic
//! counter, one per key instead of one per balancer).

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::Rng;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::types::{DnsEntryConfig, DnsSecurityConfig};
use crate::store::ExpiringStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPolicy {
    RoundRobin,
    Random,
}

impl Default for AddressPolicy {
    fn default() -> Self {
        AddressPolicy::RoundRobin
    }
}

#[derive(Debug, Clone, Default)]
pub struct DnsEntry {
    pub addresses: Vec<String>,
    pub policy: AddressPolicy,
    /// `< 0` means "use the global default".
    pub ttl_override_secs: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CustomDnsMappings {
    pub exact: HashMap<String, DnsEntry>,
    pub wildcard: HashMap<String, DnsEntry>,
}

impl From<&DnsEntryConfig> for DnsEntry {
    fn from(cfg: &DnsEntryConfig) -> Self {
        let policy = match cfg.policy.as_str() {
            "random" => AddressPolicy::Random,
            "round_robin" => AddressPolicy::RoundRobin,
            other => {
                warn!("dns: unknown address policy {other}, defaulting to round_robin");
                AddressPolicy::RoundRobin
            }
        };
        DnsEntry {
            addresses: cfg.addresses.clone(),
            policy,
            ttl_override_secs: cfg.ttl_override_secs,
        }
    }
}

impl From<&DnsSecurityConfig> for CustomDnsMappings {
    fn from(cfg: &DnsSecurityConfig) -> Self {
        CustomDnsMappings {
            exact: cfg.exact.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            wildcard: cfg.wildcard.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
        }
    }
}

pub struct CustomDns {
    mappings: ArcSwap<CustomDnsMappings>,
    cache: ExpiringStore<String, Arc<Vec<IpAddr>>>,
    round_robin_counters: DashMap<String, AtomicU64>,
    global_ttl: Duration,
}

impl CustomDns {
    pub fn new(mappings: CustomDnsMappings, global_ttl: Duration) -> Self {
        Self {
            mappings: ArcSwap::from_pointee(mappings),
            cache: ExpiringStore::new(),
            round_robin_counters: DashMap::new(),
            global_ttl,
        }
    }

    /// Atomically replaces the mapping tables and drops every cached
    /// resolution and round-robin counter.
    pub async fn reload(&self, mappings: CustomDnsMappings) {
        self.mappings.store(Arc::new(mappings));
        self.cache.dump_and_clear().await;
        self.round_robin_counters.clear();
    }

    fn find_entry(&self, host: &str) -> Option<DnsEntry> {
        let mappings = self.mappings.load();
        if let Some(entry) = mappings.exact.get(host) {
            return Some(entry.clone());
        }
        let remainder = host.split_once('.').map(|(_, rest)| rest)?;
        mappings.wildcard.get(remainder).cloned()
    }

    async fn resolved_addresses(&self, host: &str, entry: &DnsEntry) -> Arc<Vec<IpAddr>> {
        let ttl = if entry.ttl_override_secs >= 0 {
            Duration::from_secs(entry.ttl_override_secs as u64)
        } else {
            self.global_ttl
        };
        let cache_key = host.to_string();
        let addrs = entry.addresses.clone();
        self.cache
            .get_or_insert_with(
                cache_key,
                move || {
                    let parsed: Vec<IpAddr> = addrs
                        .iter()
                        .filter_map(|s| match s.parse::<IpAddr>() {
                            Ok(ip) => Some(ip),
                            Err(_) => {
                                debug!("dns: custom: invalid address {} skipped", s);
                                None
                            }
                        })
                        .collect();
                    Arc::new(parsed)
                },
                Some(ttl),
            )
            .await
    }

    /// Returns `None` to signal "fall back to the system resolver".
    pub async fn resolve(&self, host: &str) -> Option<IpAddr> {
        let entry = self.find_entry(host)?;
        let addresses = self.resolved_addresses(host, &entry).await;
        if addresses.is_empty() {
            return None;
        }
        match entry.policy {
            AddressPolicy::Random => {
                let idx = rand::thread_rng().gen_range(0..addresses.len());
                Some(addresses[idx])
            }
            AddressPolicy::RoundRobin => {
                let counter = self
                    .round_robin_counters
                    .entry(host.to_string())
                    .or_insert_with(|| AtomicU64::new(0));
                let count = counter.fetch_add(1, Ordering::Relaxed);
                Some(addresses[(count as usize) % addresses.len()])
            }
        }
    }

    /// Connect-callback contract: if `resolve` has an override, dial it
    /// directly (TCP_NODELAY); otherwise delegate to the system resolver via
    /// `(host, port)`.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> io::Result<TcpStream> {
        if let Some(ip) = self.resolve(host).await {
            let addr = SocketAddr::new(ip, port);
            let stream = tokio::select! {
                res = TcpStream::connect(addr) => res?,
                _ = cancel.cancelled() => return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled")),
            };
            stream.set_nodelay(true)?;
            Ok(stream)
        } else {
            tokio::select! {
                res = TcpStream::connect((host, port)) => res,
                _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings() -> CustomDnsMappings {
        let mut exact = HashMap::new();
        exact.insert(
            "api.example.com".to_string(),
            DnsEntry {
                addresses: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                policy: AddressPolicy::RoundRobin,
                ttl_override_secs: -1,
            },
        );
        let mut wildcard = HashMap::new();
        wildcard.insert(
            "example.com".to_string(),
            DnsEntry {
                addresses: vec!["10.0.1.1".to_string()],
                policy: AddressPolicy::Random,
                ttl_override_secs: -1,
            },
        );
        CustomDnsMappings { exact, wildcard }
    }

    #[tokio::test]
    async fn exact_match_wins_over_wildcard() {
        let dns = CustomDns::new(mappings(), Duration::from_secs(60));
        let ip = dns.resolve("api.example.com").await;
        assert!(matches!(ip, Some(addr) if addr == "10.0.0.1".parse::<IpAddr>().unwrap() || addr == "10.0.0.2".parse::<IpAddr>().unwrap()));
    }

    #[tokio::test]
    async fn wildcard_matches_subdomain() {
        let dns = CustomDns::new(mappings(), Duration::from_secs(60));
        let ip = dns.resolve("other.example.com").await;
        assert_eq!(ip, Some("10.0.1.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn unmatched_host_returns_none() {
        let dns = CustomDns::new(mappings(), Duration::from_secs(60));
        assert_eq!(dns.resolve("unrelated.org").await, None);
    }

    #[tokio::test]
    async fn round_robin_alternates() {
        let dns = CustomDns::new(mappings(), Duration::from_secs(60));
        let first = dns.resolve("api.example.com").await.unwrap();
        let second = dns.resolve("api.example.com").await.unwrap();
        assert_ne!(first, second);
        let third = dns.resolve("api.example.com").await.unwrap();
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn invalid_addresses_are_skipped() {
        let mut exact = HashMap::new();
        exact.insert(
            "bad.example.com".to_string(),
            DnsEntry {
                addresses: vec!["not-an-ip".to_string()],
                policy: AddressPolicy::RoundRobin,
                ttl_override_secs: -1,
            },
        );
        let dns = CustomDns::new(
            CustomDnsMappings {
                exact,
                wildcard: HashMap::new(),
            },
            Duration::from_secs(60),
        );
        assert_eq!(dns.resolve("bad.example.com").await, None);
    }

    #[test]
    fn config_conversion_maps_policy_and_defaults_unknown_to_round_robin() {
        let mut exact = HashMap::new();
        exact.insert(
            "svc.example.com".to_string(),
            DnsEntryConfig {
                addresses: vec!["10.0.0.9".to_string()],
                policy: "weird".to_string(),
                ttl_override_secs: -1,
            },
        );
        let cfg = DnsSecurityConfig {
            exact,
            wildcard: HashMap::new(),
            default_ttl_secs: 300,
        };
        let mappings = CustomDnsMappings::from(&cfg);
        assert_eq!(mappings.exact["svc.example.com"].policy, AddressPolicy::RoundRobin);
    }

    #[tokio::test]
    async fn reload_clears_cache_and_counters() {
        let dns = CustomDns::new(mappings(), Duration::from_secs(60));
        dns.resolve("api.example.com").await;
        dns.reload(CustomDnsMappings::default()).await;
        assert_eq!(dns.resolve("api.example.com").await, None);
    }
}
