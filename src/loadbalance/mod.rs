//! The six load-balancing policies, given a context and a set of
//! already-healthy destinations.
//!
//! `WeightedRoundRobin` and `WeightedRandom` keep the teacher's
//! GCD-normalized-prefix-sum and prefix-sum-binary-search shapes
//! (`upstream/loadbalance/round_robin.rs`, `.../random.rs`); `IpHash` and
//! `GenericHash` are new (MD5-based, per destination-count modulo);
//! `WeightedLeastConnections` is a full argmin rather than the teacher's
//! power-of-two-choices approximation (`least_request.rs`) since the spec
//! wants deterministic least-loaded selection, not O(1) sampling;
//! `ConsistentHash` is new, grounded on the radix tree's GCD helper
//! (`routing/radix_tree.rs`) for the weight-normalization idiom it reuses
//! and nothing else (hash ring construction has no teacher analog).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use md5::{Digest, Md5};
use rand::Rng;
use tracing::warn;

use crate::config::ClusterConfig;

/// One candidate backend. `active_requests` is shared across rebuilds of
/// the destination list so in-flight counts survive a config reload.
#[derive(Debug, Clone)]
pub struct Destination {
    pub id: String,
    pub weight: u32,
    pub metadata: HashMap<String, String>,
    pub active_requests: Arc<AtomicUsize>,
}

impl Destination {
    pub fn new(id: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            weight: weight.max(1),
            metadata: HashMap::new(),
            active_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn virtual_nodes(&self, default: u32) -> u32 {
        self.metadata
            .get("VirtualNodes")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

/// Everything a hash-based policy might need to expand its key template.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub path: String,
    pub query: String,
    pub client_ip: Option<IpAddr>,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
}

fn md5_u32_le(input: &str) -> u32 {
    let digest = Md5::digest(input.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Expands `{Path}`, `{Query}`, `{IP}`, `{Query.NAME}`, `{Header.NAME}`,
/// `{Cookie.NAME}`. Missing tokens substitute the empty string.
pub fn expand_template(template: &str, ctx: &SelectionContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start + 1..];
        let Some(end) = rest.find('}') else {
            out.push('{');
            out.push_str(rest);
            return out;
        };
        let token = &rest[..end];
        rest = &rest[end + 1..];
        out.push_str(&resolve_token(token, ctx));
    }
    out.push_str(rest);
    out
}

fn resolve_token(token: &str, ctx: &SelectionContext) -> String {
    if token == "Path" {
        return ctx.path.clone();
    }
    if token == "Query" {
        return ctx.query.clone();
    }
    if token == "IP" {
        return ctx.client_ip.map(|ip| ip.to_string()).unwrap_or_default();
    }
    if let Some(name) = token.strip_prefix("Query.") {
        return ctx.query_params.get(name).cloned().unwrap_or_default();
    }
    if let Some(name) = token.strip_prefix("Header.") {
        return ctx.headers.get(name).cloned().unwrap_or_default();
    }
    if let Some(name) = token.strip_prefix("Cookie.") {
        return ctx.cookies.get(name).cloned().unwrap_or_default();
    }
    String::new()
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn client_ip_for_hash(ctx: &SelectionContext) -> Option<IpAddr> {
    if let Some(xff) = ctx.headers.get("x-forwarded-for") {
        if let Some(first) = xff.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return Some(ip);
            }
        }
    }
    if let Some(real_ip) = ctx.headers.get("x-real-ip") {
        if let Ok(ip) = real_ip.trim().parse() {
            return Some(ip);
        }
    }
    ctx.client_ip
}

struct WrrSequence {
    sequence: Vec<usize>,
    counter: AtomicU64,
}

fn build_wrr_sequence(destinations: &[Destination]) -> WrrSequence {
    let weights: Vec<u64> = destinations.iter().map(|d| d.weight as u64).collect();
    let g = weights.iter().copied().fold(0u64, gcd).max(1);
    let mut sequence = Vec::new();
    for (idx, w) in weights.iter().enumerate() {
        let reps = (w / g).max(1);
        for _ in 0..reps {
            sequence.push(idx);
        }
    }
    WrrSequence {
        sequence,
        counter: AtomicU64::new(0),
    }
}

fn cache_key(cluster_id: &str, destinations: &[Destination]) -> String {
    let mut ids: Vec<&str> = destinations.iter().map(|d| d.id.as_str()).collect();
    ids.sort_unstable();
    format!("{cluster_id}:{}", ids.join(","))
}

struct RingEntry {
    hash: u32,
    index: usize,
}

struct Ring {
    entries: Vec<RingEntry>,
}

fn build_ring(destinations: &[Destination], template_default_vnodes: u32) -> Ring {
    let mut entries = Vec::new();
    for (idx, dest) in destinations.iter().enumerate() {
        let vnodes = dest.virtual_nodes(template_default_vnodes);
        for i in 0..vnodes {
            let hash = md5_u32_le(&format!("{}:{}", dest.id, i));
            entries.push(RingEntry { hash, index: idx });
        }
    }
    entries.sort_unstable_by_key(|e| e.hash);
    Ring { entries }
}

impl Ring {
    fn lookup(&self, hash: u32) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let min = self.entries.first().unwrap().hash;
        let max = self.entries.last().unwrap().hash;
        if hash <= min || hash > max {
            return self.entries[0].index;
        }
        let pos = self.entries.partition_point(|e| e.hash < hash);
        self.entries[pos.min(self.entries.len() - 1)].index
    }
}

#[derive(Debug, Clone)]
pub enum Policy {
    WeightedRoundRobin,
    WeightedLeastConnections,
    IpHash,
    GenericHash { template: String },
    WeightedRandom,
    ConsistentHash { template: String, virtual_nodes: u32 },
}

impl Default for Policy {
    fn default() -> Self {
        Policy::WeightedRoundRobin
    }
}

impl From<&ClusterConfig> for Policy {
    /// Unknown `type` strings fall back to `WeightedRoundRobin` with a
    /// warning, same as an invalid limiter `Name` in the rate-limit config.
    fn from(cfg: &ClusterConfig) -> Self {
        let virtual_nodes = cfg.virtual_nodes.unwrap_or(150);
        match cfg.lb_type.as_str() {
            "weighted_round_robin" | "roundrobin" | "round_robin" => Policy::WeightedRoundRobin,
            "weighted_least_connections" | "least_request" | "least_conn" => {
                Policy::WeightedLeastConnections
            }
            "ip_hash" => Policy::IpHash,
            "generic_hash" => Policy::GenericHash {
                template: cfg.hash_key.clone().unwrap_or_else(|| "{Path}".to_string()),
            },
            "weighted_random" | "random" => Policy::WeightedRandom,
            "consistent_hash" => Policy::ConsistentHash {
                template: cfg.hash_key.clone().unwrap_or_else(|| "{IP}".to_string()),
                virtual_nodes,
            },
            other => {
                warn!(
                    "loadbalance: unknown lb policy '{other}' on cluster '{}', falling back to weighted_round_robin",
                    cfg.name
                );
                Policy::WeightedRoundRobin
            }
        }
    }
}

/// Per-cluster selector. Caches the WRR sequence and the consistent-hash
/// ring keyed by `clusterId + sorted destination ids`, same invalidation
/// shape as the teacher's per-balancer `ArcSwap<BalancerState>`.
pub struct LoadBalancer {
    cluster_id: String,
    policy: Policy,
    wrr_cache: DashMap<String, Arc<WrrSequence>>,
    ring_cache: DashMap<String, Arc<Ring>>,
}

impl LoadBalancer {
    pub fn new(cluster_id: impl Into<String>, policy: Policy) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            policy,
            wrr_cache: DashMap::new(),
            ring_cache: DashMap::new(),
        }
    }

    pub fn select<'a>(
        &self,
        ctx: &SelectionContext,
        available: &'a [Destination],
    ) -> Option<&'a Destination> {
        if available.is_empty() {
            return None;
        }
        if available.len() == 1 {
            return Some(&available[0]);
        }
        match &self.policy {
            Policy::WeightedRoundRobin => self.select_wrr(available),
            Policy::WeightedLeastConnections => select_least_connections(available),
            Policy::IpHash => select_by_hash(available, client_ip_for_hash(ctx).map(|ip| ip.to_string())),
            Policy::GenericHash { template } => {
                let key = expand_template(template, ctx);
                select_by_hash(available, Some(key))
            }
            Policy::WeightedRandom => select_weighted_random(available),
            Policy::ConsistentHash { template, virtual_nodes } => {
                let key = expand_template(template, ctx);
                self.select_consistent_hash(available, &key, *virtual_nodes)
            }
        }
    }

    fn select_wrr<'a>(&self, available: &'a [Destination]) -> Option<&'a Destination> {
        let key = cache_key(&self.cluster_id, available);
        let seq = self
            .wrr_cache
            .entry(key)
            .or_insert_with(|| Arc::new(build_wrr_sequence(available)))
            .clone();
        if seq.sequence.is_empty() {
            return None;
        }
        let count = seq.counter.fetch_add(1, Ordering::Relaxed);
        let idx = seq.sequence[(count as usize) % seq.sequence.len()];
        available.get(idx)
    }

    fn select_consistent_hash<'a>(
        &self,
        available: &'a [Destination],
        key: &str,
        virtual_nodes: u32,
    ) -> Option<&'a Destination> {
        let cache_key = cache_key(&self.cluster_id, available);
        let ring = self
            .ring_cache
            .entry(cache_key)
            .or_insert_with(|| Arc::new(build_ring(available, virtual_nodes)))
            .clone();
        let hash = md5_u32_le(key);
        available.get(ring.lookup(hash))
    }
}

fn select_least_connections(available: &[Destination]) -> Option<&Destination> {
    available.iter().min_by(|a, b| {
        let score_a = a.active_requests.load(Ordering::Relaxed) as f64 / a.weight as f64;
        let score_b = b.active_requests.load(Ordering::Relaxed) as f64 / b.weight as f64;
        score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
    })
}

fn select_by_hash(available: &[Destination], key: Option<String>) -> Option<&Destination> {
    match key {
        Some(k) if !k.is_empty() => {
            let hash = md5_u32_le(&k);
            available.get(hash as usize % available.len())
        }
        _ => {
            let idx = rand::thread_rng().gen_range(0..available.len());
            available.get(idx)
        }
    }
}

fn select_weighted_random(available: &[Destination]) -> Option<&Destination> {
    let total: u64 = available.iter().map(|d| d.weight as u64).sum();
    if total == 0 {
        return available.first();
    }
    let r = rand::thread_rng().gen_range(1..=total);
    let mut cumulative = 0u64;
    for dest in available {
        cumulative += dest.weight as u64;
        if cumulative >= r {
            return Some(dest);
        }
    }
    available.last()
}
