use crate::admission::{AdmissionConfig, AdmissionGate};
use crate::attribution::PathAttributor;
use crate::config::{ClusterConfig, DomainConfig, GatewayConfig, SecurityConfig};
use crate::dns::{CustomDns, CustomDnsMappings};
use crate::etcd::EtcdClient;
use crate::forwarded::ForwardedConfig;
use crate::geo::{GeoResolver, XdbGeoResolver};
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiterRegistry;
use crate::routing::RouteTable;
use crate::server::instance_registry::InstanceRegistry;
use crate::store::ExpiringStore;
use crate::throttle::{Throttle, ThrottleConfig};
use crate::upstream::ClusterStore;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

/// WAF/admission domain: ban list, admission gate, rate limiting, egress
/// throttle, custom DNS, and path attribution — the request-pipeline gates
/// that sit in front of routing and upstream selection.
#[derive(Clone)]
pub struct SecurityState {
    /// `ClientFb` ban table (§4.L step 1) — banned IP to ban reason.
    pub bans: Arc<ExpiringStore<IpAddr, String>>,
    ban_default_ttl: Duration,
    pub ban_page_template: Arc<ArcSwap<String>>,
    pub admission: Arc<AdmissionGate>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub throttle: Arc<Throttle>,
    pub dns: Arc<CustomDns>,
    pub attribution: Arc<ArcSwap<PathAttributor>>,
    pub forwarded: Arc<ArcSwap<ForwardedConfig>>,
}

impl SecurityState {
    fn new_default() -> Self {
        Self::from_config(&SecurityConfig::default(), None)
    }

    /// Builds the WAF sub-state from the loaded `SecurityConfig`. A geo
    /// database that fails to load is logged at Warn and geo checks fail
    /// open, matching the admission gate's own fail-open behavior on lookup
    /// misses.
    pub fn from_config(cfg: &SecurityConfig, geo: Option<Arc<dyn GeoResolver>>) -> Self {
        let geo = geo.or_else(|| {
            cfg.geo_database_path.as_ref().and_then(|path| {
                match XdbGeoResolver::open(path) {
                    Ok(resolver) => Some(Arc::new(resolver) as Arc<dyn GeoResolver>),
                    Err(e) => {
                        warn!("geo: failed to load database at {path}: {e}, geo checks fail open");
                        None
                    }
                }
            })
        });

        Self {
            bans: Arc::new(ExpiringStore::new()),
            ban_default_ttl: Duration::from_secs(cfg.ban.default_ttl_secs),
            ban_page_template: Arc::new(ArcSwap::from_pointee(cfg.ban.page_template.clone())),
            admission: Arc::new(AdmissionGate::new(AdmissionConfig::from(&cfg.admission), geo)),
            rate_limiters: Arc::new(RateLimiterRegistry::from_config(
                &cfg.rate_limit_policies,
                cfg.rate_limit_default_policy.clone(),
            )),
            throttle: Arc::new(Throttle::new(ThrottleConfig::from(&cfg.throttle))),
            dns: Arc::new(CustomDns::new(
                CustomDnsMappings::from(&cfg.dns),
                Duration::from_secs(cfg.dns.default_ttl_secs),
            )),
            attribution: Arc::new(ArcSwap::from_pointee(PathAttributor::new(
                cfg.attribution_patterns.clone(),
            ))),
            forwarded: Arc::new(ArcSwap::from_pointee(ForwardedConfig::from(&cfg.forwarded))),
        }
    }

    /// Bans `client_ip` for the configured default TTL, recording `reason`
    /// for the ban page's debug-build diagnostic.
    pub async fn ban_client(&self, client_ip: IpAddr, reason: impl Into<String>) {
        self.bans
            .add_or_update(client_ip, reason.into(), Some(self.ban_default_ttl))
            .await;
    }
}

// ---------------------------------------------------------------------------
// Sub-states — each represents a cohesive domain boundary.
// Consumers should depend on the narrowest sub-state they need.
// ---------------------------------------------------------------------------

/// Routing domain: route table built from the currently loaded domains.
#[derive(Clone)]
pub struct RoutingState {
    pub route_table: Arc<ArcSwap<RouteTable>>,
    /// Snapshot of domains currently loaded (from etcd).
    domains: Arc<ArcSwap<Vec<DomainConfig>>>,
}

impl RoutingState {
    fn rebuild_table(&self, domains: &[DomainConfig]) {
        let new_table = RouteTable::new(domains);
        self.route_table.store(Arc::new(new_table));
        self.domains.store(Arc::new(domains.to_vec()));
    }

    pub fn domain_count(&self) -> usize {
        self.domains.load().len()
    }

    pub fn route_count(&self) -> usize {
        self.domains.load().iter().map(|d| d.routes.len()).sum()
    }

    pub fn domains(&self) -> arc_swap::Guard<Arc<Vec<DomainConfig>>> {
        self.domains.load()
    }
}

/// Infrastructure: etcd client, instance registry, discovery wake.
#[derive(Clone)]
pub struct InfraState {
    etcd_client: Option<EtcdClient>,
    instance_registry: Option<Arc<InstanceRegistry>>,
    discovery_wake: Arc<Notify>,
}

impl InfraState {
    pub fn etcd_client(&self) -> Option<&EtcdClient> {
        self.etcd_client.as_ref()
    }

    pub fn instance_registry(&self) -> Option<&Arc<InstanceRegistry>> {
        self.instance_registry.as_ref()
    }

    pub fn discovery_wake(&self) -> Arc<Notify> {
        self.discovery_wake.clone()
    }

    pub fn trigger_discovery(&self) {
        self.discovery_wake.notify_one();
    }

    pub async fn shutdown(&self) {
        if let Some(ref registry) = self.instance_registry {
            registry.shutdown().await;
        }
    }
}

// ---------------------------------------------------------------------------
// GatewayState — root aggregate composed of sub-states.
// ---------------------------------------------------------------------------

/// Shared gateway state, cheaply cloneable.
///
/// Composed of domain-specific sub-states. Pass the narrowest sub-state
/// to each subsystem to avoid leaking unrelated dependencies.
///
/// All config mutations are serialized through `config_mu` to prevent
/// read-modify-write races. Reads via `ArcSwap::load` remain lock-free.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub routing: RoutingState,
    pub upstream: ClusterStore,
    pub infra: InfraState,
    pub security: SecurityState,
    /// Serializes all config mutations (upsert/delete/reload) to prevent
    /// concurrent read-modify-write from losing updates.
    config_mu: Arc<Mutex<()>>,
}

impl GatewayState {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let etcd_client = if !config.etcd.endpoints.is_empty() {
            let client = EtcdClient::connect(&config.etcd).await?;
            info!("etcd: connected to {}", client.base_url());
            Some(client)
        } else {
            None
        };

        let instance_count = if config.instance_registry.enabled {
            Some(Arc::new(AtomicU32::new(1)))
        } else {
            None
        };

        let instance_registry = if config.instance_registry.enabled {
            let etcd = etcd_client
                .clone()
                .ok_or_else(|| anyhow::anyhow!("instance_registry requires etcd endpoints"))?;
            let ic = instance_count
                .clone()
                .expect("instance_count must be Some when instance_registry is enabled");
            let registry = InstanceRegistry::new(etcd, &config.instance_registry, ic);
            info!("instance_registry: prepared, id={}", registry.instance_id(),);
            Some(Arc::new(registry))
        } else {
            info!("instance_registry: disabled (standalone rate limiting)");
            None
        };

        let cluster_store = ClusterStore::new();
        // No local domains/clusters — all business config comes from etcd.

        let empty_domains: Vec<DomainConfig> = Vec::new();
        let route_table = RouteTable::new(&empty_domains);
        let metrics = Metrics::install();
        metrics::gauge!("lywaf_config_routes_total").set(0.0);
        let security = SecurityState::from_config(&config.security, None);

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            routing: RoutingState {
                route_table: Arc::new(ArcSwap::new(Arc::new(route_table))),
                domains: Arc::new(ArcSwap::new(Arc::new(Vec::new()))),
            },
            upstream: cluster_store,
            infra: InfraState {
                etcd_client,
                instance_registry,
                discovery_wake: Arc::new(Notify::new()),
            },
            security,
            config_mu: Arc::new(Mutex::new(())),
        })
    }

    /// Incrementally upsert a single domain (from etcd).
    pub async fn upsert_domain(&self, domain: DomainConfig) {
        let _guard = self.config_mu.lock().await;
        let mut domains = (**self.routing.domains.load()).clone();

        match domains.iter_mut().find(|d| d.name == domain.name) {
            Some(existing) => *existing = domain.clone(),
            None => domains.push(domain.clone()),
        }

        self.routing.rebuild_table(&domains);
        self.update_route_metric();
        self.infra.trigger_discovery();
        info!("config: domain upserted, name={}", domain.name);
    }

    /// Incrementally delete a single domain (from etcd).
    pub async fn delete_domain(&self, domain_name: &str) {
        let _guard = self.config_mu.lock().await;
        let mut domains = (**self.routing.domains.load()).clone();
        let before = domains.len();
        domains.retain(|d| d.name != domain_name);

        if domains.len() == before {
            info!(
                "config: domain delete ignored (not found), name={}",
                domain_name
            );
            return;
        }

        self.routing.rebuild_table(&domains);
        self.update_route_metric();
        self.infra.trigger_discovery();
        info!("config: domain deleted, name={}", domain_name);
    }

    /// Incrementally upsert a single cluster (from etcd).
    pub async fn upsert_cluster(&self, cluster: ClusterConfig) {
        let _guard = self.config_mu.lock().await;
        self.upstream.upsert(cluster.clone());
        self.infra.trigger_discovery();
        info!("config: cluster upserted, name={}", cluster.name);
    }

    /// Incrementally delete a single cluster (from etcd).
    pub async fn delete_cluster(&self, cluster_name: &str) {
        let _guard = self.config_mu.lock().await;
        if !self.upstream.remove(cluster_name) {
            info!(
                "config: cluster delete ignored (not found), name={}",
                cluster_name
            );
            return;
        }
        self.infra.trigger_discovery();
        info!("config: cluster deleted, name={}", cluster_name);
    }

    // -- private helpers --

    fn update_route_metric(&self) {
        metrics::gauge!("lywaf_config_routes_total").set(self.routing.route_count() as f64);
    }
}
