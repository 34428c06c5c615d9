use crate::health::{ActiveHealthPolicy, HealthSink, HealthStatus};
use crate::upstream::cluster::{Cluster, ClusterStore};
use std::time::Duration;
use tracing::{debug, warn};

/// Run a single round of active health checks across all clusters.
///
/// The caller is responsible for looping / scheduling.
pub async fn run_health_checks(cluster_store: &ClusterStore, client: &reqwest::Client) {
    let mut tasks: Vec<(Cluster, ActiveHealthPolicy, Vec<(String, String)>)> = Vec::new();

    cluster_store.for_each(|_name, cluster| {
        let cfg = cluster.config();
        let hc = match &cfg.health_check {
            Some(hc) => hc,
            None => return,
        };

        let active = match &hc.active {
            Some(a) => a,
            None => return,
        };

        let nodes = cluster.effective_nodes();
        if nodes.is_empty() {
            return;
        }

        let policy = ActiveHealthPolicy::from(active);
        let destinations: Vec<(String, String)> = nodes
            .iter()
            .map(|n| {
                let key = format!("{}:{}", n.host, n.port);
                let probe_port = active.port.unwrap_or(n.port);
                let address = format!("{}://{}:{}", cfg.scheme, n.host, probe_port);
                (key, address)
            })
            .collect();

        tasks.push((cluster.clone(), policy, destinations));
    });

    for (cluster, policy, destinations) in tasks {
        let sink = ClusterHealthSink { cluster: &cluster };
        cluster
            .health_prober()
            .run_round(client, cluster.name(), &policy, &destinations, &sink)
            .await;
    }
}

/// Build a shared HTTP client for health checks.
pub fn build_health_check_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .expect("failed to build health check client")
}

/// Publishes a probe round's verdicts onto the cluster's passive node-health
/// map. `Unknown` (threshold not yet met) leaves the existing status alone.
struct ClusterHealthSink<'a> {
    cluster: &'a Cluster,
}

impl HealthSink for ClusterHealthSink<'_> {
    fn publish(&self, cluster_name: &str, updates: Vec<(String, HealthStatus)>) {
        for (node_key, status) in updates {
            match status {
                HealthStatus::Healthy => {
                    if !self.cluster.is_node_healthy(&node_key) {
                        self.cluster.mark_node_healthy(&node_key);
                        metrics::gauge!(
                            "lywaf_upstream_health_status",
                            "cluster" => cluster_name.to_owned(),
                            "upstream" => node_key.clone(),
                        )
                        .set(1.0);
                        debug!(
                            "health: active: node marked healthy, cluster={}, node={}",
                            cluster_name, node_key
                        );
                    }
                    metrics::counter!(
                        "lywaf_health_check_total",
                        "cluster" => cluster_name.to_owned(),
                        "upstream" => node_key.clone(),
                        "result" => "success",
                    )
                    .increment(1);
                }
                HealthStatus::Unhealthy => {
                    if self.cluster.is_node_healthy(&node_key) {
                        self.cluster.mark_node_unhealthy(&node_key);
                        metrics::gauge!(
                            "lywaf_upstream_health_status",
                            "cluster" => cluster_name.to_owned(),
                            "upstream" => node_key.clone(),
                        )
                        .set(0.0);
                        warn!(
                            "health: active: node marked unhealthy, cluster={}, node={}",
                            cluster_name, node_key
                        );
                    }
                    metrics::counter!(
                        "lywaf_health_check_total",
                        "cluster" => cluster_name.to_owned(),
                        "upstream" => node_key.clone(),
                        "result" => "failure",
                    )
                    .increment(1);
                }
                HealthStatus::Unknown => {}
            }
        }
    }
}
