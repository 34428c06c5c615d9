//! Admission gate: global/path-scoped CIDR and geo allow/deny rules, plus
//! connection-count caps (total / per-IP / per-destination / per-path).
//!
//! Mirrors the shape of the rate limiter's "one lock guards a handful of
//! map mutations" design (see `ratelimit`): a single mutex serializes the
//! connection counters so acquire/release can never race into a negative
//! or over-cap count, while the allow/deny rule checks themselves are pure
//! and lock-free (`ArcSwap` snapshot read).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::types::AdmissionSecurityConfig;
use crate::error::DenyReason;
use crate::geo::{GeoInfo, GeoResolver};
use crate::net::IpNetwork;

/// A denial carries the reason plus, when the gate got far enough to look
/// the client up, the matched geo record — so callers can fill in
/// `{Country}`/`{Region}`/`{City}` on the rejection page.
#[derive(Debug, Clone)]
pub struct AdmissionDenial {
    pub reason: DenyReason,
    pub geo: Option<GeoInfo>,
}

impl AdmissionDenial {
    fn new(reason: DenyReason) -> Self {
        Self { reason, geo: None }
    }

    fn with_geo(reason: DenyReason, geo: GeoInfo) -> Self {
        Self {
            reason,
            geo: Some(geo),
        }
    }
}

/// A path-scoped CIDR rule: if `pattern` matches the request path, its
/// blacklist is checked first, then its whitelist.
#[derive(Debug, Clone, Default)]
pub struct PathIpRule {
    pub pattern: String,
    pub whitelist: Vec<IpNetwork>,
    pub blacklist: Vec<IpNetwork>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoMode {
    Allow,
    Deny,
}

/// A path-scoped geo rule; same blacklist-before-whitelist precedence as
/// [`PathIpRule`].
#[derive(Debug, Clone, Default)]
pub struct PathGeoRule {
    pub pattern: String,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GeoConfig {
    pub enabled: bool,
    pub mode: Option<GeoMode>,
    /// `AllowCountries` when `mode == Allow`, `DenyCountries` when `mode == Deny`.
    pub list: Vec<String>,
    pub path_rules: Vec<PathGeoRule>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionLimits {
    pub max_total: Option<u32>,
    pub max_per_ip: Option<u32>,
    pub max_per_destination: Option<u32>,
    /// Pattern -> cap. The *first* matching pattern (in declaration order)
    /// is the one whose counter is charged.
    pub path_caps: Vec<(String, u32)>,
}

#[derive(Debug, Clone, Default)]
pub struct AdmissionConfig {
    pub global_whitelist: Vec<IpNetwork>,
    pub global_blacklist: Vec<IpNetwork>,
    pub ip_control_enabled: bool,
    pub path_ip_rules: Vec<PathIpRule>,
    pub geo: GeoConfig,
    pub connections: ConnectionLimits,
    pub reject_status: u16,
    pub reject_message: String,
}

fn parse_cidrs(label: &str, entries: &[String]) -> Vec<IpNetwork> {
    entries
        .iter()
        .filter_map(|s| match IpNetwork::parse(s) {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("admission: dropping invalid {label} CIDR {s}: {e}");
                None
            }
        })
        .collect()
}

impl From<&AdmissionSecurityConfig> for AdmissionConfig {
    fn from(cfg: &AdmissionSecurityConfig) -> Self {
        let geo_mode = match cfg.geo.mode.as_deref() {
            Some("allow") => Some(GeoMode::Allow),
            Some("deny") => Some(GeoMode::Deny),
            Some(other) => {
                warn!("admission: unknown geo mode {other}, geo country list disabled");
                None
            }
            None => None,
        };

        AdmissionConfig {
            global_whitelist: parse_cidrs("global_whitelist", &cfg.global_whitelist),
            global_blacklist: parse_cidrs("global_blacklist", &cfg.global_blacklist),
            ip_control_enabled: cfg.ip_control_enabled,
            path_ip_rules: cfg
                .path_ip_rules
                .iter()
                .map(|r| PathIpRule {
                    pattern: r.pattern.clone(),
                    whitelist: parse_cidrs("path_ip_rules.whitelist", &r.whitelist),
                    blacklist: parse_cidrs("path_ip_rules.blacklist", &r.blacklist),
                })
                .collect(),
            geo: GeoConfig {
                enabled: cfg.geo.enabled,
                mode: geo_mode,
                list: cfg.geo.list.clone(),
                path_rules: cfg
                    .geo
                    .path_rules
                    .iter()
                    .map(|r| PathGeoRule {
                        pattern: r.pattern.clone(),
                        allow: r.allow.clone(),
                        deny: r.deny.clone(),
                    })
                    .collect(),
            },
            connections: ConnectionLimits {
                max_total: cfg.connections.max_total,
                max_per_ip: cfg.connections.max_per_ip,
                max_per_destination: cfg.connections.max_per_destination,
                path_caps: cfg.connections.path_caps.clone(),
            },
            reject_status: cfg.reject_status,
            reject_message: cfg.reject_message.clone(),
        }
    }
}

/// `/*` matches any path with the given prefix; trailing `*` matches any
/// path with the literal prefix (no required `/`); otherwise an exact,
/// case-insensitive match.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path.len() >= prefix.len() && path[..prefix.len()].eq_ignore_ascii_case(prefix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.len() >= prefix.len() && path[..prefix.len()].eq_ignore_ascii_case(prefix);
    }
    pattern.eq_ignore_ascii_case(path)
}

#[derive(Default)]
struct ConnCounters {
    total: u32,
    per_ip: HashMap<IpAddr, u32>,
    per_destination: HashMap<String, u32>,
    per_path: HashMap<String, u32>,
}

pub struct AdmissionGate {
    config: ArcSwap<AdmissionConfig>,
    geo: Option<Arc<dyn GeoResolver>>,
    counters: Mutex<ConnCounters>,
}

impl AdmissionGate {
    pub fn new(config: AdmissionConfig, geo: Option<Arc<dyn GeoResolver>>) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            geo,
            counters: Mutex::new(ConnCounters::default()),
        }
    }

    pub fn replace_config(&self, config: AdmissionConfig) {
        self.config.store(Arc::new(config));
    }

    /// Configured rejection status code and message template for the
    /// current config snapshot (§4.L step 2).
    pub fn rejection(&self) -> (u16, String) {
        let config = self.config.load();
        (config.reject_status, config.reject_message.clone())
    }

    /// Evaluates CIDR and geo rules. `path` is `None` when the caller has no
    /// path context yet (e.g. a pre-routing check).
    pub fn check(&self, client_ip: IpAddr, path: Option<&str>) -> Result<(), AdmissionDenial> {
        let config = self.config.load();

        if config.global_whitelist.iter().any(|n| n.contains(client_ip)) {
            return Ok(());
        }

        if config.ip_control_enabled {
            if let Some(path) = path {
                for rule in &config.path_ip_rules {
                    if !path_matches(&rule.pattern, path) {
                        continue;
                    }
                    if rule.blacklist.iter().any(|n| n.contains(client_ip)) {
                        return Err(AdmissionDenial::new(DenyReason::PathIpDenied));
                    }
                    if rule.whitelist.iter().any(|n| n.contains(client_ip)) {
                        return Ok(());
                    }
                }
            }
            if config.global_blacklist.iter().any(|n| n.contains(client_ip)) {
                return Err(AdmissionDenial::new(DenyReason::IpDenied));
            }
        }

        if config.geo.enabled {
            if let Some(geo) = &self.geo {
                match geo.lookup(client_ip) {
                    Some(info) => {
                        if let Some(path) = path {
                            for rule in &config.geo.path_rules {
                                if !path_matches(&rule.pattern, path) {
                                    continue;
                                }
                                if rule.deny.iter().any(|name| info.matches_any(name)) {
                                    return Err(AdmissionDenial::with_geo(
                                        DenyReason::PathGeoDenied,
                                        info,
                                    ));
                                }
                                if rule.allow.iter().any(|name| info.matches_any(name)) {
                                    return Ok(());
                                }
                            }
                        }
                        match config.geo.mode {
                            Some(GeoMode::Allow) => {
                                if !config.geo.list.iter().any(|name| info.matches_any(name)) {
                                    return Err(AdmissionDenial::with_geo(
                                        DenyReason::GeoDenied,
                                        info,
                                    ));
                                }
                            }
                            Some(GeoMode::Deny) => {
                                if config.geo.list.iter().any(|name| info.matches_any(name)) {
                                    return Err(AdmissionDenial::with_geo(
                                        DenyReason::GeoDenied,
                                        info,
                                    ));
                                }
                            }
                            None => {}
                        }
                    }
                    // Fail-open: no geo data, allow.
                    None => {}
                }
            }
        }

        Ok(())
    }

    /// Attempts to atomically reserve a connection slot. On success, every
    /// relevant counter (total, per-IP, per-destination, the *first*
    /// matching per-path cap) has been incremented; on failure, nothing
    /// changed.
    pub async fn try_acquire_connection(
        &self,
        client_ip: IpAddr,
        destination: Option<&str>,
        path: Option<&str>,
    ) -> bool {
        let config = self.config.load();
        let limits = &config.connections;

        let matched_path_cap = path.and_then(|p| {
            limits
                .path_caps
                .iter()
                .find(|(pattern, _)| path_matches(pattern, p))
        });

        let mut counters = self.counters.lock().await;

        if let Some(max) = limits.max_total {
            if counters.total >= max {
                return false;
            }
        }
        if let Some(max) = limits.max_per_ip {
            if counters.per_ip.get(&client_ip).copied().unwrap_or(0) >= max {
                return false;
            }
        }
        if let (Some(max), Some(dest)) = (limits.max_per_destination, destination) {
            if counters.per_destination.get(dest).copied().unwrap_or(0) >= max {
                return false;
            }
        }
        if let Some((pattern, cap)) = matched_path_cap {
            if counters.per_path.get(pattern).copied().unwrap_or(0) >= *cap {
                return false;
            }
        }

        counters.total += 1;
        *counters.per_ip.entry(client_ip).or_insert(0) += 1;
        if let Some(dest) = destination {
            *counters.per_destination.entry(dest.to_string()).or_insert(0) += 1;
        }
        if let Some((pattern, _)) = matched_path_cap {
            *counters.per_path.entry(pattern.clone()).or_insert(0) += 1;
        }
        true
    }

    pub async fn release_connection(
        &self,
        client_ip: IpAddr,
        destination: Option<&str>,
        path: Option<&str>,
    ) {
        let config = self.config.load();
        let matched_path_cap = path.and_then(|p| {
            config
                .connections
                .path_caps
                .iter()
                .find(|(pattern, _)| path_matches(pattern, p))
        });

        let mut counters = self.counters.lock().await;
        counters.total = counters.total.saturating_sub(1);
        if let Some(v) = counters.per_ip.get_mut(&client_ip) {
            *v = v.saturating_sub(1);
        }
        if let Some(dest) = destination {
            if let Some(v) = counters.per_destination.get_mut(dest) {
                *v = v.saturating_sub(1);
            }
        }
        if let Some((pattern, _)) = matched_path_cap {
            if let Some(v) = counters.per_path.get_mut(pattern) {
                *v = v.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{GeoInfo, StaticGeoResolver};

    fn net(s: &str) -> IpNetwork {
        IpNetwork::parse(s).unwrap()
    }

    #[test]
    fn path_matches_suffix_forms() {
        assert!(path_matches("/api/*", "/api/v1/users"));
        assert!(!path_matches("/api/*", "/other"));
        assert!(path_matches("/api*", "/apiv2"));
        assert!(path_matches("/login", "/LOGIN"));
        assert!(!path_matches("/login", "/login/extra"));
    }

    #[test]
    fn global_whitelist_bypasses_everything() {
        let config = AdmissionConfig {
            global_blacklist: vec![net("10.0.0.0/8")],
            global_whitelist: vec![net("10.0.0.5/32")],
            ip_control_enabled: true,
            ..Default::default()
        };
        let gate = AdmissionGate::new(config, None);
        assert!(gate.check("10.0.0.5".parse().unwrap(), None).is_ok());
    }

    #[test]
    fn global_blacklist_denies() {
        let config = AdmissionConfig {
            global_blacklist: vec![net("10.0.0.0/8")],
            ip_control_enabled: true,
            ..Default::default()
        };
        let gate = AdmissionGate::new(config, None);
        assert_eq!(
            gate.check("10.1.2.3".parse().unwrap(), None).unwrap_err().reason,
            DenyReason::IpDenied
        );
    }

    #[test]
    fn path_rule_blacklist_wins_over_whitelist() {
        let config = AdmissionConfig {
            ip_control_enabled: true,
            path_ip_rules: vec![PathIpRule {
                pattern: "/admin/*".to_string(),
                whitelist: vec![net("10.0.0.5/32")],
                blacklist: vec![net("10.0.0.5/32")],
            }],
            ..Default::default()
        };
        let gate = AdmissionGate::new(config, None);
        assert_eq!(
            gate.check("10.0.0.5".parse().unwrap(), Some("/admin/panel"))
                .unwrap_err()
                .reason,
            DenyReason::PathIpDenied
        );
    }

    #[test]
    fn geo_allow_mode_denies_unlisted_country() {
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        let geo = Arc::new(
            StaticGeoResolver::new().with(
                ip,
                GeoInfo {
                    country: "Elsewhere".into(),
                    ..Default::default()
                },
            ),
        );
        let config = AdmissionConfig {
            geo: GeoConfig {
                enabled: true,
                mode: Some(GeoMode::Allow),
                list: vec!["Homeland".to_string()],
                path_rules: vec![],
            },
            ..Default::default()
        };
        let gate = AdmissionGate::new(config, Some(geo));
        let denial = gate.check(ip, None).unwrap_err();
        assert_eq!(denial.reason, DenyReason::GeoDenied);
        assert_eq!(denial.geo.unwrap().country, "Elsewhere");
    }

    #[test]
    fn geo_lookup_failure_fails_open() {
        let config = AdmissionConfig {
            geo: GeoConfig {
                enabled: true,
                mode: Some(GeoMode::Allow),
                list: vec!["Homeland".to_string()],
                path_rules: vec![],
            },
            ..Default::default()
        };
        let geo: Arc<dyn GeoResolver> = Arc::new(StaticGeoResolver::new());
        let gate = AdmissionGate::new(config, Some(geo));
        assert!(gate.check("1.2.3.4".parse().unwrap(), None).is_ok());
    }

    #[tokio::test]
    async fn connection_caps_enforced_and_released() {
        let config = AdmissionConfig {
            connections: ConnectionLimits {
                max_total: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let gate = AdmissionGate::new(config, None);
        let ip: IpAddr = "1.1.1.1".parse().unwrap();

        assert!(gate.try_acquire_connection(ip, None, None).await);
        assert!(!gate.try_acquire_connection(ip, None, None).await);

        gate.release_connection(ip, None, None).await;
        assert!(gate.try_acquire_connection(ip, None, None).await);
    }

    #[test]
    fn config_conversion_skips_invalid_cidrs_and_maps_geo_mode() {
        use crate::config::types::{AdmissionSecurityConfig, GeoSecurityConfig};

        let cfg = AdmissionSecurityConfig {
            global_whitelist: vec!["10.0.0.0/8".to_string(), "not-a-cidr".to_string()],
            ip_control_enabled: true,
            geo: GeoSecurityConfig {
                enabled: true,
                mode: Some("deny".to_string()),
                list: vec!["Elsewhere".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let admission_config = AdmissionConfig::from(&cfg);
        assert_eq!(admission_config.global_whitelist.len(), 1);
        assert_eq!(admission_config.geo.mode, Some(GeoMode::Deny));
    }

    #[tokio::test]
    async fn per_path_cap_only_charges_first_match() {
        let config = AdmissionConfig {
            connections: ConnectionLimits {
                path_caps: vec![("/api/*".to_string(), 1)],
                ..Default::default()
            },
            ..Default::default()
        };
        let gate = AdmissionGate::new(config, None);
        let ip: IpAddr = "1.1.1.1".parse().unwrap();

        assert!(gate.try_acquire_connection(ip, None, Some("/api/a")).await);
        assert!(!gate.try_acquire_connection(ip, None, Some("/api/b")).await);
        assert!(gate.try_acquire_connection(ip, None, Some("/other")).await);
    }
}
