//! Active health-check prober: request construction, success predicate
//! evaluation, and the pass/fail state machine per destination.
//!
//! Grounded on `upstream/health.rs`'s `run_health_checks`/`check_one_node`
//! shape (buffered concurrent probing via `futures_util::stream`, one round
//! per call, caller owns the scheduling loop) but replaces its single
//! "status code in a set" predicate with the full method/path/body/
//! status-set/content/header predicate, and its independent healthy/
//! unhealthy counters with the combined pass/fail state machine.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tracing::warn;

use crate::config::ActiveHealthCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Get,
    Post,
}

impl Default for ProbeMethod {
    fn default() -> Self {
        ProbeMethod::Get
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCheck {
    Contains,
    Match,
    Json,
    JsonM,
}

impl Default for ContentCheck {
    fn default() -> Self {
        ContentCheck::Contains
    }
}

/// A parsed `AvalidCode` set: comma-separated `200`, `2xx`, `20x` items.
#[derive(Debug, Clone, Default)]
pub struct ValidCodeSet {
    ranges: Vec<(u16, u16)>,
}

#[derive(Debug, Clone)]
pub struct CodeSetParseError(pub String);

impl ValidCodeSet {
    pub fn parse(spec: &str) -> Result<Self, CodeSetParseError> {
        let mut ranges = Vec::new();
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            ranges.push(parse_code_token(token)?);
        }
        Ok(Self { ranges })
    }

    pub fn contains(&self, status: u16) -> bool {
        self.ranges.iter().any(|(lo, hi)| status >= *lo && status <= *hi)
    }
}

fn parse_code_token(token: &str) -> Result<(u16, u16), CodeSetParseError> {
    let wildcard_count = token.chars().rev().take_while(|c| c.eq_ignore_ascii_case(&'x')).count();
    let prefix = &token[..token.len() - wildcard_count];
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_digit()) {
        return Err(CodeSetParseError(token.to_string()));
    }
    let low_str = format!("{}{}", prefix, "0".repeat(wildcard_count));
    let high_str = format!("{}{}", prefix, "9".repeat(wildcard_count));
    let low: u16 = low_str.parse().map_err(|_| CodeSetParseError(token.to_string()))?;
    let high: u16 = high_str.parse().map_err(|_| CodeSetParseError(token.to_string()))?;
    Ok((low, high))
}

#[derive(Debug, Clone, Default)]
pub struct ActiveHealthPolicy {
    pub method: ProbeMethod,
    pub path: String,
    pub query: Option<String>,
    pub body: Option<String>,
    pub valid_code: Option<ValidCodeSet>,
    pub valid_content: Option<(ContentCheck, String)>,
    /// Parsed from `;`-separated `Name=Value` pairs.
    pub valid_headers: Vec<(String, String)>,
    pub passes: u32,
    pub fails: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl ActiveHealthPolicy {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            method: ProbeMethod::Get,
            path: path.into(),
            query: None,
            body: None,
            valid_code: None,
            valid_content: None,
            valid_headers: Vec::new(),
            passes: 2,
            fails: 2,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            concurrency: 8,
        }
    }

    pub fn parse_headers(spec: &str) -> Vec<(String, String)> {
        spec.split(';')
            .filter_map(|pair| {
                let pair = pair.trim();
                if pair.is_empty() {
                    return None;
                }
                let mut parts = pair.splitn(2, '=');
                let name = parts.next()?.trim().to_string();
                let value = parts.next().unwrap_or("").trim().to_string();
                Some((name, value))
            })
            .collect()
    }

    /// Joins `address` and `self.path`, collapsing a duplicate `/`, then
    /// appends `?query` if set.
    pub fn build_url(&self, address: &str) -> String {
        let addr = address.trim_end_matches('/');
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let mut url = format!("{}{}", addr, path);
        if let Some(query) = &self.query {
            if !query.is_empty() {
                url.push('?');
                url.push_str(query);
            }
        }
        url
    }

    /// `(body_bytes, content_type)` — content type is inferred from whether
    /// the configured body parses as JSON.
    pub fn build_body(&self) -> Option<(Vec<u8>, &'static str)> {
        let body = self.body.as_ref()?;
        let content_type = if serde_json::from_str::<Value>(body).is_ok() {
            "application/json"
        } else {
            "application/x-www-form-urlencoded"
        };
        Some((body.clone().into_bytes(), content_type))
    }

    /// Evaluates the success predicate. `headers` maps lower-cased header
    /// names to their value.
    pub fn evaluate(&self, status: u16, headers: &HashMap<String, String>, body: &str) -> bool {
        if self.valid_code.is_none() && self.valid_content.is_none() && self.valid_headers.is_empty() {
            return (200..300).contains(&status);
        }

        if let Some(codes) = &self.valid_code {
            if !codes.contains(status) {
                return false;
            }
        }

        if let Some((check, literal)) = &self.valid_content {
            if !evaluate_content(*check, literal, body) {
                return false;
            }
        }

        for (name, value) in &self.valid_headers {
            let key = name.to_ascii_lowercase();
            match headers.get(&key) {
                Some(actual) if actual.contains(value.as_str()) => {}
                _ => return false,
            }
        }

        true
    }
}

impl From<&ActiveHealthCheck> for ActiveHealthPolicy {
    /// `valid_code` takes precedence over the legacy `healthy_statuses` list;
    /// an unparseable `valid_code`/`valid_headers` spec is logged and ignored
    /// (falls back to the 2xx default / no header checks), same fail-soft
    /// shape as the other domain config conversions.
    fn from(cfg: &ActiveHealthCheck) -> Self {
        let method = match cfg.method.to_ascii_lowercase().as_str() {
            "post" => ProbeMethod::Post,
            _ => ProbeMethod::Get,
        };

        let valid_code = if let Some(spec) = &cfg.valid_code {
            match ValidCodeSet::parse(spec) {
                Ok(set) => Some(set),
                Err(e) => {
                    warn!("health: invalid valid_code spec '{}': {:?}, ignoring", spec, e);
                    None
                }
            }
        } else if !cfg.healthy_statuses.is_empty() {
            Some(ValidCodeSet {
                ranges: cfg.healthy_statuses.iter().map(|&c| (c, c)).collect(),
            })
        } else {
            None
        };

        let valid_content = cfg.valid_content.as_ref().map(|literal| {
            let check = match cfg.content_check.as_deref().unwrap_or("contains") {
                "match" => ContentCheck::Match,
                "json" => ContentCheck::Json,
                "jsonm" => ContentCheck::JsonM,
                _ => ContentCheck::Contains,
            };
            (check, literal.clone())
        });

        let valid_headers = cfg
            .valid_headers
            .as_deref()
            .map(ActiveHealthPolicy::parse_headers)
            .unwrap_or_default();

        Self {
            method,
            path: cfg.path.clone(),
            query: cfg.query.clone(),
            body: cfg.body.clone(),
            valid_code,
            valid_content,
            valid_headers,
            passes: cfg.healthy_threshold,
            fails: cfg.unhealthy_threshold,
            interval: Duration::from_secs(cfg.interval),
            timeout: Duration::from_secs(cfg.timeout),
            concurrency: cfg.concurrency,
        }
    }
}

fn evaluate_content(check: ContentCheck, literal: &str, body: &str) -> bool {
    match check {
        ContentCheck::Contains => body.contains(literal),
        ContentCheck::Match => body.trim() == literal.trim(),
        ContentCheck::Json => {
            let (Ok(target), Ok(source)) = (
                serde_json::from_str::<Value>(literal),
                serde_json::from_str::<Value>(body),
            ) else {
                return false;
            };
            json_props_equal(&target, &source)
        }
        ContentCheck::JsonM => {
            let (Ok(target), Ok(source)) = (
                serde_json::from_str::<Value>(literal),
                serde_json::from_str::<Value>(body),
            ) else {
                return false;
            };
            json_subset(&target, &source)
        }
    }
}

fn json_props_equal(target: &Value, source: &Value) -> bool {
    match (target, source) {
        (Value::Object(t), Value::Object(s)) => {
            t.iter().all(|(k, v)| s.get(k).map(|sv| sv == v).unwrap_or(false))
        }
        _ => target == source,
    }
}

fn json_subset(target: &Value, source: &Value) -> bool {
    match (target, source) {
        (Value::Object(t), Value::Object(s)) => t
            .iter()
            .all(|(k, v)| s.get(k).map(|sv| json_subset(v, sv)).unwrap_or(false)),
        (Value::Array(t), Value::Array(s)) => {
            t.iter().all(|tv| s.iter().any(|sv| json_subset(tv, sv)))
        }
        _ => target == source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Default)]
struct Counters {
    pass: u32,
    fail: u32,
}

impl Counters {
    fn record(&mut self, success: bool, pass_times: u32, fail_times: u32) -> HealthStatus {
        if success {
            self.pass += 1;
            if self.pass >= pass_times {
                self.fail = 0;
            }
        } else {
            self.fail += 1;
            if self.fail >= fail_times {
                self.pass = 0;
            }
        }
        if self.pass >= pass_times {
            HealthStatus::Healthy
        } else if self.fail >= fail_times {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Unknown
        }
    }
}

/// Receives one atomic batch of per-destination health updates per probe
/// round. Implementations typically swap an `ArcSwap` snapshot of cluster
/// health in response.
pub trait HealthSink: Send + Sync {
    fn publish(&self, cluster: &str, updates: Vec<(String, HealthStatus)>);
}

pub struct HealthProber {
    counters: DashMap<String, StdMutex<Counters>>,
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProber {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Runs one probing round against every `(destination_key, address)` in
    /// `destinations`, then publishes one batch to `sink`.
    pub async fn run_round(
        &self,
        client: &reqwest::Client,
        cluster_name: &str,
        policy: &ActiveHealthPolicy,
        destinations: &[(String, String)],
        sink: &dyn HealthSink,
    ) {
        let results: Vec<(String, bool)> = stream::iter(destinations.iter().cloned())
            .map(|(key, address)| {
                let client = client.clone();
                let policy = policy.clone();
                async move {
                    let success = probe_one(&client, &policy, &address).await;
                    (key, success)
                }
            })
            .buffer_unordered(policy.concurrency.max(1))
            .collect()
            .await;

        let mut updates = Vec::with_capacity(results.len());
        for (key, success) in results {
            let entry = self
                .counters
                .entry(key.clone())
                .or_insert_with(|| StdMutex::new(Counters::default()));
            let status = entry.lock().unwrap().record(success, policy.passes.max(1), policy.fails.max(1));
            updates.push((key, status));
        }

        sink.publish(cluster_name, updates);
    }

    /// Drops counters for destinations no longer in `active_keys`, preventing
    /// unbounded growth across service-discovery churn or config reload.
    pub fn retain_nodes(&self, active_keys: &std::collections::HashSet<String>) {
        self.counters.retain(|k, _| active_keys.contains(k));
    }
}

async fn probe_one(client: &reqwest::Client, policy: &ActiveHealthPolicy, address: &str) -> bool {
    let url = policy.build_url(address);
    let mut builder = match policy.method {
        ProbeMethod::Get => client.get(&url),
        ProbeMethod::Post => client.post(&url),
    };
    builder = builder.timeout(policy.timeout);
    if let Some((body, content_type)) = policy.build_body() {
        builder = builder.header("content-type", content_type).body(body);
    }

    let response = match builder.send().await {
        Ok(r) => r,
        Err(_) => return false,
    };
    let status = response.status().as_u16();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let body = response.text().await.unwrap_or_default();
    policy.evaluate(status, &headers, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_set_parses_wildcards() {
        let set = ValidCodeSet::parse("200,2xx,20x").unwrap();
        assert!(set.contains(200));
        assert!(set.contains(250));
        assert!(set.contains(209));
        assert!(!set.contains(300));
        assert!(!set.contains(210));
    }

    #[test]
    fn build_url_collapses_duplicate_slash() {
        let policy = ActiveHealthPolicy::new("/healthz");
        assert_eq!(policy.build_url("http://10.0.0.1:8080/"), "http://10.0.0.1:8080/healthz");
        assert_eq!(policy.build_url("http://10.0.0.1:8080"), "http://10.0.0.1:8080/healthz");
    }

    #[test]
    fn build_url_appends_query() {
        let mut policy = ActiveHealthPolicy::new("/check");
        policy.query = Some("probe=1".to_string());
        assert_eq!(policy.build_url("http://h"), "http://h/check?probe=1");
    }

    #[test]
    fn body_content_type_detected_from_json() {
        let mut policy = ActiveHealthPolicy::new("/x");
        policy.body = Some(r#"{"a":1}"#.to_string());
        let (_, ct) = policy.build_body().unwrap();
        assert_eq!(ct, "application/json");

        policy.body = Some("a=1&b=2".to_string());
        let (_, ct) = policy.build_body().unwrap();
        assert_eq!(ct, "application/x-www-form-urlencoded");
    }

    #[test]
    fn evaluate_defaults_to_2xx() {
        let policy = ActiveHealthPolicy::new("/x");
        assert!(policy.evaluate(204, &HashMap::new(), ""));
        assert!(!policy.evaluate(500, &HashMap::new(), ""));
    }

    #[test]
    fn evaluate_checks_content_contains() {
        let mut policy = ActiveHealthPolicy::new("/x");
        policy.valid_content = Some((ContentCheck::Contains, "ok".to_string()));
        assert!(policy.evaluate(200, &HashMap::new(), "status: ok"));
        assert!(!policy.evaluate(200, &HashMap::new(), "status: down"));
    }

    #[test]
    fn evaluate_checks_json_subset() {
        let mut policy = ActiveHealthPolicy::new("/x");
        policy.valid_content = Some((ContentCheck::JsonM, r#"{"status":"up","tags":["a"]}"#.to_string()));
        assert!(policy.evaluate(
            200,
            &HashMap::new(),
            r#"{"status":"up","extra":1,"tags":["a","b"]}"#
        ));
        assert!(!policy.evaluate(200, &HashMap::new(), r#"{"status":"down"}"#));
    }

    #[test]
    fn evaluate_checks_headers_case_insensitively() {
        let mut policy = ActiveHealthPolicy::new("/x");
        policy.valid_headers = vec![("X-Status".to_string(), "ready".to_string())];
        let mut headers = HashMap::new();
        headers.insert("x-status".to_string(), "service-ready".to_string());
        assert!(policy.evaluate(200, &headers, ""));
    }

    #[test]
    fn state_machine_transitions_on_consecutive_results() {
        let mut counters = Counters::default();
        assert_eq!(counters.record(true, 2, 2), HealthStatus::Unknown);
        assert_eq!(counters.record(true, 2, 2), HealthStatus::Healthy);
        assert_eq!(counters.record(false, 2, 2), HealthStatus::Healthy);
        assert_eq!(counters.record(false, 2, 2), HealthStatus::Unhealthy);
    }

    struct RecordingSink {
        updates: StdMutex<Vec<(String, Vec<(String, HealthStatus)>)>>,
    }

    impl HealthSink for RecordingSink {
        fn publish(&self, cluster: &str, updates: Vec<(String, HealthStatus)>) {
            self.updates.lock().unwrap().push((cluster.to_string(), updates));
        }
    }

    #[tokio::test]
    async fn run_round_publishes_one_batch() {
        let prober = HealthProber::new();
        let sink = RecordingSink {
            updates: StdMutex::new(Vec::new()),
        };
        let client = reqwest::Client::new();
        let mut policy = ActiveHealthPolicy::new("/nonexistent-path");
        policy.timeout = Duration::from_millis(50);
        let destinations = vec![("d1".to_string(), "http://127.0.0.1:1".to_string())];

        prober
            .run_round(&client, "cluster-a", &policy, &destinations, &sink)
            .await;

        let recorded = sink.updates.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "cluster-a");
        assert_eq!(recorded[0].1.len(), 1);
        assert_eq!(recorded[0].1[0].1, HealthStatus::Unknown);
    }
}
