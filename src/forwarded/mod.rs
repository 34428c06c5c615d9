//! Forwarded-header rewriting: parses whatever `Forwarded`/`X-Forwarded-*`
//! headers a client sent, strips them, then re-emits either family
//! according to policy.
//!
//! Generalizes `proxy/handler.rs`'s `inject_forwarded_headers`, which only
//! ever appended to `X-Forwarded-For` and trusted the inbound `Proto`/`Host`
//! verbatim. This module adds the `none`/`set`/`append` policy switch and
//! RFC 7239 `Forwarded` emission the handler never needed before.

use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::config::types::ForwardedSecurityConfig;

const FORWARDED: HeaderName = HeaderName::from_static("forwarded");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// What to do with a given header family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    None,
    Set,
    Append,
}

#[derive(Debug, Clone, Default)]
pub struct ForwardedConfig {
    pub for_value: Option<String>,
    pub proto_value: Option<String>,
    pub host_value: Option<String>,
    pub method: Mode,
    /// `true` emits `X-Forwarded-*`, `false` emits RFC 7239 `Forwarded`.
    pub is_x: bool,
}

impl From<&ForwardedSecurityConfig> for ForwardedConfig {
    fn from(cfg: &ForwardedSecurityConfig) -> Self {
        let method = match cfg.method.as_str() {
            "set" => Mode::Set,
            "append" => Mode::Append,
            "none" => Mode::None,
            other => {
                warn!("forwarded: unknown method {other}, defaulting to none");
                Mode::None
            }
        };
        let is_x = match cfg.family.as_str() {
            "x_forwarded" => true,
            "rfc7239" => false,
            other => {
                warn!("forwarded: unknown family {other}, defaulting to x_forwarded");
                true
            }
        };
        ForwardedConfig {
            for_value: cfg.for_value.clone(),
            proto_value: cfg.proto_value.clone(),
            host_value: cfg.host_value.clone(),
            method,
            is_x,
        }
    }
}

/// One hop's worth of parsed forwarding info.
#[derive(Debug, Clone, Default)]
struct Parsed {
    for_list: Vec<String>,
    proto: Option<String>,
    host: Option<String>,
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"')
}

/// Parse `Forwarded: for=1.2.3.4;proto=https;host=example.com, for=5.6.7.8`.
/// Entries are comma-separated hops, each a `;`-separated list of
/// `key=value` pairs. We collect every `for=` across all hops in order, and
/// take `proto`/`host` from the last hop that specified them.
fn parse_forwarded(value: &str) -> Parsed {
    let mut parsed = Parsed::default();
    for hop in value.split(',') {
        for pair in hop.split(';') {
            let pair = pair.trim();
            let Some((key, val)) = pair.split_once('=') else {
                continue;
            };
            let val = unquote(val);
            if val.is_empty() {
                continue;
            }
            match key.trim().to_ascii_lowercase().as_str() {
                "for" => parsed.for_list.push(val.to_string()),
                "proto" => parsed.proto = Some(val.to_string()),
                "host" => parsed.host = Some(val.to_string()),
                _ => {}
            }
        }
    }
    parsed
}

fn parse_x_forwarded(headers: &HeaderMap) -> Parsed {
    let for_list = headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|s| unquote(s).to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let proto = headers
        .get(&X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .map(|v| unquote(v).to_string());
    let host = headers
        .get(&X_FORWARDED_HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| unquote(v).to_string());
    Parsed { for_list, proto, host }
}

fn merge(forwarded: Parsed, x: Parsed) -> Parsed {
    let mut for_list = forwarded.for_list;
    for_list.extend(x.for_list);
    Parsed {
        for_list,
        proto: forwarded.proto.or(x.proto),
        host: forwarded.host.or(x.host),
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

/// Strip all four forwarded-header families from `headers`, parses their
/// combined contents, and (per `config.method`) re-emits either
/// `X-Forwarded-*` or RFC 7239 `Forwarded`.
///
/// `client_ip` is this hop's own address — the value appended when
/// `method == Append`, or used (with config overrides) when `method == Set`.
pub fn process(headers: &mut HeaderMap, config: &ForwardedConfig, client_ip: &str, request_proto: &str, request_host: &str) {
    let forwarded_hdr = headers
        .get(&FORWARDED)
        .and_then(|v| v.to_str().ok())
        .map(parse_forwarded)
        .unwrap_or_default();
    let x_hdr = parse_x_forwarded(headers);
    let existing = merge(forwarded_hdr, x_hdr);

    headers.remove(&FORWARDED);
    headers.remove(&X_FORWARDED_FOR);
    headers.remove(&X_FORWARDED_PROTO);
    headers.remove(&X_FORWARDED_HOST);

    if config.method == Mode::None {
        return;
    }

    if config.is_x {
        emit_x_forwarded(headers, config, client_ip, request_proto, request_host, &existing);
    } else {
        emit_forwarded(headers, config, client_ip, &existing);
    }
}

fn emit_x_forwarded(
    headers: &mut HeaderMap,
    config: &ForwardedConfig,
    client_ip: &str,
    request_proto: &str,
    request_host: &str,
    existing: &Parsed,
) {
    match config.method {
        Mode::Set => {
            let for_value = config.for_value.as_deref().unwrap_or(client_ip);
            let proto_value = config.proto_value.as_deref().unwrap_or(request_proto);
            let host_value = config.host_value.as_deref().unwrap_or(request_host);
            insert_header(headers, X_FORWARDED_FOR, for_value);
            insert_header(headers, X_FORWARDED_PROTO, proto_value);
            insert_header(headers, X_FORWARDED_HOST, host_value);
        }
        Mode::Append => {
            let mut list = existing.for_list.clone();
            list.push(config.for_value.clone().unwrap_or_else(|| client_ip.to_string()));
            insert_header(headers, X_FORWARDED_FOR, &list.join(", "));

            let proto_value = existing
                .proto
                .clone()
                .or_else(|| config.proto_value.clone())
                .unwrap_or_else(|| request_proto.to_string());
            insert_header(headers, X_FORWARDED_PROTO, &proto_value);

            let host_value = existing
                .host
                .clone()
                .or_else(|| config.host_value.clone())
                .unwrap_or_else(|| request_host.to_string());
            insert_header(headers, X_FORWARDED_HOST, &host_value);
        }
        Mode::None => {}
    }
}

fn forwarded_entry(for_val: &str, proto: Option<&str>, host: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(p) = proto {
        parts.push(format!("proto={p}"));
    }
    if let Some(h) = host {
        parts.push(format!("host=\"{h}\""));
    }
    parts.push(format!("for={}", quote_if_needed(for_val)));
    parts.join("; ")
}

fn quote_if_needed(v: &str) -> String {
    if v.contains(':') || v.contains('"') {
        format!("\"{v}\"")
    } else {
        v.to_string()
    }
}

fn emit_forwarded(headers: &mut HeaderMap, config: &ForwardedConfig, client_ip: &str, existing: &Parsed) {
    match config.method {
        Mode::Set => {
            let for_value = config.for_value.as_deref().unwrap_or(client_ip);
            let proto = config.proto_value.as_deref().unwrap_or("http");
            let host = config.host_value.as_deref().unwrap_or("");
            let value = format!(
                "proto={proto}; host=\"{host}\"; for={}; by=lywaf",
                quote_if_needed(for_value)
            );
            insert_header(headers, FORWARDED, &value);
        }
        Mode::Append => {
            let mut entries: Vec<String> = existing
                .for_list
                .iter()
                .map(|f| forwarded_entry(f, existing.proto.as_deref(), existing.host.as_deref()))
                .collect();
            let own_for = config.for_value.clone().unwrap_or_else(|| client_ip.to_string());
            entries.push(format!("for={}; by=lywaf", quote_if_needed(&own_for)));
            insert_header(headers, FORWARDED, &entries.join(", "));
        }
        Mode::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> HeaderMap {
        HeaderMap::new()
    }

    #[test]
    fn none_mode_strips_but_does_not_reemit() {
        let mut h = headers();
        h.insert(&X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        let config = ForwardedConfig {
            method: Mode::None,
            is_x: true,
            ..Default::default()
        };
        process(&mut h, &config, "9.9.9.9", "http", "example.com");
        assert!(h.get(&X_FORWARDED_FOR).is_none());
        assert!(h.get(&FORWARDED).is_none());
    }

    #[test]
    fn x_set_uses_config_override_or_request_defaults() {
        let mut h = headers();
        let config = ForwardedConfig {
            method: Mode::Set,
            is_x: true,
            ..Default::default()
        };
        process(&mut h, &config, "9.9.9.9", "https", "api.example.com");
        assert_eq!(h.get(&X_FORWARDED_FOR).unwrap(), "9.9.9.9");
        assert_eq!(h.get(&X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(h.get(&X_FORWARDED_HOST).unwrap(), "api.example.com");
    }

    #[test]
    fn x_append_preserves_existing_list_and_proto() {
        let mut h = headers();
        h.insert(&X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        h.insert(&X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        let config = ForwardedConfig {
            method: Mode::Append,
            is_x: true,
            ..Default::default()
        };
        process(&mut h, &config, "9.9.9.9", "http", "example.com");
        assert_eq!(h.get(&X_FORWARDED_FOR).unwrap(), "1.2.3.4, 9.9.9.9");
        assert_eq!(h.get(&X_FORWARDED_PROTO).unwrap(), "https");
    }

    #[test]
    fn forwarded_set_emits_single_rfc7239_entry() {
        let mut h = headers();
        let config = ForwardedConfig {
            method: Mode::Set,
            is_x: false,
            proto_value: Some("https".to_string()),
            host_value: Some("example.com".to_string()),
            ..Default::default()
        };
        process(&mut h, &config, "9.9.9.9", "http", "ignored.com");
        let value = h.get(&FORWARDED).unwrap().to_str().unwrap();
        assert!(value.contains("proto=https"));
        assert!(value.contains("host=\"example.com\""));
        assert!(value.contains("for=9.9.9.9"));
        assert!(value.contains("by=lywaf"));
    }

    #[test]
    fn forwarded_append_converts_each_hop_and_appends_self() {
        let mut h = headers();
        h.insert(&FORWARDED, HeaderValue::from_static("for=1.2.3.4;proto=https;host=example.com"));
        let config = ForwardedConfig {
            method: Mode::Append,
            is_x: false,
            ..Default::default()
        };
        process(&mut h, &config, "9.9.9.9", "http", "ignored.com");
        let value = h.get(&FORWARDED).unwrap().to_str().unwrap();
        let entries: Vec<&str> = value.split(", ").collect();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].contains("for=1.2.3.4"));
        assert!(entries[0].contains("proto=https"));
        assert!(entries[1].contains("for=9.9.9.9"));
        assert!(entries[1].contains("by=lywaf"));
    }

    #[test]
    fn parses_quoted_and_bracketed_for_values() {
        let parsed = parse_forwarded(r#"for="[2001:db8::1]";proto=https"#);
        assert_eq!(parsed.for_list, vec!["[2001:db8::1]".to_string()]);
        assert_eq!(parsed.proto, Some("https".to_string()));
    }

    #[test]
    fn config_conversion_maps_method_and_family() {
        let cfg = ForwardedSecurityConfig {
            method: "append".to_string(),
            family: "rfc7239".to_string(),
            ..Default::default()
        };
        let config = ForwardedConfig::from(&cfg);
        assert_eq!(config.method, Mode::Append);
        assert!(!config.is_x);
    }

    #[test]
    fn x_forwarded_for_is_merged_with_forwarded_header() {
        let mut h = headers();
        h.insert(&FORWARDED, HeaderValue::from_static("for=1.1.1.1"));
        h.insert(&X_FORWARDED_FOR, HeaderValue::from_static("2.2.2.2"));
        let config = ForwardedConfig {
            method: Mode::Append,
            is_x: true,
            ..Default::default()
        };
        process(&mut h, &config, "9.9.9.9", "http", "example.com");
        assert_eq!(h.get(&X_FORWARDED_FOR).unwrap(), "1.1.1.1, 2.2.2.2, 9.9.9.9");
    }
}
