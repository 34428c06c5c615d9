use std::fmt;

/// Reason a request was denied by the admission gate or rate limiter.
/// Carried alongside `GatewayError::Denied` so the pipeline can render
/// the right rejection message and status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    IpDenied,
    PathIpDenied,
    GeoDenied,
    PathGeoDenied,
    RateLimited,
    ConnectionLimited,
    Banned,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::IpDenied => "ip_denied",
            DenyReason::PathIpDenied => "path_ip_denied",
            DenyReason::GeoDenied => "geo_denied",
            DenyReason::PathGeoDenied => "path_geo_denied",
            DenyReason::RateLimited => "rate_limited",
            DenyReason::ConnectionLimited => "connection_limited",
            DenyReason::Banned => "banned",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
#[allow(dead_code)]
pub enum GatewayError {
    NoRouteMatch,
    NoUpstream,
    Denied(DenyReason),
    RateLimited,
    UpstreamTimeout,
    UpstreamConnect(String),
    Http(reqwest::Error),
    Consul(String),
    Etcd(String),
    Config(String),
    GeoLookup(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::NoUpstream => write!(f, "no upstream available"),
            GatewayError::Denied(reason) => write!(f, "denied: {}", reason),
            GatewayError::RateLimited => write!(f, "rate limited"),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Consul(msg) => write!(f, "consul error: {}", msg),
            GatewayError::Etcd(msg) => write!(f, "etcd error: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::GeoLookup(msg) => write!(f, "geo lookup error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
