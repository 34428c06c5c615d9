//! Geo-IP resolution, wrapping an IP2Region-style XDB file loaded fully
//! into memory (per spec: "full in-memory cache policy").
//!
//! The geo module is specified as a trait with a default XDB-backed
//! implementation; tests use a canned-answer double instead of shipping a
//! real database (see [`StaticGeoResolver`]).

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Resolved geo fields for one IP. The sentinel value `"0"` used by the
/// source XDB format is normalised to an empty string at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: String,
    pub region: String,
    pub city: String,
    pub isp: String,
    pub raw: String,
}

impl GeoInfo {
    /// `true` if any of country/region/city case-insensitively equals `name`.
    pub fn matches_any(&self, name: &str) -> bool {
        self.country.eq_ignore_ascii_case(name)
            || self.region.eq_ignore_ascii_case(name)
            || self.city.eq_ignore_ascii_case(name)
    }

    fn from_pipe_fields(raw: &str) -> Self {
        let mut parts = raw.split('|');
        let norm = |s: Option<&str>| -> String {
            match s.map(str::trim) {
                Some("0") | None | Some("") => String::new(),
                Some(v) => v.to_string(),
            }
        };
        let country = norm(parts.next());
        let _area = norm(parts.next());
        let region = norm(parts.next());
        let city = norm(parts.next());
        let isp = norm(parts.next());
        Self {
            country,
            region,
            city,
            isp,
            raw: raw.to_string(),
        }
    }
}

/// Abstraction over geo lookup so the admission gate can be tested without a
/// real database and so an alternative geo backend can be swapped in later.
pub trait GeoResolver: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

struct Record {
    start: u32,
    end: u32,
    data: String,
}

/// XDB-backed resolver. Only IPv4 is supported (matching the source
/// IP2Region format); IPv6 lookups always miss.
pub struct XdbGeoResolver {
    records: Vec<Record>,
}

#[derive(Debug)]
pub struct XdbLoadError(pub String);

impl std::fmt::Display for XdbLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to load geo database: {}", self.0)
    }
}

impl std::error::Error for XdbLoadError {}

const MAGIC: &[u8; 4] = b"XDB1";

impl XdbGeoResolver {
    /// Loads the whole file into memory and parses it once at startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, XdbLoadError> {
        let bytes = std::fs::read(path.as_ref()).map_err(|e| XdbLoadError(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, XdbLoadError> {
        if bytes.len() < 8 || &bytes[0..4] != MAGIC {
            return Err(XdbLoadError("bad magic header".to_string()));
        }
        let count = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let mut records = Vec::with_capacity(count);
        let mut cursor = 8usize;
        for _ in 0..count {
            if cursor + 10 > bytes.len() {
                return Err(XdbLoadError("truncated record header".to_string()));
            }
            let start = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
            let end = u32::from_be_bytes(bytes[cursor + 4..cursor + 8].try_into().unwrap());
            let len = u16::from_be_bytes(bytes[cursor + 8..cursor + 10].try_into().unwrap()) as usize;
            cursor += 10;
            if cursor + len > bytes.len() {
                return Err(XdbLoadError("truncated record data".to_string()));
            }
            let data = String::from_utf8_lossy(&bytes[cursor..cursor + len]).into_owned();
            cursor += len;
            records.push(Record { start, end, data });
        }
        records.sort_by_key(|r| r.start);
        Ok(Self { records })
    }

    fn lookup_v4(&self, ip: Ipv4Addr) -> Option<&Record> {
        let key = u32::from_be_bytes(ip.octets());
        let idx = self
            .records
            .partition_point(|r| r.start <= key)
            .checked_sub(1)?;
        let rec = self.records.get(idx)?;
        if key >= rec.start && key <= rec.end {
            Some(rec)
        } else {
            None
        }
    }
}

impl GeoResolver for XdbGeoResolver {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        match ip {
            IpAddr::V4(v4) => self.lookup_v4(v4).map(|r| GeoInfo::from_pipe_fields(&r.data)),
            IpAddr::V6(_) => None,
        }
    }
}

/// Canned-answer test double — returns a fixed mapping, used in unit tests
/// and anywhere a real XDB file isn't available.
#[derive(Default)]
pub struct StaticGeoResolver {
    entries: std::collections::HashMap<IpAddr, GeoInfo>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, info: GeoInfo) -> Self {
        self.entries.insert(ip, info);
        self
    }
}

impl GeoResolver for StaticGeoResolver {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        self.entries.get(&ip).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_xdb(records: &[(u32, u32, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(records.len() as u32).to_be_bytes());
        for (start, end, data) in records {
            buf.extend_from_slice(&start.to_be_bytes());
            buf.extend_from_slice(&end.to_be_bytes());
            buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
            buf.extend_from_slice(data.as_bytes());
        }
        buf
    }

    #[test]
    fn parses_pipe_fields_and_normalises_zero() {
        let info = GeoInfo::from_pipe_fields("China|0|Zhejiang|Hangzhou|Telecom");
        assert_eq!(info.country, "China");
        assert_eq!(info.region, "Zhejiang");
        assert_eq!(info.city, "Hangzhou");
        assert_eq!(info.isp, "Telecom");
    }

    #[test]
    fn xdb_lookup_hits_and_misses() {
        let ip_to_u32 = |s: &str| u32::from_be_bytes(s.parse::<Ipv4Addr>().unwrap().octets());
        let bytes = build_xdb(&[
            (
                ip_to_u32("1.0.0.0"),
                ip_to_u32("1.0.0.255"),
                "China|0|Zhejiang|Hangzhou|Telecom",
            ),
            (
                ip_to_u32("8.8.8.0"),
                ip_to_u32("8.8.8.255"),
                "US|0|California|MountainView|Google",
            ),
        ]);
        let resolver = XdbGeoResolver::from_bytes(&bytes).unwrap();

        let hit = resolver.lookup("1.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(hit.country, "China");

        let miss = resolver.lookup("2.0.0.5".parse().unwrap());
        assert!(miss.is_none());

        // IPv6 never matches an IPv4-only XDB.
        assert!(resolver.lookup("::1".parse().unwrap()).is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(XdbGeoResolver::from_bytes(b"nope").is_err());
    }

    #[test]
    fn static_resolver_returns_canned_answers() {
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        let resolver = StaticGeoResolver::new().with(
            ip,
            GeoInfo {
                country: "Testland".into(),
                ..Default::default()
            },
        );
        assert_eq!(resolver.lookup(ip).unwrap().country, "Testland");
        assert!(resolver.lookup("1.1.1.1".parse().unwrap()).is_none());
    }

    #[test]
    fn matches_any_is_case_insensitive() {
        let info = GeoInfo {
            country: "China".into(),
            region: "Zhejiang".into(),
            city: "Hangzhou".into(),
            ..Default::default()
        };
        assert!(info.matches_any("china"));
        assert!(info.matches_any("HANGZHOU"));
        assert!(!info.matches_any("Japan"));
    }
}
