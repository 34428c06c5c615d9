//! Path attribution: collapse a concrete request path down to the metrics
//! label it was generated from (`/orders/4821/items` -> `/orders/{id}/items`)
//! so per-path counters don't explode into one series per unique ID.
//!
//! Built the same way `routing/radix_tree.rs` builds its segment trie, but
//! keyed on segment *class* (literal / `*` / `{name}`) rather than on the
//! exact string, and with the three-bit `has_next` mask the matching
//! algorithm needs to know which classes are even worth trying at a given
//! node before it bothers constructing the candidate.

use std::collections::HashMap;
use std::time::Duration;

use crate::store::ExpiringStore;

const ANY: u8 = 0b001;
const MATCH: u8 = 0b010;
const FULL: u8 = 0b100;

const CACHE_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Seg {
    Literal(String),
    Any,
    Match,
}

fn classify(token: &str) -> Seg {
    if token == "*" {
        Seg::Any
    } else if token.starts_with('{') && token.ends_with('}') && token.len() > 2 {
        Seg::Match
    } else {
        Seg::Literal(token.to_string())
    }
}

fn class_bit(seg: &Seg) -> u8 {
    match seg {
        Seg::Any => ANY,
        Seg::Match => MATCH,
        Seg::Literal(_) => FULL,
    }
}

fn tokenize(path: &str) -> Vec<&str> {
    let path = path.split('?').next().unwrap_or(path);
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return vec![];
    }
    trimmed.split('/').collect()
}

/// Compiled trie over the configured route patterns plus an expiring
/// per-path result cache.
pub struct PathAttributor {
    leaves: HashMap<Vec<Seg>, String>,
    has_next: HashMap<Vec<Seg>, u8>,
    cache: ExpiringStore<String, String>,
}

impl PathAttributor {
    pub fn new(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let mut leaves = HashMap::new();
        let mut has_next: HashMap<Vec<Seg>, u8> = HashMap::new();

        for pattern in patterns {
            let pattern = pattern.as_ref();
            let tokens = tokenize(pattern);
            if tokens.is_empty() {
                leaves.insert(Vec::new(), pattern.to_string());
                continue;
            }
            let mut prefix: Vec<Seg> = Vec::new();
            let last = tokens.len() - 1;
            for (i, tok) in tokens.iter().enumerate() {
                let seg = classify(tok);
                *has_next.entry(prefix.clone()).or_insert(0) |= class_bit(&seg);
                prefix.push(seg);
                if i == last {
                    leaves.insert(prefix.clone(), pattern.to_string());
                }
            }
        }

        Self {
            leaves,
            has_next,
            cache: ExpiringStore::new(),
        }
    }

    fn exists(&self, prefix: &[Seg]) -> bool {
        self.leaves.contains_key(prefix) || self.has_next.contains_key(prefix)
    }

    /// Pure trie walk — no caching. See `attribute` for the cached entry point.
    fn resolve(&self, path: &str) -> String {
        let segments = tokenize(path);
        if segments.is_empty() {
            return self
                .leaves
                .get(&Vec::new())
                .cloned()
                .unwrap_or_else(|| path.to_string());
        }

        let last = segments.len() - 1;
        let mut working: Vec<Vec<Seg>> = vec![Vec::new()];

        for (i, s) in segments.iter().enumerate() {
            if working.is_empty() {
                break;
            }
            let mut next_working = Vec::new();
            for p in &working {
                let mask = self.has_next.get(p).copied().unwrap_or(0);

                if mask & ANY != 0 {
                    let mut candidate = p.clone();
                    candidate.push(Seg::Any);
                    if self.exists(&candidate) {
                        if let Some(pat) = self.leaves.get(&candidate) {
                            return pat.clone();
                        }
                        next_working.push(candidate);
                    }
                }

                if mask & FULL != 0 {
                    let mut candidate = p.clone();
                    candidate.push(Seg::Literal((*s).to_string()));
                    if self.exists(&candidate) {
                        if i == last {
                            if let Some(pat) = self.leaves.get(&candidate) {
                                return pat.clone();
                            }
                        } else {
                            next_working.push(candidate);
                        }
                    }
                }

                if mask & MATCH != 0 {
                    let mut candidate = p.clone();
                    candidate.push(Seg::Match);
                    if self.exists(&candidate) {
                        if i == last {
                            if let Some(pat) = self.leaves.get(&candidate) {
                                return pat.clone();
                            }
                        } else {
                            next_working.push(candidate);
                        }
                    }
                }
            }
            working = next_working;
        }

        path.to_string()
    }

    /// Cached entry point: attributes `path` to its canonical pattern,
    /// memoizing the result for 120 seconds.
    pub async fn attribute(&self, path: &str) -> String {
        let key = path.to_string();
        self.cache
            .get_or_insert_with(key, || self.resolve(path), Some(CACHE_TTL))
            .await
    }
}
