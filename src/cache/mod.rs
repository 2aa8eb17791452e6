//! Persistent result cache for Samle.
//!
//! Entries live in independent namespaces, each with its own SQLite database,
//! size budget, LRU order and counters. Lookups are keyed by a hash of the
//! primary key plus a sorted parameter set, so the same media can be cached
//! once per model / target language combination.
//!
//! The cache is an optimization only: storage failures never propagate to
//! callers. They are logged, counted, and reported as a miss (or `false` for
//! writes).

mod clock;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use store::{CacheConfig, CacheStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Parameters that distinguish otherwise identical primary keys.
///
/// A `BTreeMap` keeps iteration sorted, which makes the composite key
/// independent of insertion order.
pub type CacheParams = BTreeMap<String, String>;

/// Independent eviction and statistics domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Analysis (transcription) results.
    Transcription,
    /// Translated text.
    Translation,
    /// Download metadata.
    Download,
    /// Cache bookkeeping. Skipped by `clear(None)` and `cleanup`.
    Metadata,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::Transcription,
        Namespace::Translation,
        Namespace::Download,
        Namespace::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Transcription => "transcription",
            Namespace::Translation => "translation",
            Namespace::Download => "download",
            Namespace::Metadata => "metadata",
        }
    }
}

impl std::str::FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transcription" | "analysis" | "analysis-results" => Ok(Namespace::Transcription),
            "translation" => Ok(Namespace::Translation),
            "download" | "download-metadata" => Ok(Namespace::Download),
            "metadata" => Ok(Namespace::Metadata),
            _ => Err(format!(
                "Unknown cache namespace: {}. Use transcription, translation, download or metadata.",
                s
            )),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the storage key for a primary key and parameter set.
///
/// The parameters are rendered as `k=v` pairs in sorted order, joined with the
/// primary key by `|`, and hashed with SHA-256.
pub fn composite_key(key: &str, params: &CacheParams) -> String {
    let mut parts = Vec::with_capacity(params.len() + 1);
    parts.push(key.to_string());
    for (k, v) in params {
        parts.push(format!("{}={}", k, v));
    }

    let digest = Sha256::digest(parts.join("|").as_bytes());
    hex::encode(digest)
}

/// Build a parameter set from borrowed pairs.
pub fn params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> CacheParams {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Lock-free operation counters for one namespace.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stores: AtomicU64,
    pub deletes: AtomicU64,
    pub errors: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Statistics for one namespace, or the sum over all of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_ratio: f64,
    pub size_bytes: u64,
    pub item_count: u64,
}

impl CacheStats {
    pub(crate) fn from_counters(counters: &Counters, size_bytes: u64, item_count: u64) -> Self {
        let mut stats = Self {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            stores: counters.stores.load(Ordering::Relaxed),
            deletes: counters.deletes.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            hit_ratio: 0.0,
            size_bytes,
            item_count,
        };
        stats.hit_ratio = stats.compute_hit_ratio();
        stats
    }

    /// Fold another namespace's numbers into this one.
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.stores += other.stores;
        self.deletes += other.deletes;
        self.errors += other.errors;
        self.size_bytes += other.size_bytes;
        self.item_count += other.item_count;
        self.hit_ratio = self.compute_hit_ratio();
    }

    fn compute_hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-namespace stats plus cache-wide bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOverview {
    pub created_at: Option<DateTime<Utc>>,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub namespaces: BTreeMap<Namespace, CacheStats>,
    pub total: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_key_ignores_param_order() {
        let mut a = CacheParams::new();
        a.insert("model".into(), "small".into());
        a.insert("target_lang".into(), "de".into());

        let mut b = CacheParams::new();
        b.insert("target_lang".into(), "de".into());
        b.insert("model".into(), "small".into());

        assert_eq!(composite_key("url", &a), composite_key("url", &b));
    }

    #[test]
    fn test_composite_key_distinguishes_params() {
        let de = params([("model", "small"), ("target_lang", "de")]);
        let fr = params([("model", "small"), ("target_lang", "fr")]);
        let none = CacheParams::new();

        let keys = [
            composite_key("url", &de),
            composite_key("url", &fr),
            composite_key("url", &none),
        ];
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[0], keys[2]);
        assert_ne!(keys[1], keys[2]);
        assert_eq!(keys[0].len(), 64);
    }

    #[test]
    fn test_hit_ratio() {
        let counters = Counters::default();
        Counters::add(&counters.hits, 3);
        Counters::bump(&counters.misses);

        let stats = CacheStats::from_counters(&counters, 10, 2);
        assert!((stats.hit_ratio - 0.75).abs() < f64::EPSILON);

        let empty = CacheStats::default();
        assert_eq!(empty.hit_ratio, 0.0);
    }

    #[test]
    fn test_parse_namespace() {
        assert_eq!("analysis-results".parse::<Namespace>().unwrap(), Namespace::Transcription);
        assert_eq!("Download".parse::<Namespace>().unwrap(), Namespace::Download);
        assert!("bogus".parse::<Namespace>().is_err());
    }
}
