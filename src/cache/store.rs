//! SQLite-backed cache store.
//!
//! Each namespace is a separate database (or in-memory connection) guarded by
//! its own mutex, so traffic in one namespace never waits on another.

use super::{composite_key, CacheOverview, CacheParams, CacheStats, Clock, Counters, Namespace, SystemClock};
use crate::config::CacheSettings;
use crate::error::{Result, SamleError};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS entries (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        last_access INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_entries_last_access ON entries(last_access);
    CREATE INDEX IF NOT EXISTS idx_entries_expires_at ON entries(expires_at);
"#;

const CREATED_AT_KEY: &str = "created_at";
const LAST_CLEANUP_KEY: &str = "last_cleanup";

/// Tunables shared by every namespace.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `store` is called without one.
    pub default_ttl: Duration,
    /// Size budget of each namespace.
    pub size_limit_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            default_ttl: Duration::from_secs(settings.default_ttl_seconds),
            size_limit_bytes: settings.size_limit_bytes,
        }
    }
}

/// One namespace: its connection, LRU sequence and counters.
struct Partition {
    namespace: Namespace,
    conn: Mutex<Connection>,
    access_seq: AtomicU64,
    counters: Counters,
}

impl Partition {
    fn new(namespace: Namespace, conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;

        let max_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(last_access), 0) FROM entries",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            namespace,
            conn: Mutex::new(conn),
            access_seq: AtomicU64::new(max_seq.max(0) as u64),
            counters: Counters::default(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SamleError::Cache(format!("Failed to acquire lock: {}", e)))
    }

    fn next_seq(&self) -> i64 {
        (self.access_seq.fetch_add(1, Ordering::Relaxed) + 1) as i64
    }

    /// Read a live entry and touch its LRU position. Expired rows are removed.
    fn read(&self, key: &str, now_ms: i64) -> Result<Option<String>> {
        let conn = self.lock()?;

        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, expires_at FROM entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((_, expires_at)) if expires_at <= now_ms => {
                conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
                Ok(None)
            }
            Some((value, _)) => {
                conn.execute(
                    "UPDATE entries SET last_access = ?1 WHERE key = ?2",
                    params![self.next_seq(), key],
                )?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Write an entry, then trim least-recently-used rows until within budget.
    /// The entry just written is never evicted. Returns the number evicted.
    fn write(&self, key: &str, value: &str, now_ms: i64, expires_ms: i64, size_limit: u64) -> Result<usize> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let size_bytes = (key.len() + value.len()) as i64;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO entries (key, value, size_bytes, created_at, expires_at, last_access)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![key, value, size_bytes, now_ms, expires_ms, self.next_seq()],
        )?;

        let total: i64 = tx.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM entries",
            [],
            |row| row.get(0),
        )?;

        let mut evicted = 0;
        if total as u64 > size_limit {
            let mut excess = total as u64 - size_limit;
            let victims: Vec<(String, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT key, size_bytes FROM entries WHERE key != ?1 ORDER BY last_access ASC",
                )?;
                let rows = stmt.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
                let victims = rows.collect::<std::result::Result<Vec<_>, _>>()?;
                victims
            };

            for (victim, size) in victims {
                if excess == 0 {
                    break;
                }
                tx.execute("DELETE FROM entries WHERE key = ?1", params![victim])?;
                excess = excess.saturating_sub(size.max(0) as u64);
                evicted += 1;
            }
        }

        tx.commit()?;
        Ok(evicted)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    fn clear(&self) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM entries", [])?)
    }

    /// Remove expired rows and rows created before `created_before_ms`.
    /// Returns (rows before, rows removed).
    fn purge(&self, now_ms: i64, created_before_ms: i64) -> Result<(usize, usize)> {
        let conn = self.lock()?;
        let before: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        let removed = conn.execute(
            "DELETE FROM entries WHERE expires_at <= ?1 OR created_at <= ?2",
            params![now_ms, created_before_ms],
        )?;
        Ok((before as usize, removed))
    }

    fn usage(&self) -> Result<(u64, u64)> {
        let conn = self.lock()?;
        let (size, count): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0), COUNT(*) FROM entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((size.max(0) as u64, count.max(0) as u64))
    }
}

/// Namespaced, size-bounded, TTL-expiring cache.
pub struct CacheStore {
    partitions: BTreeMap<Namespace, Partition>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// Open (or create) a cache with one database file per namespace under `dir`.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path, config: CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut partitions = BTreeMap::new();
        for namespace in Namespace::ALL {
            let conn = Connection::open(dir.join(format!("{}.db", namespace)))?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            partitions.insert(namespace, Partition::new(namespace, conn)?);
        }

        let store = Self::from_partitions(partitions, config, Arc::new(SystemClock));
        info!(
            "Cache initialized at {:?} with TTL {}s and size limit {:.1}MB per namespace",
            dir,
            store.config.default_ttl.as_secs(),
            store.config.size_limit_bytes as f64 / 1024.0 / 1024.0
        );
        Ok(store)
    }

    /// Create a cache that lives only in memory (useful for testing).
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        let mut partitions = BTreeMap::new();
        for namespace in Namespace::ALL {
            partitions.insert(namespace, Partition::new(namespace, Connection::open_in_memory()?)?);
        }
        Ok(Self::from_partitions(partitions, config, Arc::new(SystemClock)))
    }

    fn from_partitions(
        partitions: BTreeMap<Namespace, Partition>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Self {
            partitions,
            config,
            clock,
        };
        if store.read_metadata(CREATED_AT_KEY).is_none() {
            store.write_metadata(CREATED_AT_KEY, store.clock.now());
        }
        store
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn partition(&self, namespace: Namespace) -> &Partition {
        // Every namespace gets a partition at construction.
        &self.partitions[&namespace]
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Look up a value. Absent, expired and unreadable entries are all misses.
    pub fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &str, params: &CacheParams) -> Option<T> {
        let cache_key = composite_key(key, params);
        let partition = self.partition(namespace);

        match partition.read(&cache_key, self.now_ms()) {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    Counters::bump(&partition.counters.hits);
                    debug!("Cache hit for {}:{}", namespace, &cache_key[..8]);
                    Some(value)
                }
                Err(e) => {
                    Counters::bump(&partition.counters.errors);
                    error!("Corrupt cache entry {}:{}: {}", namespace, &cache_key[..8], e);
                    if let Err(e) = partition.remove(&cache_key) {
                        warn!("Failed to drop corrupt entry: {}", e);
                    }
                    None
                }
            },
            Ok(None) => {
                Counters::bump(&partition.counters.misses);
                debug!("Cache miss for {}:{}", namespace, &cache_key[..8]);
                None
            }
            Err(e) => {
                Counters::bump(&partition.counters.errors);
                error!("Error retrieving from cache {}: {}", namespace, e);
                None
            }
        }
    }

    /// Store a value with an absolute expiry of now + `ttl` (or the default TTL).
    pub fn store<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        params: &CacheParams,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let cache_key = composite_key(key, params);
        let partition = self.partition(namespace);
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                Counters::bump(&partition.counters.errors);
                error!("Failed to serialize value for cache {}: {}", namespace, e);
                return false;
            }
        };

        let now_ms = self.now_ms();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_ms = now_ms.saturating_add(ttl_ms);

        match partition.write(&cache_key, &raw, now_ms, expires_ms, self.config.size_limit_bytes) {
            Ok(evicted) => {
                Counters::bump(&partition.counters.stores);
                if evicted > 0 {
                    debug!("Evicted {} entries from {} to stay within budget", evicted, namespace);
                }
                debug!("Stored in cache {}:{} with TTL {}s", namespace, &cache_key[..8], ttl.as_secs());
                true
            }
            Err(e) => {
                Counters::bump(&partition.counters.errors);
                error!("Error storing in cache {}: {}", namespace, e);
                false
            }
        }
    }

    /// Delete one entry. Returns whether something was removed.
    pub fn delete(&self, namespace: Namespace, key: &str, params: &CacheParams) -> bool {
        let cache_key = composite_key(key, params);
        let partition = self.partition(namespace);

        match partition.remove(&cache_key) {
            Ok(true) => {
                Counters::bump(&partition.counters.deletes);
                debug!("Deleted from cache {}:{}", namespace, &cache_key[..8]);
                true
            }
            Ok(false) => false,
            Err(e) => {
                Counters::bump(&partition.counters.errors);
                error!("Error deleting from cache {}: {}", namespace, e);
                false
            }
        }
    }

    /// Clear one namespace, or every namespace except `metadata` when `None`.
    pub fn clear(&self, namespace: Option<Namespace>) -> bool {
        let targets: Vec<Namespace> = match namespace {
            Some(ns) => vec![ns],
            None => Namespace::ALL
                .into_iter()
                .filter(|ns| *ns != Namespace::Metadata)
                .collect(),
        };

        let mut ok = true;
        for ns in targets {
            let partition = self.partition(ns);
            match partition.clear() {
                Ok(removed) => {
                    Counters::add(&partition.counters.deletes, removed as u64);
                    info!("Cleared cache {} ({} entries)", ns, removed);
                }
                Err(e) => {
                    Counters::bump(&partition.counters.errors);
                    error!("Error clearing cache {}: {}", ns, e);
                    ok = false;
                }
            }
        }
        ok
    }

    /// Purge expired entries and entries older than `max_age` (default TTL if `None`).
    ///
    /// Returns (items before cleanup, items removed) summed over all namespaces
    /// except `metadata`.
    pub fn cleanup(&self, max_age: Option<Duration>) -> (usize, usize) {
        let max_age = max_age.unwrap_or(self.config.default_ttl);
        let now_ms = self.now_ms();
        let age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let created_before_ms = now_ms.saturating_sub(age_ms);

        let mut items_before = 0;
        let mut items_removed = 0;

        for (namespace, partition) in &self.partitions {
            if *namespace == Namespace::Metadata {
                continue;
            }
            match partition.purge(now_ms, created_before_ms) {
                Ok((before, removed)) => {
                    items_before += before;
                    items_removed += removed;
                    debug!("Expired {} items from {} cache", removed, namespace);
                }
                Err(e) => {
                    Counters::bump(&partition.counters.errors);
                    error!("Error during cleanup of {} cache: {}", namespace, e);
                }
            }
        }

        self.write_metadata(LAST_CLEANUP_KEY, self.clock.now());
        info!("Cache cleanup removed {} of {} items", items_removed, items_before);
        (items_before, items_removed)
    }

    /// Statistics for one namespace, or summed over every namespace except
    /// `metadata`.
    pub fn stats(&self, namespace: Option<Namespace>) -> CacheStats {
        match namespace {
            Some(ns) => self.namespace_stats(ns),
            None => {
                let mut total = CacheStats::default();
                for ns in Namespace::ALL.into_iter().filter(|ns| *ns != Namespace::Metadata) {
                    total.merge(&self.namespace_stats(ns));
                }
                total
            }
        }
    }

    /// Per-namespace stats plus creation and cleanup timestamps.
    pub fn overview(&self) -> CacheOverview {
        let namespaces: BTreeMap<Namespace, CacheStats> = Namespace::ALL
            .into_iter()
            .map(|ns| (ns, self.namespace_stats(ns)))
            .collect();

        let mut total = CacheStats::default();
        for (ns, stats) in &namespaces {
            if *ns != Namespace::Metadata {
                total.merge(stats);
            }
        }

        CacheOverview {
            created_at: self.read_metadata(CREATED_AT_KEY),
            last_cleanup: self.read_metadata(LAST_CLEANUP_KEY),
            namespaces,
            total,
        }
    }

    fn namespace_stats(&self, namespace: Namespace) -> CacheStats {
        let partition = self.partition(namespace);
        let (size_bytes, item_count) = partition.usage().unwrap_or_else(|e| {
            Counters::bump(&partition.counters.errors);
            error!("Error reading cache size for {}: {}", partition.namespace, e);
            (0, 0)
        });
        CacheStats::from_counters(&partition.counters, size_bytes, item_count)
    }

    fn write_metadata(&self, name: &str, at: DateTime<Utc>) {
        let partition = self.partition(Namespace::Metadata);
        let key = composite_key(name, &CacheParams::new());
        let value = at.timestamp_millis().to_string();
        let now_ms = self.now_ms();
        if let Err(e) = partition.write(&key, &value, now_ms, i64::MAX, self.config.size_limit_bytes) {
            Counters::bump(&partition.counters.errors);
            warn!("Failed to record cache metadata {}: {}", name, e);
        }
    }

    fn read_metadata(&self, name: &str) -> Option<DateTime<Utc>> {
        let partition = self.partition(Namespace::Metadata);
        let key = composite_key(name, &CacheParams::new());
        let raw = partition.read(&key, self.now_ms()).ok().flatten()?;
        let millis: i64 = raw.parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}
