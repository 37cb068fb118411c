//! SQLite-backed recognition result cache.
//!
//! Results are keyed by content fingerprint, expire `ttl` after creation and
//! are evicted least-recently-accessed first once the store holds more than
//! `max_entries`. Each entry owns its element rows; deleting an entry cascades
//! to them.
//!
//! All access goes through one connection behind a mutex, so writers are
//! serialized and every operation runs in its own transaction. The database
//! runs in WAL mode so an external reader never blocks the writer.

use crate::config::{CacheConfig, MAX_CACHE_TTL};
use crate::fingerprint::ContentFingerprint;
use crate::types::{
    BackendKind, BoundingBox, ElementType, RecognitionResult, RecognitionStatus, UIElement,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),
    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Cache statistics for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    /// hits / (hits + misses), 0.0 before any lookup
    pub hit_rate: f64,
    /// Mean backend latency of the cached results
    pub average_latency_ms: f64,
    /// Database size on disk (or in memory)
    pub storage_bytes: u64,
    pub max_entries: usize,
}

/// Entry metadata as read from `cache_entries`
struct EntryRow {
    backend_used: String,
    model_name: String,
    status: String,
    latency_ms: i64,
    element_count: i64,
    created_at: i64,
    expires_at: i64,
}

/// Persistent result cache
pub struct ResultCache {
    conn: Mutex<Connection>,
    ttl: Duration,
    max_entries: usize,
}

impl ResultCache {
    /// Open or create the cache database at the given path
    pub fn open<P: AsRef<Path>>(
        path: P,
        ttl: Duration,
        max_entries: usize,
    ) -> Result<Self, CacheError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("Cache journal mode: {}", journal_mode);

        let cache = Self::init(conn, ttl, max_entries)?;
        info!(
            "Result cache opened at {:?}: ttl={}s, max_entries={}",
            path.as_ref(),
            ttl.as_secs(),
            max_entries
        );
        Ok(cache)
    }

    /// Open an in-memory cache (for testing)
    pub fn open_in_memory(ttl: Duration, max_entries: usize) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ttl, max_entries)
    }

    /// Open the cache described by the configuration
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Self::open(config.db_path(), config.ttl(), config.max_entries)
    }

    fn init(conn: Connection, ttl: Duration, max_entries: usize) -> Result<Self, CacheError> {
        Self::init_schema(&conn)?;
        let cache = Self {
            conn: Mutex::new(conn),
            ttl: ttl.min(MAX_CACHE_TTL),
            max_entries,
        };

        // Startup cleanup
        let purged = cache.evict_expired()?;
        if purged > 0 {
            info!("Purged {} expired cache entries on startup", purged);
        }
        Ok(cache)
    }

    /// Initialize database schema
    fn init_schema(conn: &Connection) -> Result<(), CacheError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- One row per cached recognition result
            CREATE TABLE IF NOT EXISTS cache_entries (
                fingerprint TEXT PRIMARY KEY,
                backend_used TEXT NOT NULL,
                model_name TEXT NOT NULL,
                status TEXT NOT NULL,
                latency_ms INTEGER NOT NULL CHECK(latency_ms >= 0),
                element_count INTEGER NOT NULL DEFAULT 0 CHECK(element_count >= 0),
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0 CHECK(hit_count >= 0),
                last_accessed_at INTEGER NOT NULL,
                access_seq INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_expires ON cache_entries(expires_at);
            CREATE INDEX IF NOT EXISTS idx_entries_lru ON cache_entries(access_seq, created_at);

            -- Elements of each result, in reading order
            CREATE TABLE IF NOT EXISTS ui_elements (
                fingerprint TEXT NOT NULL,
                position INTEGER NOT NULL,
                element_id TEXT NOT NULL,
                element_type TEXT NOT NULL,
                text_content TEXT NOT NULL,
                x1 INTEGER NOT NULL,
                y1 INTEGER NOT NULL,
                x2 INTEGER NOT NULL,
                y2 INTEGER NOT NULL,
                confidence REAL NOT NULL,
                actionable INTEGER NOT NULL,
                parent_id TEXT,
                PRIMARY KEY (fingerprint, position),
                FOREIGN KEY (fingerprint) REFERENCES cache_entries(fingerprint) ON DELETE CASCADE
            );

            -- Lifetime lookup counters (single row)
            CREATE TABLE IF NOT EXISTS cache_counters (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                hits INTEGER NOT NULL DEFAULT 0,
                misses INTEGER NOT NULL DEFAULT 0
            );

            INSERT OR IGNORE INTO cache_counters (id, hits, misses) VALUES (1, 0, 0);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn.lock().map_err(|_| CacheError::LockPoisoned)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Look up a live entry.
    ///
    /// A hit bumps the entry's hit count and recency and returns an owned
    /// copy. Expired entries are removed and reported as a miss, and so are
    /// entries whose rows no longer decode.
    pub fn lookup(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<RecognitionResult>, CacheError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let key = fingerprint.to_hex();
        let now = Utc::now();

        let row = match tx
            .query_row(
                "SELECT backend_used, model_name, status, latency_ms, element_count,
                        created_at, expires_at
                 FROM cache_entries WHERE fingerprint = ?1",
                params![key],
                |row| {
                    Ok(EntryRow {
                        backend_used: row.get(0)?,
                        model_name: row.get(1)?,
                        status: row.get(2)?,
                        latency_ms: row.get(3)?,
                        element_count: row.get(4)?,
                        created_at: row.get(5)?,
                        expires_at: row.get(6)?,
                    })
                },
            )
            .optional()
        {
            Ok(row) => row,
            Err(e) if is_undecodable(&e) => {
                warn!("Purging corrupt cache entry {}: {}", fingerprint.short(), e);
                delete_entry(&tx, &key)?;
                record_miss(&tx)?;
                tx.commit()?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let row = match row {
            Some(row) => row,
            None => {
                record_miss(&tx)?;
                tx.commit()?;
                debug!("Cache miss: {}", fingerprint.short());
                return Ok(None);
            }
        };

        if row.expires_at <= now.timestamp_millis() {
            delete_entry(&tx, &key)?;
            record_miss(&tx)?;
            tx.commit()?;
            debug!("Cache entry expired: {}", fingerprint.short());
            return Ok(None);
        }

        let result = match load_elements(&tx, &key)
            .and_then(|elements| decode_result(*fingerprint, row, elements))
        {
            Ok(result) => result,
            Err(e) => {
                warn!("Purging corrupt cache entry {}: {}", fingerprint.short(), e);
                delete_entry(&tx, &key)?;
                record_miss(&tx)?;
                tx.commit()?;
                return Ok(None);
            }
        };

        let seq = next_access_seq(&tx)?;
        tx.execute(
            "UPDATE cache_entries
             SET hit_count = hit_count + 1, last_accessed_at = ?1, access_seq = ?2
             WHERE fingerprint = ?3",
            params![now.timestamp_millis(), seq, key],
        )?;
        tx.execute("UPDATE cache_counters SET hits = hits + 1 WHERE id = 1", [])?;
        tx.commit()?;

        debug!(
            "Cache hit: {} ({} elements)",
            fingerprint.short(),
            result.elements.len()
        );
        Ok(Some(result))
    }

    /// Insert or replace the entry for a fingerprint.
    ///
    /// The stored expiry is `created_at + ttl`. If the store then holds more
    /// than `max_entries`, the least recently accessed entries are evicted,
    /// oldest first on ties.
    pub fn put(
        &self,
        fingerprint: &ContentFingerprint,
        result: &RecognitionResult,
    ) -> Result<(), CacheError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let key = fingerprint.to_hex();

        let created_at = result.created_at.timestamp_millis();
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = created_at.saturating_add(ttl_ms);
        let now = Utc::now().timestamp_millis();

        delete_entry(&tx, &key)?;
        let seq = next_access_seq(&tx)?;

        tx.execute(
            "INSERT INTO cache_entries (
                fingerprint, backend_used, model_name, status, latency_ms, element_count,
                created_at, expires_at, hit_count, last_accessed_at, access_seq
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)",
            params![
                key,
                result.backend_used.as_str(),
                result.model_name,
                result.status.as_str(),
                result.latency_ms as i64,
                result.elements.len() as i64,
                created_at,
                expires_at,
                now,
                seq
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO ui_elements (
                    fingerprint, position, element_id, element_type, text_content,
                    x1, y1, x2, y2, confidence, actionable, parent_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;

            for (position, element) in result.elements.iter().enumerate() {
                stmt.execute(params![
                    key,
                    position as i64,
                    element.id,
                    element.element_type.as_str(),
                    element.text,
                    element.bbox.x1,
                    element.bbox.y1,
                    element.bbox.x2,
                    element.bbox.y2,
                    element.confidence as f64,
                    element.actionable,
                    element.parent_id
                ])?;
            }
        }

        let evicted = evict_over_capacity(&tx, self.max_entries)?;
        tx.commit()?;

        if evicted > 0 {
            debug!("Evicted {} LRU cache entries", evicted);
        }
        debug!(
            "Cached result: {}, elements={}",
            fingerprint.short(),
            result.elements.len()
        );
        Ok(())
    }

    /// Delete every entry whose expiry has passed, returning how many
    pub fn evict_expired(&self) -> Result<usize, CacheError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![Utc::now().timestamp_millis()],
        )?;

        if deleted > 0 {
            debug!("Cleaned up {} expired cache entries", deleted);
        }
        Ok(deleted)
    }

    /// Remove everything and reset the counters, returning the entry count
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut conn = self.lock()?;
        let removed = {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM cache_entries", [])?;
            tx.execute("DELETE FROM ui_elements", [])?;
            tx.execute(
                "UPDATE cache_counters SET hits = 0, misses = 0 WHERE id = 1",
                [],
            )?;
            tx.commit()?;
            removed
        };

        // Reclaim space
        conn.execute_batch("VACUUM")?;
        info!("Cache cleared ({} entries)", removed);
        Ok(removed)
    }

    /// Get cache statistics
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let conn = self.lock()?;

        let entries: i64 =
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;

        let (hits, misses): (i64, i64) = conn.query_row(
            "SELECT hits, misses FROM cache_counters WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let average_latency_ms: Option<f64> = conn.query_row(
            "SELECT AVG(latency_ms) FROM cache_entries",
            [],
            |row| row.get(0),
        )?;

        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        let lookups = hits + misses;
        Ok(CacheStats {
            entries: entries as usize,
            total_hits: hits as u64,
            total_misses: misses as u64,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            average_latency_ms: average_latency_ms.unwrap_or(0.0),
            storage_bytes: (page_count * page_size).max(0) as u64,
            max_entries: self.max_entries,
        })
    }

    /// Hit count of a stored entry, live or not
    pub fn hit_count(&self, fingerprint: &ContentFingerprint) -> Result<Option<u32>, CacheError> {
        let conn = self.lock()?;
        let count: Option<i64> = conn
            .query_row(
                "SELECT hit_count FROM cache_entries WHERE fingerprint = ?1",
                params![fingerprint.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.map(|c| c as u32))
    }

    /// Whether an entry is stored for the fingerprint, without touching it
    pub fn contains(&self, fingerprint: &ContentFingerprint) -> Result<bool, CacheError> {
        Ok(self.hit_count(fingerprint)?.is_some())
    }
}

/// Row values that exist but do not convert to the expected column types
fn is_undecodable(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
    )
}

fn record_miss(tx: &Transaction<'_>) -> Result<(), CacheError> {
    tx.execute("UPDATE cache_counters SET misses = misses + 1 WHERE id = 1", [])?;
    Ok(())
}

fn delete_entry(tx: &Transaction<'_>, key: &str) -> Result<(), CacheError> {
    tx.execute("DELETE FROM cache_entries WHERE fingerprint = ?1", params![key])?;
    Ok(())
}

/// Logical clock for recency; strictly increasing across accesses
fn next_access_seq(tx: &Transaction<'_>) -> Result<i64, CacheError> {
    let seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(access_seq), 0) + 1 FROM cache_entries",
        [],
        |row| row.get(0),
    )?;
    Ok(seq)
}

fn evict_over_capacity(tx: &Transaction<'_>, max_entries: usize) -> Result<usize, CacheError> {
    let count: i64 = tx.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
    let excess = count - max_entries as i64;
    if excess <= 0 {
        return Ok(0);
    }

    let evicted = tx.execute(
        "DELETE FROM cache_entries
         WHERE fingerprint IN (
             SELECT fingerprint FROM cache_entries
             ORDER BY access_seq ASC, created_at ASC
             LIMIT ?1
         )",
        params![excess],
    )?;
    Ok(evicted)
}

fn load_elements(tx: &Transaction<'_>, key: &str) -> Result<Vec<UIElement>, CacheError> {
    let mut stmt = tx.prepare(
        "SELECT element_id, element_type, text_content, x1, y1, x2, y2,
                confidence, actionable, parent_id
         FROM ui_elements WHERE fingerprint = ?1
         ORDER BY position ASC",
    )?;

    let rows = stmt.query_map(params![key], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            [
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ],
            row.get::<_, f64>(7)?,
            row.get::<_, bool>(8)?,
            row.get::<_, Option<String>>(9)?,
        ))
    })?;

    let mut elements = Vec::new();
    for row in rows {
        let (id, kind, text, coords, confidence, actionable, parent_id) =
            row.map_err(|e| CacheError::Corrupt(format!("unreadable element row: {}", e)))?;

        let element_type = ElementType::parse(&kind)
            .ok_or_else(|| CacheError::Corrupt(format!("unknown element type '{}'", kind)))?;

        let bbox = to_bbox(coords)
            .ok_or_else(|| CacheError::Corrupt(format!("invalid bbox {:?}", coords)))?;

        if !(0.0..=1.0).contains(&confidence) {
            return Err(CacheError::Corrupt(format!(
                "confidence {} out of range",
                confidence
            )));
        }

        if actionable && text.trim().is_empty() {
            return Err(CacheError::Corrupt(format!(
                "actionable element '{}' without text",
                id
            )));
        }

        elements.push(UIElement {
            id,
            element_type,
            text,
            bbox,
            confidence: confidence as f32,
            actionable,
            parent_id,
        });
    }

    Ok(elements)
}

fn to_bbox(coords: [i64; 4]) -> Option<BoundingBox> {
    let [x1, y1, x2, y2] = coords;
    BoundingBox::new(
        u32::try_from(x1).ok()?,
        u32::try_from(y1).ok()?,
        u32::try_from(x2).ok()?,
        u32::try_from(y2).ok()?,
    )
}

fn decode_result(
    fingerprint: ContentFingerprint,
    row: EntryRow,
    elements: Vec<UIElement>,
) -> Result<RecognitionResult, CacheError> {
    let backend_used = BackendKind::parse(&row.backend_used)
        .ok_or_else(|| CacheError::Corrupt(format!("unknown backend '{}'", row.backend_used)))?;

    let status = RecognitionStatus::parse(&row.status)
        .ok_or_else(|| CacheError::Corrupt(format!("unknown status '{}'", row.status)))?;

    if row.element_count != elements.len() as i64 {
        return Err(CacheError::Corrupt(format!(
            "expected {} elements, found {}",
            row.element_count,
            elements.len()
        )));
    }

    let latency_ms = u64::try_from(row.latency_ms)
        .map_err(|_| CacheError::Corrupt(format!("negative latency {}", row.latency_ms)))?;

    Ok(RecognitionResult {
        fingerprint,
        elements,
        backend_used,
        model_name: row.model_name,
        latency_ms,
        status,
        created_at: from_millis(row.created_at)?,
        expires_at: from_millis(row.expires_at)?,
        from_cache: true,
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CacheError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CacheError::Corrupt(format!("timestamp {} out of range", ms)))
}
