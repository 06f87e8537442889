//! Durable cache tier: a keyed SQLite table of immutable entries.
//!
//! Rows are written once per fingerprint and only ever deleted (TTL expiry,
//! corruption, explicit invalidation, LRU eviction). `last_access` is
//! bumped on every read so eviction can drop oldest-access first, then
//! oldest-write — deterministic regardless of insertion order.

use super::{CacheEntry, CacheKind};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    fingerprint TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload_text TEXT NOT NULL,
    model_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    bytes INTEGER NOT NULL,
    last_access TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_last_access
    ON cache_entries(last_access, created_at);
"#;

/// What a read attempt found.
pub(super) enum Lookup {
    Hit(CacheEntry),
    Miss,
    /// Row existed but would not read back; it has been deleted.
    Corrupt,
}

pub(super) struct DurableStore {
    conn: Mutex<Connection>,
}

impl DurableStore {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read an entry and bump its access time.
    pub fn get(&self, fingerprint: &str) -> Result<Lookup, EngineError> {
        let conn = self.conn.lock().expect("cache store lock poisoned");
        let row = conn
            .query_row(
                "SELECT kind, payload_text, model_id, created_at, bytes
                 FROM cache_entries WHERE fingerprint = ?1",
                params![fingerprint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((kind_raw, payload_text, model_id, created_raw, bytes)) = row else {
            return Ok(Lookup::Miss);
        };

        let kind = CacheKind::parse(&kind_raw);
        let created_at = DateTime::parse_from_rfc3339(&created_raw)
            .map(|t| t.with_timezone(&Utc))
            .ok();
        let (Some(kind), Some(created_at)) = (kind, created_at) else {
            warn!(fingerprint, "corrupt cache row; evicting");
            conn.execute(
                "DELETE FROM cache_entries WHERE fingerprint = ?1",
                params![fingerprint],
            )?;
            return Ok(Lookup::Corrupt);
        };

        conn.execute(
            "UPDATE cache_entries SET last_access = ?1 WHERE fingerprint = ?2",
            params![Utc::now().to_rfc3339(), fingerprint],
        )?;

        Ok(Lookup::Hit(CacheEntry {
            fingerprint: fingerprint.to_string(),
            kind,
            payload_text,
            model_id,
            created_at,
            bytes: bytes.max(0) as u64,
        }))
    }

    /// Existence check that leaves `last_access` untouched.
    pub fn contains(&self, fingerprint: &str) -> Result<Option<DateTime<Utc>>, EngineError> {
        let conn = self.conn.lock().expect("cache store lock poisoned");
        let created: Option<String> = conn
            .query_row(
                "SELECT created_at FROM cache_entries WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(created.and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .ok()
        }))
    }

    /// Insert an entry; an existing row for the fingerprint wins.
    pub fn insert(&self, entry: &CacheEntry) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("cache store lock poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO cache_entries
             (fingerprint, kind, payload_text, model_id, created_at, bytes, last_access)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5)",
            params![
                entry.fingerprint,
                entry.kind.as_str(),
                entry.payload_text,
                entry.model_id,
                entry.created_at.to_rfc3339(),
                entry.bytes as i64,
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, fingerprint: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("cache store lock poisoned");
        conn.execute(
            "DELETE FROM cache_entries WHERE fingerprint = ?1",
            params![fingerprint],
        )?;
        Ok(())
    }

    pub fn total_bytes(&self) -> Result<u64, EngineError> {
        let conn = self.conn.lock().expect("cache store lock poisoned");
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(bytes), 0) FROM cache_entries",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    /// Drop entries — oldest access first, then oldest write — until the
    /// stored bytes fit `target_bytes`. Returns how many rows went.
    pub fn evict_lru_until(&self, target_bytes: u64) -> Result<usize, EngineError> {
        let conn = self.conn.lock().expect("cache store lock poisoned");
        let mut total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(bytes), 0) FROM cache_entries",
            [],
            |row| row.get(0),
        )?;
        let mut evicted = 0usize;

        while total.max(0) as u64 > target_bytes {
            let victim: Option<(String, i64)> = conn
                .query_row(
                    "SELECT fingerprint, bytes FROM cache_entries
                     ORDER BY last_access ASC, created_at ASC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((fingerprint, bytes)) = victim else {
                break;
            };
            conn.execute(
                "DELETE FROM cache_entries WHERE fingerprint = ?1",
                params![fingerprint],
            )?;
            total -= bytes;
            evicted += 1;
        }
        Ok(evicted)
    }
}
