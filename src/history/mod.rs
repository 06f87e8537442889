//! Durable history of processing runs.
//!
//! Every batch job creates one `history_records` row and appends one
//! `history_pages` row per completed page. Page text is mirrored into an
//! FTS5 table so the shell's search box can rank across
//! `original_text | ocr_text | ai_processed_text` with `bm25()` and show
//! `snippet()` highlights.
//!
//! ## Status machine
//!
//! `processing → completed | failed | cancelled`, enforced in SQL: the
//! terminal update only matches rows still in `processing`, so nothing
//! re-enters `processing` and double-finishes are no-ops. Records left in
//! `processing` by a crash are forced to `cancelled` at startup by
//! [`HistoryStore::recover_stale`].

use crate::error::EngineError;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS history_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_path TEXT NOT NULL,
    document_name TEXT NOT NULL,
    page_count INTEGER NOT NULL,
    ai_model TEXT NOT NULL,
    cost INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS history_pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL,
    page_number INTEGER NOT NULL,
    original_text TEXT NOT NULL DEFAULT '',
    ocr_text TEXT NOT NULL DEFAULT '',
    ai_processed_text TEXT NOT NULL DEFAULT '',
    processing_time_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (record_id) REFERENCES history_records(id),
    UNIQUE(record_id, page_number)
);

CREATE INDEX IF NOT EXISTS idx_history_records_started
    ON history_records(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_history_records_status
    ON history_records(status);
CREATE INDEX IF NOT EXISTS idx_history_records_path
    ON history_records(document_path);
CREATE INDEX IF NOT EXISTS idx_history_pages_record
    ON history_pages(record_id);

CREATE VIRTUAL TABLE IF NOT EXISTS history_pages_fts USING fts5(
    original_text,
    ocr_text,
    ai_processed_text
);
"#;

/// Terminal and non-terminal states of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Processing => "processing",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
            RecordStatus::Cancelled => "cancelled",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "completed" => RecordStatus::Completed,
            "failed" => RecordStatus::Failed,
            "cancelled" => RecordStatus::Cancelled,
            _ => RecordStatus::Processing,
        }
    }
}

/// One processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub document_path: String,
    pub document_name: String,
    pub page_count: u32,
    pub ai_model: String,
    /// Total model tokens consumed by the run.
    pub cost: u64,
    pub status: RecordStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One page artifact inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub record_id: i64,
    pub page_number: u32,
    pub original_text: String,
    pub ocr_text: String,
    pub ai_processed_text: String,
    pub processing_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Metadata for a new run.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub document_path: String,
    pub document_name: String,
    pub page_count: u32,
    pub ai_model: String,
}

/// One full-text search hit with a highlighted snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMatch {
    pub record_id: i64,
    pub page_number: u32,
    pub document_name: String,
    pub document_path: String,
    pub snippet: String,
    pub score: f64,
}

/// Durable, searchable run history. Writes serialize on the connection
/// mutex; reads share it.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
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

    /// Start a new run in `processing`.
    pub fn create_record(&self, meta: &NewRecord) -> Result<i64, EngineError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        conn.execute(
            "INSERT INTO history_records
             (document_path, document_name, page_count, ai_model, cost, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 0, 'processing', ?5)",
            params![
                meta.document_path,
                meta.document_name,
                meta.page_count,
                meta.ai_model,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Append or overwrite one page of a run; the later write wins.
    pub fn append_page(&self, page: &HistoryPage) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        conn.execute(
            "INSERT INTO history_pages
             (record_id, page_number, original_text, ocr_text, ai_processed_text,
              processing_time_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(record_id, page_number) DO UPDATE SET
                 original_text = ?3,
                 ocr_text = ?4,
                 ai_processed_text = ?5,
                 processing_time_ms = ?6,
                 created_at = ?7",
            params![
                page.record_id,
                page.page_number,
                page.original_text,
                page.ocr_text,
                page.ai_processed_text,
                page.processing_time_ms as i64,
                page.created_at.to_rfc3339(),
            ],
        )?;

        let row_id: i64 = conn.query_row(
            "SELECT id FROM history_pages WHERE record_id = ?1 AND page_number = ?2",
            params![page.record_id, page.page_number],
            |row| row.get(0),
        )?;
        conn.execute(
            "DELETE FROM history_pages_fts WHERE rowid = ?1",
            params![row_id],
        )?;
        conn.execute(
            "INSERT INTO history_pages_fts (rowid, original_text, ocr_text, ai_processed_text)
             VALUES (?1, ?2, ?3, ?4)",
            params![row_id, page.original_text, page.ocr_text, page.ai_processed_text],
        )?;
        Ok(())
    }

    /// Terminal transition. Only records still in `processing` move; a
    /// second finish is a no-op.
    pub fn finish_record(
        &self,
        id: i64,
        status: RecordStatus,
        cost: u64,
    ) -> Result<(), EngineError> {
        if status == RecordStatus::Processing {
            return Err(EngineError::InvalidArgument(
                "finish_record requires a terminal status".into(),
            ));
        }
        let conn = self.conn.lock().expect("history lock poisoned");
        let changed = conn.execute(
            "UPDATE history_records
             SET status = ?1, cost = ?2, finished_at = ?3
             WHERE id = ?4 AND status = 'processing'",
            params![status.as_str(), cost as i64, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            warn!(record_id = id, "finish_record on non-processing record ignored");
        }
        Ok(())
    }

    pub fn get_record(&self, id: i64) -> Result<Option<HistoryRecord>, EngineError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        let record = conn
            .query_row(
                "SELECT id, document_path, document_name, page_count, ai_model, cost,
                        status, started_at, finished_at
                 FROM history_records WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, EngineError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, document_path, document_name, page_count, ai_model, cost,
                    status, started_at, finished_at
             FROM history_records
             ORDER BY started_at DESC, id DESC
             LIMIT ?1",
        )?;
        let records = stmt
            .query_map(params![limit.max(1) as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn get_pages(&self, record_id: i64) -> Result<Vec<HistoryPage>, EngineError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT record_id, page_number, original_text, ocr_text, ai_processed_text,
                    processing_time_ms, created_at
             FROM history_pages
             WHERE record_id = ?1
             ORDER BY page_number",
        )?;
        let pages = stmt
            .query_map(params![record_id], row_to_page)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    /// Merge a document's pages across all its runs, newest write per page
    /// number.
    pub fn get_all_pages(&self, document_path: &str) -> Result<Vec<HistoryPage>, EngineError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT p.record_id, p.page_number, p.original_text, p.ocr_text,
                    p.ai_processed_text, p.processing_time_ms, p.created_at
             FROM history_pages p
             JOIN history_records r ON p.record_id = r.id
             WHERE r.document_path = ?1
             ORDER BY p.created_at DESC, p.id DESC",
        )?;
        let all = stmt
            .query_map(params![document_path], row_to_page)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = std::collections::HashSet::new();
        let mut merged: Vec<HistoryPage> = all
            .into_iter()
            .filter(|page| seen.insert(page.page_number))
            .collect();
        merged.sort_by_key(|page| page.page_number);
        Ok(merged)
    }

    /// Rank pages against a query; snippets highlight matches with `[…]`
    /// markers.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchMatch>, EngineError> {
        let fts_query = fts_quote(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("history lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT p.record_id, p.page_number, r.document_name, r.document_path,
                    snippet(history_pages_fts, -1, '[', ']', '…', 12) AS snip,
                    bm25(history_pages_fts) AS score
             FROM history_pages_fts
             JOIN history_pages p ON history_pages_fts.rowid = p.id
             JOIN history_records r ON p.record_id = r.id
             WHERE history_pages_fts MATCH ?1
             ORDER BY score
             LIMIT ?2",
        )?;
        let matches = stmt
            .query_map(params![fts_query, limit.max(1) as i64], |row| {
                Ok(SearchMatch {
                    record_id: row.get(0)?,
                    page_number: row.get::<_, i64>(1)? as u32,
                    document_name: row.get(2)?,
                    document_path: row.get(3)?,
                    snippet: row.get(4)?,
                    score: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(matches)
    }

    /// Delete a record and its pages (and their search rows).
    pub fn delete_record(&self, id: i64) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        conn.execute(
            "DELETE FROM history_pages_fts WHERE rowid IN
             (SELECT id FROM history_pages WHERE record_id = ?1)",
            params![id],
        )?;
        conn.execute(
            "DELETE FROM history_pages WHERE record_id = ?1",
            params![id],
        )?;
        conn.execute("DELETE FROM history_records WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Delete records older than the retention window. Returns how many
    /// records went.
    pub fn retention_sweep(&self, retention_days: u32) -> Result<usize, EngineError> {
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();
        let ids: Vec<i64> = {
            let conn = self.conn.lock().expect("history lock poisoned");
            let mut stmt =
                conn.prepare("SELECT id FROM history_records WHERE started_at < ?1")?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        for &id in &ids {
            self.delete_record(id)?;
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "retention sweep removed old records");
        }
        Ok(ids.len())
    }

    /// Force crashed runs to `cancelled`. A record still in `processing`
    /// whose start is older than `stale_after` cannot be live — jobs
    /// finalize their record on every exit path.
    pub fn recover_stale(&self, stale_after: std::time::Duration) -> Result<usize, EngineError> {
        let cutoff = (Utc::now()
            - Duration::from_std(stale_after).unwrap_or_else(|_| Duration::hours(1)))
        .to_rfc3339();
        let conn = self.conn.lock().expect("history lock poisoned");
        let changed = conn.execute(
            "UPDATE history_records
             SET status = 'cancelled', finished_at = ?1
             WHERE status = 'processing' AND started_at < ?2",
            params![Utc::now().to_rfc3339(), cutoff],
        )?;
        if changed > 0 {
            info!(count = changed, "recovered stale processing records");
        }
        Ok(changed)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let started_raw: String = row.get(7)?;
    let finished_raw: Option<String> = row.get(8)?;
    Ok(HistoryRecord {
        id: row.get(0)?,
        document_path: row.get(1)?,
        document_name: row.get(2)?,
        page_count: row.get::<_, i64>(3)? as u32,
        ai_model: row.get(4)?,
        cost: row.get::<_, i64>(5)?.max(0) as u64,
        status: RecordStatus::parse(&row.get::<_, String>(6)?),
        started_at: parse_time(&started_raw),
        finished_at: finished_raw.as_deref().map(parse_time),
    })
}

fn row_to_page(row: &Row<'_>) -> rusqlite::Result<HistoryPage> {
    let created_raw: String = row.get(6)?;
    Ok(HistoryPage {
        record_id: row.get(0)?,
        page_number: row.get::<_, i64>(1)? as u32,
        original_text: row.get(2)?,
        ocr_text: row.get(3)?,
        ai_processed_text: row.get(4)?,
        processing_time_ms: row.get::<_, i64>(5)?.max(0) as u64,
        created_at: parse_time(&created_raw),
    })
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Quote user input for FTS5: each token becomes a quoted phrase term, so
/// operators and punctuation in the query cannot break the MATCH syntax.
fn fts_quote(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> HistoryStore {
        HistoryStore::open_in_memory().unwrap()
    }

    fn meta() -> NewRecord {
        NewRecord {
            document_path: "/docs/report.pdf".into(),
            document_name: "report".into(),
            page_count: 3,
            ai_model: "gpt-4.1-mini".into(),
        }
    }

    fn page(record_id: i64, number: u32, ocr: &str) -> HistoryPage {
        HistoryPage {
            record_id,
            page_number: number,
            original_text: String::new(),
            ocr_text: ocr.into(),
            ai_processed_text: String::new(),
            processing_time_ms: 120,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn record_lifecycle() {
        let store = store();
        let id = store.create_record(&meta()).unwrap();
        assert_eq!(
            store.get_record(id).unwrap().unwrap().status,
            RecordStatus::Processing
        );

        store.finish_record(id, RecordStatus::Completed, 321).unwrap();
        let record = store.get_record(id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.cost, 321);
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn finished_record_cannot_reenter_processing() {
        let store = store();
        let id = store.create_record(&meta()).unwrap();
        store.finish_record(id, RecordStatus::Cancelled, 0).unwrap();
        // A late "completed" from a straggling worker must not win.
        store.finish_record(id, RecordStatus::Completed, 99).unwrap();
        let record = store.get_record(id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Cancelled);
        assert_eq!(record.cost, 0);
    }

    #[test]
    fn finish_rejects_processing_status() {
        let store = store();
        let id = store.create_record(&meta()).unwrap();
        assert!(store
            .finish_record(id, RecordStatus::Processing, 0)
            .is_err());
    }

    #[test]
    fn later_page_write_wins() {
        let store = store();
        let id = store.create_record(&meta()).unwrap();
        store.append_page(&page(id, 1, "first pass")).unwrap();
        store.append_page(&page(id, 1, "second pass")).unwrap();
        let pages = store.get_pages(id).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].ocr_text, "second pass");
    }

    #[test]
    fn pages_come_back_in_page_order() {
        let store = store();
        let id = store.create_record(&meta()).unwrap();
        for n in [3, 1, 2] {
            store.append_page(&page(id, n, "text")).unwrap();
        }
        let numbers: Vec<u32> = store
            .get_pages(id)
            .unwrap()
            .iter()
            .map(|p| p.page_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn all_pages_merges_newest_per_page() {
        let store = store();
        let first = store.create_record(&meta()).unwrap();
        store.append_page(&page(first, 1, "old p1")).unwrap();
        store.append_page(&page(first, 2, "only p2")).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.create_record(&meta()).unwrap();
        store.append_page(&page(second, 1, "new p1")).unwrap();

        let merged = store.get_all_pages("/docs/report.pdf").unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].ocr_text, "new p1");
        assert_eq!(merged[1].ocr_text, "only p2");
    }

    #[test]
    fn search_ranks_and_highlights() {
        let store = store();
        let id = store.create_record(&meta()).unwrap();
        store
            .append_page(&page(id, 1, "the quarterly revenue grew by twelve percent"))
            .unwrap();
        store.append_page(&page(id, 2, "unrelated appendix")).unwrap();

        let hits = store.search("quarterly revenue", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_number, 1);
        assert!(hits[0].snippet.contains("[quarterly]"));
        assert_eq!(hits[0].document_name, "report");
    }

    #[test]
    fn search_survives_fts_operators_in_query() {
        let store = store();
        let id = store.create_record(&meta()).unwrap();
        store.append_page(&page(id, 1, "a AND b OR c")).unwrap();
        // Raw operators and quotes must not become syntax errors.
        assert!(store.search("\"AND (", 5).is_ok());
        assert!(store.search("", 5).unwrap().is_empty());
    }

    #[test]
    fn deleted_record_disappears_from_search() {
        let store = store();
        let id = store.create_record(&meta()).unwrap();
        store.append_page(&page(id, 1, "unique marker zebra")).unwrap();
        assert_eq!(store.search("zebra", 5).unwrap().len(), 1);

        store.delete_record(id).unwrap();
        assert!(store.get_record(id).unwrap().is_none());
        assert!(store.get_pages(id).unwrap().is_empty());
        assert!(store.search("zebra", 5).unwrap().is_empty());
    }

    #[test]
    fn updated_page_is_reindexed() {
        let store = store();
        let id = store.create_record(&meta()).unwrap();
        store.append_page(&page(id, 1, "alpha")).unwrap();
        store.append_page(&page(id, 1, "omega")).unwrap();
        assert!(store.search("alpha", 5).unwrap().is_empty());
        assert_eq!(store.search("omega", 5).unwrap().len(), 1);
    }

    #[test]
    fn recover_stale_cancels_only_old_processing() {
        let store = store();
        let stale = store.create_record(&meta()).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE history_records SET started_at = ?1 WHERE id = ?2",
                params![(Utc::now() - Duration::hours(2)).to_rfc3339(), stale],
            )
            .unwrap();
        }
        let live = store.create_record(&meta()).unwrap();

        let recovered = store
            .recover_stale(std::time::Duration::from_secs(3600))
            .unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(
            store.get_record(stale).unwrap().unwrap().status,
            RecordStatus::Cancelled
        );
        assert_eq!(
            store.get_record(live).unwrap().unwrap().status,
            RecordStatus::Processing
        );
    }

    #[test]
    fn retention_sweep_removes_old_records() {
        let store = store();
        let old = store.create_record(&meta()).unwrap();
        store.append_page(&page(old, 1, "ancient text")).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE history_records SET started_at = ?1 WHERE id = ?2",
                params![(Utc::now() - Duration::days(400)).to_rfc3339(), old],
            )
            .unwrap();
        }
        let recent = store.create_record(&meta()).unwrap();

        let removed = store.retention_sweep(180).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_record(old).unwrap().is_none());
        assert!(store.get_record(recent).unwrap().is_some());
        assert!(store.search("ancient", 5).unwrap().is_empty());
    }
}
