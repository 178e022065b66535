//! Append-only Event Log.
//!
//! Persists closed incidents as [`EventRecord`]s to a local SQLite database
//! and serves lazy, filtered queries to the dashboard.
//!
//! # Storage layout
//!
//! A single table `event_records` is created (if it does not already exist):
//!
//! | column           | type    | description                                   |
//! |------------------|---------|-----------------------------------------------|
//! | seq              | INTEGER | monotonic insertion sequence (primary key)    |
//! | incident_id      | TEXT    | UUID v4, unique: an incident is logged once   |
//! | kind             | TEXT    | `motion`, `gas`, `known_visitor`, …           |
//! | identity         | TEXT    | matched identity (NULL unless known visitor)  |
//! | confidence       | REAL    | confidence of the matched identity            |
//! | opened_at        | TEXT    | RFC-3339 UTC, fixed microsecond precision     |
//! | closed_at        | TEXT    | RFC-3339 UTC, fixed microsecond precision     |
//! | artifact_refs    | TEXT    | JSON array of artifact paths                  |
//! | peak_gas_level   | REAL    | highest gas reading (gas incidents only)      |
//! | capture_failures | INTEGER | failed capture requests                       |
//! | detail           | TEXT    | free-form detail (system faults)              |
//!
//! `BEFORE UPDATE` / `BEFORE DELETE` triggers abort any attempt to rewrite
//! history.  A read-only `events` view exposes the legacy dashboard columns
//! `(id, timestamp, event_type, file_path, person_name)`.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use patrol_memory::event_log::{EventFilter, EventLog, SqliteEventLog};
//! use patrol_types::EventRecord;
//!
//! let mut log = SqliteEventLog::open_in_memory().unwrap();
//! log.append(&EventRecord::system_fault("pir_front unreadable", Utc::now())).unwrap();
//!
//! let records: Vec<_> = log.query(&EventFilter::default()).unwrap().collect();
//! assert_eq!(records.len(), 1);
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use patrol_types::{EventRecord, IncidentKind, PatrolError};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, Row, params, params_from_iter};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from event log operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt event record at seq {seq}: {details}")]
    Corrupt { seq: i64, details: String },
    #[error("Artifact list encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Cannot create database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<StorageError> for PatrolError {
    fn from(e: StorageError) -> Self {
        PatrolError::Storage(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventFilter
// ─────────────────────────────────────────────────────────────────────────────

/// Selection criteria for [`EventLog::query`].  The default selects every
/// record, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    /// Inclusive lower bound on `closed_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `closed_at`.
    pub until: Option<DateTime<Utc>>,
    /// Only these kinds; empty means all kinds.
    pub kinds: Vec<IncidentKind>,
    pub limit: Option<usize>,
    /// Newest first instead of insertion order.
    pub newest_first: bool,
}

impl EventFilter {
    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.until = Some(at);
        self
    }

    pub fn kind(mut self, kind: IncidentKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventLog trait
// ─────────────────────────────────────────────────────────────────────────────

/// Lazily evaluated query result.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<EventRecord, StorageError>> + 'a>;

/// Durable, append-only store of [`EventRecord`]s.
///
/// There is deliberately no update or delete operation.
pub trait EventLog: Send {
    /// Append `record`, returning its insertion sequence number.
    ///
    /// # Errors
    ///
    /// [`StorageError`] when the write fails, including when the incident was
    /// already logged.
    fn append(&mut self, record: &EventRecord) -> Result<u64, StorageError>;

    /// Records matching `filter`, fetched page by page as the stream is
    /// consumed.
    fn query<'a>(&'a self, filter: &EventFilter) -> Result<RecordStream<'a>, StorageError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteEventLog
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_PAGE_SIZE: usize = 64;

/// SQLite-backed [`EventLog`].
pub struct SqliteEventLog {
    conn: Connection,
    page_size: usize,
}

impl SqliteEventLog {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let log = Self::with_connection(conn);
        log.init_schema()?;
        Ok(log)
    }

    /// Open an existing database for reading only (dashboard / CLI use).
    /// [`EventLog::append`] on such a handle fails.
    pub fn open_read_only(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self::with_connection(conn))
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let log = Self::with_connection(conn);
        log.init_schema()?;
        Ok(log)
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Rows fetched per round-trip while a query stream is consumed.
    pub fn with_page_size(mut self, rows: usize) -> Self {
        self.page_size = rows.max(1);
        self
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS event_records (
                seq              INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id      TEXT NOT NULL UNIQUE,
                kind             TEXT NOT NULL,
                identity         TEXT,
                confidence       REAL,
                opened_at        TEXT NOT NULL,
                closed_at        TEXT NOT NULL,
                artifact_refs    TEXT NOT NULL,
                peak_gas_level   REAL,
                capture_failures INTEGER NOT NULL DEFAULT 0,
                detail           TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_event_records_closed_at
                ON event_records (closed_at);
            CREATE TRIGGER IF NOT EXISTS event_records_no_update
                BEFORE UPDATE ON event_records
                BEGIN SELECT RAISE(ABORT, 'event_records is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS event_records_no_delete
                BEFORE DELETE ON event_records
                BEGIN SELECT RAISE(ABORT, 'event_records is append-only'); END;
            CREATE VIEW IF NOT EXISTS events AS
                SELECT seq                                   AS id,
                       strftime('%Y-%m-%d %H:%M:%S', closed_at) AS timestamp,
                       kind                                  AS event_type,
                       json_extract(artifact_refs, '$[0]')   AS file_path,
                       identity                              AS person_name
                FROM event_records;",
        )?;
        Ok(())
    }

    /// Total number of stored records.
    pub fn len(&self) -> Result<u64, StorageError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM event_records", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    fn fetch_page(
        &self,
        filter: &EventFilter,
        cursor: Option<i64>,
        page: usize,
    ) -> Result<Vec<(i64, EventRecord)>, StorageError> {
        let mut sql = String::from(
            "SELECT seq, incident_id, kind, identity, confidence, opened_at, closed_at,
                    artifact_refs, peak_gas_level, capture_failures, detail
             FROM event_records WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(seq) = cursor {
            sql.push_str(if filter.newest_first {
                " AND seq < ?"
            } else {
                " AND seq > ?"
            });
            values.push(Value::Integer(seq));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND closed_at >= ?");
            values.push(Value::Text(encode_ts(since)));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND closed_at < ?");
            values.push(Value::Text(encode_ts(until)));
        }
        if !filter.kinds.is_empty() {
            let marks = vec!["?"; filter.kinds.len()].join(", ");
            sql.push_str(&format!(" AND kind IN ({marks})"));
            values.extend(filter.kinds.iter().map(|k| Value::Text(k.as_str().to_string())));
        }
        sql.push_str(if filter.newest_first {
            " ORDER BY seq DESC LIMIT ?"
        } else {
            " ORDER BY seq ASC LIMIT ?"
        });
        values.push(Value::Integer(page as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), RawRow::from_row)?;
        let mut out = Vec::with_capacity(page);
        for row in rows {
            let raw = row?;
            let seq = raw.seq;
            out.push((seq, raw.decode()?));
        }
        Ok(out)
    }
}

impl EventLog for SqliteEventLog {
    fn append(&mut self, record: &EventRecord) -> Result<u64, StorageError> {
        let artifacts: Vec<String> = record
            .artifact_refs
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        self.conn.execute(
            "INSERT INTO event_records
                 (incident_id, kind, identity, confidence, opened_at, closed_at,
                  artifact_refs, peak_gas_level, capture_failures, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.incident_id.to_string(),
                record.kind.as_str(),
                record.identity,
                record.confidence.map(f64::from),
                encode_ts(record.opened_at),
                encode_ts(record.closed_at),
                serde_json::to_string(&artifacts)?,
                record.peak_gas_level.map(f64::from),
                record.capture_failures,
                record.detail,
            ],
        )?;
        let seq = self.conn.last_insert_rowid() as u64;
        debug!(seq, incident = %record.incident_id, kind = %record.kind, "event record appended");
        Ok(seq)
    }

    fn query<'a>(&'a self, filter: &EventFilter) -> Result<RecordStream<'a>, StorageError> {
        Ok(Box::new(RecordCursor {
            log: self,
            filter: filter.clone(),
            cursor: None,
            buffer: VecDeque::new(),
            remaining: filter.limit,
            done: false,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lazy cursor
// ─────────────────────────────────────────────────────────────────────────────

struct RecordCursor<'a> {
    log: &'a SqliteEventLog,
    filter: EventFilter,
    /// Sequence number of the last row handed out.
    cursor: Option<i64>,
    buffer: VecDeque<(i64, EventRecord)>,
    remaining: Option<usize>,
    done: bool,
}

impl Iterator for RecordCursor<'_> {
    type Item = Result<EventRecord, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.buffer.is_empty() && !self.done {
            let page = self
                .remaining
                .map_or(self.log.page_size, |r| r.min(self.log.page_size));
            match self.log.fetch_page(&self.filter, self.cursor, page) {
                Ok(rows) => {
                    self.done = rows.len() < page;
                    self.buffer.extend(rows);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let (seq, record) = self.buffer.pop_front()?;
        self.cursor = Some(seq);
        if let Some(r) = self.remaining.as_mut() {
            *r -= 1;
        }
        Some(Ok(record))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row decoding
// ─────────────────────────────────────────────────────────────────────────────

fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct RawRow {
    seq: i64,
    incident_id: String,
    kind: String,
    identity: Option<String>,
    confidence: Option<f64>,
    opened_at: String,
    closed_at: String,
    artifact_refs: String,
    peak_gas_level: Option<f64>,
    capture_failures: u32,
    detail: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            incident_id: row.get(1)?,
            kind: row.get(2)?,
            identity: row.get(3)?,
            confidence: row.get(4)?,
            opened_at: row.get(5)?,
            closed_at: row.get(6)?,
            artifact_refs: row.get(7)?,
            peak_gas_level: row.get(8)?,
            capture_failures: row.get(9)?,
            detail: row.get(10)?,
        })
    }

    fn decode(self) -> Result<EventRecord, StorageError> {
        let seq = self.seq;
        let corrupt = |details: String| StorageError::Corrupt { seq, details };
        let incident_id =
            Uuid::parse_str(&self.incident_id).map_err(|e| corrupt(e.to_string()))?;
        let kind: IncidentKind = self.kind.parse().map_err(|e: PatrolError| corrupt(e.to_string()))?;
        let opened_at = self
            .opened_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| corrupt(e.to_string()))?;
        let closed_at = self
            .closed_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| corrupt(e.to_string()))?;
        let artifacts: Vec<String> =
            serde_json::from_str(&self.artifact_refs).map_err(|e| corrupt(e.to_string()))?;
        Ok(EventRecord {
            incident_id,
            kind,
            identity: self.identity,
            confidence: self.confidence.map(|c| c as f32),
            opened_at,
            closed_at,
            artifact_refs: artifacts.into_iter().map(PathBuf::from).collect(),
            peak_gas_level: self.peak_gas_level.map(|g| g as f32),
            capture_failures: self.capture_failures,
            detail: self.detail,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn visitor(identity: Option<&str>, closed: i64) -> EventRecord {
        EventRecord {
            incident_id: Uuid::new_v4(),
            kind: if identity.is_some() {
                IncidentKind::KnownVisitor
            } else {
                IncidentKind::UnknownVisitor
            },
            identity: identity.map(str::to_string),
            confidence: identity.map(|_| 0.875),
            opened_at: t(closed - 15),
            closed_at: t(closed),
            artifact_refs: vec![
                PathBuf::from(format!("/events/snapshot_{closed}_0.jpg")),
                PathBuf::from(format!("/recordings/clip_{closed}_1.gif")),
            ],
            peak_gas_level: None,
            capture_failures: 0,
            detail: None,
        }
    }

    fn gas(closed: i64, peak: f32) -> EventRecord {
        EventRecord {
            incident_id: Uuid::new_v4(),
            kind: IncidentKind::Gas,
            identity: None,
            confidence: None,
            opened_at: t(closed - 60),
            closed_at: t(closed),
            artifact_refs: vec![],
            peak_gas_level: Some(peak),
            capture_failures: 0,
            detail: None,
        }
    }

    fn collect(log: &SqliteEventLog, filter: &EventFilter) -> Vec<EventRecord> {
        log.query(filter)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn append_and_read_back_all_fields() {
        let mut log = SqliteEventLog::open_in_memory().unwrap();
        let rec = visitor(Some("alice"), 100);
        let seq = log.append(&rec).unwrap();
        assert_eq!(seq, 1);

        let all = collect(&log, &EventFilter::default());
        assert_eq!(all, vec![rec]);
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut log = SqliteEventLog::open_in_memory().unwrap();
        let a = log.append(&visitor(None, 10)).unwrap();
        let b = log.append(&gas(5, 0.9)).unwrap();
        let c = log.append(&visitor(Some("bob"), 20)).unwrap();
        assert!(a < b && b < c);
        assert_eq!(log.len().unwrap(), 3);
    }

    #[test]
    fn same_incident_cannot_be_logged_twice() {
        let mut log = SqliteEventLog::open_in_memory().unwrap();
        let rec = visitor(None, 10);
        log.append(&rec).unwrap();
        assert!(matches!(log.append(&rec), Err(StorageError::Sqlite(_))));
        assert_eq!(log.len().unwrap(), 1);
    }

    #[test]
    fn update_and_delete_are_rejected() {
        let mut log = SqliteEventLog::open_in_memory().unwrap();
        log.append(&visitor(Some("alice"), 10)).unwrap();

        let upd = log
            .conn
            .execute("UPDATE event_records SET identity = 'mallory'", []);
        assert!(upd.is_err());
        let del = log.conn.execute("DELETE FROM event_records", []);
        assert!(del.is_err());

        let all = collect(&log, &EventFilter::default());
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].identity.as_deref(), Some("alice"));
    }

    #[test]
    fn filter_by_kind_and_time_range() {
        let mut log = SqliteEventLog::open_in_memory().unwrap();
        log.append(&visitor(None, 10)).unwrap();
        log.append(&gas(20, 0.7)).unwrap();
        log.append(&visitor(Some("bob"), 30)).unwrap();
        log.append(&gas(40, 0.95)).unwrap();

        let gas_only = collect(&log, &EventFilter::default().kind(IncidentKind::Gas));
        assert_eq!(gas_only.len(), 2);
        assert!(gas_only.iter().all(|r| r.kind == IncidentKind::Gas));

        let window = collect(&log, &EventFilter::default().since(t(20)).until(t(40)));
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].kind, IncidentKind::Gas);
        assert_eq!(window[1].identity.as_deref(), Some("bob"));

        let visitors = collect(
            &log,
            &EventFilter::default()
                .kind(IncidentKind::KnownVisitor)
                .kind(IncidentKind::UnknownVisitor),
        );
        assert_eq!(visitors.len(), 2);
    }

    #[test]
    fn limit_and_newest_first() {
        let mut log = SqliteEventLog::open_in_memory().unwrap();
        for i in 0..5 {
            log.append(&visitor(None, i * 10)).unwrap();
        }
        let latest = collect(&log, &EventFilter::default().newest_first().limit(2));
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].closed_at, t(40));
        assert_eq!(latest[1].closed_at, t(30));
    }

    #[test]
    fn query_pages_lazily_across_small_pages() {
        let mut log = SqliteEventLog::open_in_memory().unwrap().with_page_size(2);
        for i in 0..7 {
            log.append(&gas(i, 0.8)).unwrap();
        }
        let all = collect(&log, &EventFilter::default());
        assert_eq!(all.len(), 7);
        let times: Vec<_> = all.iter().map(|r| r.closed_at).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));

        // Taking a prefix only touches the first page.
        let mut stream = log.query(&EventFilter::default()).unwrap();
        assert!(stream.next().unwrap().is_ok());
    }

    #[test]
    fn legacy_events_view_matches_dashboard_columns() {
        let mut log = SqliteEventLog::open_in_memory().unwrap();
        log.append(&visitor(Some("alice"), 0)).unwrap();
        let (id, ts, kind, path, person): (i64, String, String, Option<String>, Option<String>) =
            log.conn
                .query_row(
                    "SELECT id, timestamp, event_type, file_path, person_name FROM events",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                )
                .unwrap();
        assert_eq!(id, 1);
        assert_eq!(ts, "2026-10-19 08:00:00");
        assert_eq!(kind, "known_visitor");
        assert_eq!(path.as_deref(), Some("/events/snapshot_0_0.jpg"));
        assert_eq!(person.as_deref(), Some("alice"));
    }

    #[test]
    fn persistent_file_survives_reopen_and_read_only_handle_cannot_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("patrol.db");
        {
            let mut log = SqliteEventLog::open(&path).unwrap();
            log.append(&gas(1, 0.9)).unwrap();
        }
        let mut ro = SqliteEventLog::open_read_only(&path).unwrap();
        assert_eq!(collect(&ro, &EventFilter::default()).len(), 1);
        assert!(ro.append(&gas(2, 0.9)).is_err());
    }

    #[test]
    fn storage_error_maps_into_patrol_error() {
        let err: PatrolError = StorageError::Corrupt {
            seq: 3,
            details: "bad uuid".to_string(),
        }
        .into();
        assert!(matches!(err, PatrolError::Storage(_)));
    }
}
