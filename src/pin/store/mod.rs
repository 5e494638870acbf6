//! SQLite storage: pin records, per-CID leases, and small local state.
//!
//! All access is synchronous (rusqlite). Async callers use `spawn_blocking`.
//!
//! The daemon and the management CLI open the same file from different
//! processes, so WAL mode and a busy timeout are always on. Mutual exclusion
//! per CID comes from the `pin_leases` table (see `lease.rs`), never from
//! in-process locks.
//!
//! Timestamps are RFC 3339 UTC with fixed nanosecond precision, so string
//! comparison in SQL orders them correctly.

mod lease;
mod legacy;
mod state;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::cid::Cid;
use crate::error::{PinError, Result};
use crate::pin::models::{PinRecord, PinStatus};

pub use lease::LeaseOwner;

/// Thread-safe wrapper around a SQLite connection.
/// All access is synchronous; use tokio::task::spawn_blocking from async code.
#[derive(Clone)]
pub struct PinStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA_DDL: &str = "
    CREATE TABLE IF NOT EXISTS pins (
        cid TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        pinned_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        status TEXT NOT NULL,
        last_error TEXT,
        downloaded INTEGER NOT NULL DEFAULT 0,
        requested_by TEXT,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pins_status_expires ON pins(status, expires_at);
    CREATE INDEX IF NOT EXISTS idx_pins_expires ON pins(expires_at);
    CREATE TABLE IF NOT EXISTS pin_leases (
        cid TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS local_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const RECORD_COLUMNS: &str =
    "cid, source, pinned_at, expires_at, status, last_error, downloaded, requested_by, updated_at";

impl PinStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Acquire the database connection, recovering from mutex poisoning.
    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.conn();
        // A database written by the earlier bot has a `pins` table keyed the
        // same way but with different columns; move it aside and import it.
        if legacy::detect(&conn) {
            let imported = legacy::migrate(&mut conn)?;
            tracing::info!(imported, "imported pins from legacy schema");
        }
        conn.execute_batch(SCHEMA_DDL)?;
        Ok(())
    }

    // ---- Records ----

    pub fn get(&self, cid: &Cid) -> Result<Option<PinRecord>> {
        let conn = self.conn();
        Self::get_with(&conn, cid)
    }

    fn get_with(conn: &Connection, cid: &Cid) -> Result<Option<PinRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM pins WHERE cid = ?1");
        let row = conn
            .query_row(&sql, params![cid.as_str()], |row| Ok(parse_record_row(row)))
            .optional()?;
        row.transpose()
    }

    /// Replace the whole record for `record.cid` in one statement.
    pub fn upsert(&self, record: &PinRecord) -> Result<()> {
        let conn = self.conn();
        Self::upsert_with(&conn, record)
    }

    fn upsert_with(conn: &Connection, record: &PinRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO pins (cid, source, pinned_at, expires_at, status, last_error,
                               downloaded, requested_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(cid) DO UPDATE SET
                source = excluded.source,
                pinned_at = excluded.pinned_at,
                expires_at = excluded.expires_at,
                status = excluded.status,
                last_error = excluded.last_error,
                downloaded = excluded.downloaded,
                requested_by = excluded.requested_by,
                updated_at = excluded.updated_at",
            params![
                record.cid.as_str(),
                record.source.as_str(),
                to_db_time(&record.pinned_at),
                to_db_time(&record.expires_at),
                record.status.as_str(),
                record.last_error,
                record.downloaded,
                record.requested_by,
                to_db_time(&record.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Records ordered by `expires_at` ascending, optionally filtered by status.
    pub fn list(&self, status: Option<PinStatus>) -> Result<Vec<PinRecord>> {
        let conn = self.conn();
        match status {
            Some(status) => query_records(
                &conn,
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM pins WHERE status = ?1
                     ORDER BY expires_at ASC, cid ASC"
                ),
                params![status.as_str()],
            ),
            None => query_records(
                &conn,
                &format!("SELECT {RECORD_COLUMNS} FROM pins ORDER BY expires_at ASC, cid ASC"),
                [],
            ),
        }
    }

    /// Active and expired records, soonest to expire first.
    pub fn list_live(&self) -> Result<Vec<PinRecord>> {
        let conn = self.conn();
        query_records(
            &conn,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM pins WHERE status != 'unpinned'
                 ORDER BY expires_at ASC, cid ASC"
            ),
            [],
        )
    }

    /// Live records whose window has closed at `now`, soonest first.
    pub fn list_due(&self, now: &DateTime<Utc>) -> Result<Vec<PinRecord>> {
        let conn = self.conn();
        query_records(
            &conn,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM pins
                 WHERE status IN ('active', 'expired') AND expires_at <= ?1
                 ORDER BY expires_at ASC, cid ASC"
            ),
            params![to_db_time(now)],
        )
    }

    /// Physically remove a record. Returns whether a row existed.
    pub fn delete(&self, cid: &Cid) -> Result<bool> {
        let conn = self.conn();
        let count = conn.execute("DELETE FROM pins WHERE cid = ?1", params![cid.as_str()])?;
        Ok(count > 0)
    }

    /// Delete terminal records last touched before `cutoff`.
    /// Returns the number of purged rows.
    pub fn purge_unpinned_before(&self, cutoff: &DateTime<Utc>) -> Result<u64> {
        let conn = self.conn();
        let count = conn.execute(
            "DELETE FROM pins WHERE status = 'unpinned' AND updated_at < ?1",
            params![to_db_time(cutoff)],
        )? as u64;
        Ok(count)
    }

    // ---- Metrics ----

    pub fn count_by_status(&self) -> Result<Vec<(PinStatus, u64)>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM pins GROUP BY status ORDER BY status")?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: u64 = row.get(1)?;
                Ok((status, count))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(status, count)| Ok((status.parse()?, count)))
            .collect()
    }
}

pub(crate) fn to_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<PinRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| Ok(parse_record_row(row)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().collect()
}

fn parse_record_row(row: &rusqlite::Row) -> Result<PinRecord> {
    let cid: String = row.get(0)?;
    let source: String = row.get(1)?;
    let pinned_at_str: String = row.get(2)?;
    let expires_at_str: String = row.get(3)?;
    let status: String = row.get(4)?;
    let last_error: Option<String> = row.get(5)?;
    let downloaded: bool = row.get(6)?;
    let requested_by: Option<String> = row.get(7)?;
    let updated_at_str: String = row.get(8)?;

    let time = |field: &str, value: &str| {
        parse_db_time(value).ok_or_else(|| {
            PinError::store(format!("invalid {field} timestamp '{value}' for {cid}"))
        })
    };

    Ok(PinRecord {
        source: source.parse()?,
        pinned_at: time("pinned_at", &pinned_at_str)?,
        expires_at: time("expires_at", &expires_at_str)?,
        status: status.parse()?,
        last_error,
        downloaded,
        requested_by,
        updated_at: time("updated_at", &updated_at_str)?,
        cid: Cid::from_trusted(cid),
    })
}
