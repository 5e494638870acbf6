//! Import of databases written by the earlier chat bot.
//!
//! That schema is `pins(cid, pin_time, expire_time, downloaded)` with naive
//! local-time timestamps in Python `isoformat()` or `str()` form. Rows are
//! imported as active chat pins; ones past their expiry are reclaimed by the
//! first sweep. The old table is kept as `pins_legacy`.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use rusqlite::Connection;

use super::{PinStore, SCHEMA_DDL};
use crate::cid::Cid;
use crate::error::Result;
use crate::pin::models::{PinRecord, PinSource, PinStatus};

/// True when `pins` exists with the old column layout.
pub(super) fn detect(conn: &Connection) -> bool {
    conn.prepare("SELECT pin_time, expire_time FROM pins LIMIT 0")
        .is_ok()
}

/// Rename the old table, create the current schema and copy rows across,
/// all in one transaction. Returns the number of imported rows.
pub(super) fn migrate(conn: &mut Connection) -> Result<usize> {
    let tx = conn.transaction()?;
    tx.execute_batch("ALTER TABLE pins RENAME TO pins_legacy;")?;
    tx.execute_batch(SCHEMA_DDL)?;

    let rows: Vec<(String, Option<String>, Option<String>, Option<bool>)> = {
        let mut stmt =
            tx.prepare("SELECT cid, pin_time, expire_time, downloaded FROM pins_legacy")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let now = Utc::now();
    let mut imported = 0;
    for (cid, pin_time, expire_time, downloaded) in rows {
        let Ok(cid) = Cid::parse(&cid) else {
            tracing::warn!(cid = %cid, "skipping legacy row with invalid CID");
            continue;
        };
        let Some(expires_at) = expire_time.as_deref().and_then(parse_legacy_time) else {
            tracing::warn!(cid = %cid, "skipping legacy row without a readable expiry");
            continue;
        };
        let pinned_at = pin_time
            .as_deref()
            .and_then(parse_legacy_time)
            .unwrap_or(expires_at)
            .min(expires_at);

        let record = PinRecord {
            cid,
            source: PinSource::Chat,
            pinned_at,
            expires_at,
            status: PinStatus::Active,
            last_error: None,
            downloaded: downloaded.unwrap_or(false),
            requested_by: None,
            updated_at: now,
        };
        PinStore::upsert_with(&tx, &record)?;
        imported += 1;
    }

    tx.commit()?;
    Ok(imported)
}

fn parse_legacy_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}
