//! Per-CID leases: a row in `pin_leases` claims a CID for one mutation.
//!
//! A lease is taken with a single conditional upsert, so two processes racing
//! for the same CID cannot both win. Expired leases are taken over, which
//! bounds how long a crashed holder can block a CID.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::fmt;

use super::{parse_db_time, to_db_time, PinStore};
use crate::cid::Cid;
use crate::error::{PinError, Result};
use crate::pin::models::PinRecord;

/// Opaque owner token, unique per engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOwner(String);

impl LeaseOwner {
    pub fn generate() -> Self {
        LeaseOwner(format!(
            "{}-{:016x}",
            std::process::id(),
            rand::random::<u64>()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PinStore {
    /// Claim `cid` for `owner` until `now + ttl`.
    ///
    /// Succeeds when no lease exists, the existing one has expired, or
    /// `owner` already holds it. Returns false when someone else holds it.
    pub fn acquire_lease(
        &self,
        cid: &Cid,
        owner: &LeaseOwner,
        now: &DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT INTO pin_leases (cid, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(cid) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
             WHERE pin_leases.expires_at <= ?4 OR pin_leases.owner = excluded.owner",
            params![
                cid.as_str(),
                owner.as_str(),
                to_db_time(&(*now + ttl)),
                to_db_time(now),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Drop the lease if `owner` still holds it. Releasing a lease that was
    /// taken over is a no-op.
    pub fn release_lease(&self, cid: &Cid, owner: &LeaseOwner) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM pin_leases WHERE cid = ?1 AND owner = ?2",
            params![cid.as_str(), owner.as_str()],
        )?;
        Ok(())
    }

    /// Upsert `record` only while `owner` holds an unexpired lease on its CID.
    pub fn upsert_leased(
        &self,
        record: &PinRecord,
        owner: &LeaseOwner,
        now: &DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let held: Option<(String, String)> = tx
            .query_row(
                "SELECT owner, expires_at FROM pin_leases WHERE cid = ?1",
                params![record.cid.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let valid = match held {
            Some((holder, expires_at)) => {
                holder == owner.as_str()
                    && parse_db_time(&expires_at).is_some_and(|exp| exp > *now)
            }
            None => false,
        };
        if !valid {
            return Err(PinError::store(format!("lease on {} lost", record.cid)));
        }

        Self::upsert_with(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Current holder of a CID's lease, if any (expired leases included).
    pub fn lease_holder(&self, cid: &Cid) -> Result<Option<String>> {
        let conn = self.conn();
        let owner = conn
            .query_row(
                "SELECT owner FROM pin_leases WHERE cid = ?1",
                params![cid.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }
}
