//! Pin data model: one record per tracked CID.
//!
//! A record is created on the first successful remote pin, refreshed on every
//! re-sighting, and ends in `Unpinned` once the remote unpin succeeds. An
//! `Unpinned` row is history only: the next sighting overwrites it with a
//! fresh record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cid::Cid;
use crate::error::{PinError, Result};

/// Where a pin request came from. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PinSource {
    Chat,
    LocalFile,
    Manual,
}

impl PinSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinSource::Chat => "chat",
            PinSource::LocalFile => "local-file",
            PinSource::Manual => "manual",
        }
    }
}

impl fmt::Display for PinSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PinSource {
    type Err = PinError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chat" => Ok(PinSource::Chat),
            "local-file" => Ok(PinSource::LocalFile),
            "manual" => Ok(PinSource::Manual),
            other => Err(PinError::store(format!("unknown pin source '{other}'"))),
        }
    }
}

/// Lifecycle state of a record.
///
/// `Active` means remote-pinned and inside its window. `Expired` means the
/// window passed and a remote unpin failed; the sweeper retries it. `Unpinned`
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinStatus {
    Active,
    Expired,
    Unpinned,
}

impl PinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinStatus::Active => "active",
            PinStatus::Expired => "expired",
            PinStatus::Unpinned => "unpinned",
        }
    }

    /// Active or expired: the CID still occupies the remote store.
    pub fn is_live(&self) -> bool {
        !matches!(self, PinStatus::Unpinned)
    }
}

impl fmt::Display for PinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PinStatus {
    type Err = PinError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(PinStatus::Active),
            "expired" => Ok(PinStatus::Expired),
            "unpinned" => Ok(PinStatus::Unpinned),
            other => Err(PinError::store(format!("unknown pin status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinRecord {
    pub cid: Cid,
    pub source: PinSource,
    pub pinned_at: DateTime<Utc>,
    /// Always >= `pinned_at`; never decreases while the record is live.
    pub expires_at: DateTime<Utc>,
    pub status: PinStatus,
    /// Last remote-store failure, cleared by the next successful remote call.
    pub last_error: Option<String>,
    /// A copy exists in the local content cache.
    pub downloaded: bool,
    /// Chat sender that asked for the pin, if any.
    pub requested_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Longest window a single pin request may ask for: one hundred years.
pub const MAX_WINDOW_HOURS: u64 = 24 * 365 * 100;

/// `hours` as a pin window, rejecting values past [`MAX_WINDOW_HOURS`].
pub fn window_hours(hours: u64) -> Result<Duration> {
    if hours > MAX_WINDOW_HOURS {
        return Err(PinError::InvalidDuration {
            reason: format!("{hours}h exceeds the maximum of {MAX_WINDOW_HOURS}h"),
        });
    }
    Duration::try_hours(hours as i64).ok_or_else(|| PinError::InvalidDuration {
        reason: format!("{hours}h is out of range"),
    })
}

/// End of a window of `duration` starting at `start`. Negative durations
/// clamp to zero. Stored timestamps are fixed width, so the end must stay
/// within four-digit years.
pub fn window_end(start: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    start
        .checked_add_signed(duration.max(Duration::zero()))
        .filter(|end| end.year() <= 9999)
        .ok_or_else(|| PinError::InvalidDuration {
            reason: format!("window of {}h from {start} is out of range", duration.num_hours()),
        })
}

impl PinRecord {
    /// A freshly pinned record: active from `now` for `duration`.
    pub fn fresh(cid: Cid, source: PinSource, now: DateTime<Utc>, duration: Duration) -> Result<Self> {
        Ok(Self {
            cid,
            source,
            pinned_at: now,
            expires_at: window_end(now, duration)?,
            status: PinStatus::Active,
            last_error: None,
            downloaded: false,
            requested_by: None,
            updated_at: now,
        })
    }

    pub fn with_requester(mut self, requester: Option<String>) -> Self {
        self.requested_by = requester;
        self
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Due for reclamation at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_live() && self.expires_at <= now
    }

    /// Remaining window, or `None` once `expires_at` has passed.
    pub fn time_left(&self, now: DateTime<Utc>) -> Option<Duration> {
        let left = self.expires_at - now;
        (left > Duration::zero()).then_some(left)
    }
}

#[cfg(test)]
pub(crate) fn test_cid(n: usize) -> Cid {
    const CIDS: [&str; 6] = [
        "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG",
        "QmT78zSuBmuS4z925WZfrqQ1qHaJ56DQaTfyMUF7F8ff5o",
        "QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn",
        "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi",
        "bafkreifzjut3te2nhyekklss27nh3k72ysco7y32koao5eei66wof36n5e",
        "bafybeiemxf5abjwjbikoz4mc3a3dla6ual3jsgpdr4cjr3oz3evfyavhwq",
    ];
    Cid::parse(CIDS[n % CIDS.len()]).expect("test CID should parse")
}
