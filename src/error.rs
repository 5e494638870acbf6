//! Error types: lifecycle lookups, remote store calls, CID syntax, storage,
//! and chat transport.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PinError {
    #[error("no live pin record for {cid}")]
    NotFound { cid: String },

    #[error("remote store failure: {reason}")]
    Remote { reason: String },

    #[error("invalid CID: {input}")]
    InvalidCid { input: String },

    #[error("invalid duration: {reason}")]
    InvalidDuration { reason: String },

    #[error("store failure: {reason}")]
    Store { reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("chat transport error: {reason}")]
    Transport { reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {reason}")]
    Config { reason: String },
}

impl PinError {
    /// Store-level failures: lease contention, lost leases, SQLite errors.
    /// These are the only errors the engine retries on its own.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, PinError::Store { .. } | PinError::Database(_))
    }

    pub fn is_remote_failure(&self) -> bool {
        matches!(self, PinError::Remote { .. })
    }

    pub(crate) fn remote(reason: impl Into<String>) -> Self {
        PinError::Remote {
            reason: reason.into(),
        }
    }

    pub(crate) fn store(reason: impl Into<String>) -> Self {
        PinError::Store {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failure_classification() {
        assert!(PinError::store("lease busy").is_store_failure());
        assert!(PinError::Database(rusqlite::Error::QueryReturnedNoRows).is_store_failure());
        assert!(!PinError::remote("timeout").is_store_failure());
        assert!(!PinError::NotFound { cid: "x".into() }.is_store_failure());
    }

    #[test]
    fn messages_name_the_cid() {
        let err = PinError::NotFound {
            cid: "QmTest".into(),
        };
        assert_eq!(err.to_string(), "no live pin record for QmTest");
    }
}
