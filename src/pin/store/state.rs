//! Small key/value state that must survive restarts (ingestion cursor).

use rusqlite::{params, OptionalExtension};

use super::PinStore;
use crate::error::Result;

impl PinStore {
    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM local_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO local_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}
