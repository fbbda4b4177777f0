// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Persisted progress of a backup restore.
//!
//! ```text
//! none --(all frames imported, committed)--> unfinalized --(finalize)--> finalized
//! ```
//!
//! The state is written in the same transaction as the work it describes, so a
//! process killed mid-restore never observes a state ahead of the data.

use rusqlite::Connection;
use serde::Serialize;
use strum::Display;
use tracing::warn;

use crate::kv::KeyValueStore;

const STATE_KEY: &str = "restoreState";

/// Restore progress. Persisted as an integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackupRestoreState {
    /// No restore has started (or a cancelled one left no trace).
    #[default]
    None,
    /// Every frame is imported; deferred work is still pending.
    Unfinalized,
    /// Restore is complete.
    Finalized,
}

impl BackupRestoreState {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Unfinalized => 1,
            Self::Finalized => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Unfinalized),
            2 => Some(Self::Finalized),
            _ => None,
        }
    }
}

/// Reads and writes [`BackupRestoreState`].
#[derive(Debug, Clone, Copy)]
pub struct RestoreStateStore {
    kv: KeyValueStore,
}

impl Default for RestoreStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreStateStore {
    pub const fn new() -> Self {
        Self {
            kv: KeyValueStore::new("BackupArchiveManager"),
        }
    }

    /// Current state; an unknown stored value reads as `None`.
    pub fn get(&self, conn: &Connection) -> rusqlite::Result<BackupRestoreState> {
        let raw = self.kv.get_i64(conn, STATE_KEY)?.unwrap_or(0);
        Ok(BackupRestoreState::from_i64(raw).unwrap_or_else(|| {
            warn!(raw, "unrecognized backup restore state");
            BackupRestoreState::None
        }))
    }

    pub fn set(&self, conn: &Connection, state: BackupRestoreState) -> rusqlite::Result<()> {
        self.kv.set_i64(conn, STATE_KEY, state.as_i64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_none_and_persists_integers() {
        let conn = Connection::open_in_memory().expect("db");
        KeyValueStore::ensure_schema(&conn).expect("schema");
        let store = RestoreStateStore::new();
        assert_eq!(store.get(&conn).expect("get"), BackupRestoreState::None);

        store.set(&conn, BackupRestoreState::Unfinalized).expect("set");
        let raw: i64 = conn
            .query_row(
                "SELECT value FROM key_value WHERE key = 'restoreState'",
                [],
                |row| row.get(0),
            )
            .expect("raw");
        assert_eq!(raw, 1);
        assert_eq!(store.get(&conn).expect("get"), BackupRestoreState::Unfinalized);
    }

    #[test]
    fn unknown_value_reads_as_none() {
        let conn = Connection::open_in_memory().expect("db");
        KeyValueStore::ensure_schema(&conn).expect("schema");
        KeyValueStore::new("BackupArchiveManager")
            .set_i64(&conn, STATE_KEY, 9)
            .expect("set");
        assert_eq!(
            RestoreStateStore::new().get(&conn).expect("get"),
            BackupRestoreState::None
        );
    }
}
