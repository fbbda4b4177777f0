// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Collection-scoped key-value storage in the local database.
//!
//! Every method takes the connection (or transaction) explicitly, so callers
//! decide which transaction a read or write belongs to.

use rusqlite::{Connection, OptionalExtension, params};

pub(crate) const KEY_VALUE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS key_value (
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (collection, key)
) WITHOUT ROWID;
";

/// A named collection of the `key_value` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyValueStore {
    collection: &'static str,
}

impl KeyValueStore {
    pub const fn new(collection: &'static str) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    /// Create the backing table if needed.
    pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(KEY_VALUE_SCHEMA)
    }

    pub fn get_bytes(&self, conn: &Connection, key: &str) -> rusqlite::Result<Option<Vec<u8>>> {
        conn.query_row(
            "SELECT value FROM key_value WHERE collection = ?1 AND key = ?2",
            params![self.collection, key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_bytes(&self, conn: &Connection, key: &str, value: &[u8]) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO key_value (collection, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, key) DO UPDATE SET value = excluded.value",
            params![self.collection, key, value],
        )?;
        Ok(())
    }

    pub fn get_string(&self, conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
        conn.query_row(
            "SELECT value FROM key_value WHERE collection = ?1 AND key = ?2",
            params![self.collection, key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_string(&self, conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO key_value (collection, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, key) DO UPDATE SET value = excluded.value",
            params![self.collection, key, value],
        )?;
        Ok(())
    }

    pub fn get_i64(&self, conn: &Connection, key: &str) -> rusqlite::Result<Option<i64>> {
        conn.query_row(
            "SELECT value FROM key_value WHERE collection = ?1 AND key = ?2",
            params![self.collection, key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_i64(&self, conn: &Connection, key: &str, value: i64) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO key_value (collection, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, key) DO UPDATE SET value = excluded.value",
            params![self.collection, key, value],
        )?;
        Ok(())
    }

    pub fn remove(&self, conn: &Connection, key: &str) -> rusqlite::Result<()> {
        conn.execute(
            "DELETE FROM key_value WHERE collection = ?1 AND key = ?2",
            params![self.collection, key],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collections_are_isolated() {
        let conn = Connection::open_in_memory().expect("db");
        KeyValueStore::ensure_schema(&conn).expect("schema");
        let a = KeyValueStore::new("a");
        let b = KeyValueStore::new("b");
        a.set_i64(&conn, "state", 2).expect("set");
        assert_eq!(a.get_i64(&conn, "state").expect("get"), Some(2));
        assert_eq!(b.get_i64(&conn, "state").expect("get"), None);

        a.set_i64(&conn, "state", 1).expect("overwrite");
        assert_eq!(a.get_i64(&conn, "state").expect("get"), Some(1));

        b.set_bytes(&conn, "blob", &[1, 2, 3]).expect("set");
        assert_eq!(b.get_bytes(&conn, "blob").expect("get"), Some(vec![1, 2, 3]));
        b.remove(&conn, "blob").expect("remove");
        assert_eq!(b.get_bytes(&conn, "blob").expect("get"), None);

        a.set_string(&conn, "era", "abc").expect("set");
        assert_eq!(a.get_string(&conn, "era").expect("get").as_deref(), Some("abc"));
    }
}
