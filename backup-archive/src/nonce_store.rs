// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Durable forward-secrecy chain state.
//!
//! Two entries: the token that encrypted the most recently uploaded backup, and the
//! opaque "next secret" metadata the service needs to continue the chain. Export
//! writes both in one transaction after an upload succeeds. Import writes the
//! restored seed before reading the archive and the token with the import
//! transaction.

use rusqlite::Connection;

use crate::{crypto::ForwardSecrecyToken, forward_secrecy::KeyDerivationError, kv::KeyValueStore};

const LAST_TOKEN_KEY: &str = "lastForwardSecrecyToken";
const NEXT_SECRET_KEY: &str = "nextSecretMetadata";

/// Reads and writes the chain state. Stateless; all state lives in the database.
#[derive(Debug, Clone, Copy)]
pub struct NonceMetadataStore {
    kv: KeyValueStore,
}

impl Default for NonceMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceMetadataStore {
    pub const fn new() -> Self {
        Self {
            kv: KeyValueStore::new("BackupNonceMetadataStore"),
        }
    }

    pub fn last_forward_secrecy_token(
        &self,
        conn: &Connection,
    ) -> Result<Option<ForwardSecrecyToken>, KeyDerivationError> {
        let bytes = self
            .kv
            .get_bytes(conn, LAST_TOKEN_KEY)
            .map_err(|source| KeyDerivationError::NonceStore { source })?;
        bytes
            .map(|bytes| ForwardSecrecyToken::from_bytes(&bytes))
            .transpose()
    }

    pub fn set_last_forward_secrecy_token(
        &self,
        conn: &Connection,
        token: &ForwardSecrecyToken,
    ) -> rusqlite::Result<()> {
        self.kv.set_bytes(conn, LAST_TOKEN_KEY, token.as_bytes())
    }

    pub fn next_secret_metadata(&self, conn: &Connection) -> rusqlite::Result<Option<Vec<u8>>> {
        self.kv.get_bytes(conn, NEXT_SECRET_KEY)
    }

    pub fn set_next_secret_metadata(&self, conn: &Connection, metadata: &[u8]) -> rusqlite::Result<()> {
        self.kv.set_bytes(conn, NEXT_SECRET_KEY, metadata)
    }

    /// Forget the chain seed so the next store starts a new chain.
    pub fn delete_next_secret_metadata(&self, conn: &Connection) -> rusqlite::Result<()> {
        self.kv.remove(conn, NEXT_SECRET_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_and_seed_round_trip() {
        let conn = Connection::open_in_memory().expect("db");
        KeyValueStore::ensure_schema(&conn).expect("schema");
        let store = NonceMetadataStore::new();
        assert!(store.last_forward_secrecy_token(&conn).expect("read").is_none());
        assert!(store.next_secret_metadata(&conn).expect("read").is_none());

        let token = ForwardSecrecyToken::generate();
        store.set_last_forward_secrecy_token(&conn, &token).expect("write");
        store.set_next_secret_metadata(&conn, b"seed").expect("write");
        assert_eq!(store.last_forward_secrecy_token(&conn).expect("read"), Some(token));
        assert_eq!(store.next_secret_metadata(&conn).expect("read").as_deref(), Some(&b"seed"[..]));

        store.delete_next_secret_metadata(&conn).expect("delete");
        assert!(store.next_secret_metadata(&conn).expect("read").is_none());
    }
}
