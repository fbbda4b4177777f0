// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! # Reference store
//!
//! A small `SQLite` model of a messaging client (account, recipients, threads,
//! messages, attachments, sticker packs, calls) together with an archiver for every
//! record kind and [`SqliteHooks`] for the pipeline collaborators. The CLI and the
//! integration tests run the engine against it.
//!
//! Restorers upsert on natural keys, so replaying an archive into a store that
//! already holds some of its records updates those rows instead of failing.

mod account;
mod chats;
mod hooks;
mod recipients;
mod records;
pub mod schema;

use std::{path::Path, sync::Arc};

use chacha20poly1305::aead::{OsRng, rand_core::RngCore};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use snafu::ResultExt;
use tracing::info;

pub use account::{SqliteAccountData, SqliteLocalRecipient};
pub use chats::{SqliteChatItems, SqliteChats};
pub use hooks::SqliteHooks;
pub use recipients::{
    SqliteCallLinks, SqliteContacts, SqliteDistributionLists, SqliteGroups, SqliteReleaseNotes,
};
pub use records::{SqliteAdHocCalls, SqliteStickerPacks};

use crate::{
    archiver::Archivers,
    context::LocalIdentifiers,
    error::{BackupError, IoSnafu},
    frame_error::FatalArchivingError,
    hooks::PipelineHooks,
};

/// Handle on a reference store database.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackupError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        info!(path = %path.display(), "opened local store");
        Self::from_connection(conn)
    }

    /// Fresh in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, BackupError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, BackupError> {
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Shared connection handle.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// One archiver per record kind.
    pub fn archivers(&self) -> Archivers {
        Archivers {
            account_data: Box::new(SqliteAccountData),
            local_recipient: Box::new(SqliteLocalRecipient),
            release_notes: Box::new(SqliteReleaseNotes),
            contacts: Box::new(SqliteContacts),
            groups: Box::new(SqliteGroups),
            distribution_lists: Box::new(SqliteDistributionLists),
            call_links: Box::new(SqliteCallLinks),
            chats: Box::new(SqliteChats),
            chat_items: Box::new(SqliteChatItems),
            sticker_packs: Box::new(SqliteStickerPacks),
            ad_hoc_calls: Box::new(SqliteAdHocCalls),
        }
    }

    pub fn hooks(&self) -> PipelineHooks {
        let hooks = Arc::new(SqliteHooks::default());
        PipelineHooks {
            preparation: hooks.clone(),
            frame_estimator: hooks.clone(),
            post_frame: hooks.clone(),
            thread_indexer: hooks.clone(),
            jobs: hooks.clone(),
            presenter: hooks,
        }
    }

    /// Create the local account and its self recipient if they don't exist yet.
    pub fn init_account(
        &self,
        local: &LocalIdentifiers,
        profile_key: &[u8],
        given_name: &str,
    ) -> Result<(), BackupError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO account (id, profile_key, given_name) VALUES (1, ?1, ?2)
             ON CONFLICT (id) DO NOTHING",
            params![profile_key, given_name],
        )?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM recipient WHERE kind = 'self_recipient'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_none() {
            conn.execute(
                "INSERT INTO recipient (kind, aci, e164, profile_key) VALUES ('self_recipient', ?1, ?2, ?3)",
                params![
                    local.aci.as_str(),
                    local.e164.as_deref().and_then(parse_e164).map(to_sql_int),
                    profile_key
                ],
            )?;
        }
        Ok(())
    }

    /// Logical content of the store, without row ids.
    pub fn snapshot(&self) -> Result<StoreSnapshot, BackupError> {
        let conn = self.conn.lock();
        Ok(StoreSnapshot::read(&conn)?)
    }
}

/// Row-id-free view of the store, for comparing two stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSnapshot {
    pub account_given_name: Option<String>,
    /// `kind:identifier` per recipient.
    pub recipients: Vec<String>,
    /// `recipient identifier` per thread.
    pub threads: Vec<String>,
    /// `thread:author:sent_at_ms:body` per message.
    pub messages: Vec<String>,
    pub attachments: Vec<String>,
    pub sticker_packs: usize,
    pub calls: usize,
}

// identifier of a recipient row that does not depend on its row id
const RECIPIENT_LABEL_SQL: &str = "kind || ':' || COALESCE(aci, CAST(e164 AS TEXT), hex(group_master_key),
    hex(distribution_id), hex(call_link_root_key), kind)";

impl StoreSnapshot {
    fn read(conn: &Connection) -> rusqlite::Result<Self> {
        let strings = |sql: &str| -> rusqlite::Result<Vec<String>> {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.sort();
            Ok(rows)
        };
        let count = |sql: &str| -> rusqlite::Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or_default())
        };
        Ok(Self {
            account_given_name: conn
                .query_row("SELECT given_name FROM account WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .optional()?,
            recipients: strings(&format!("SELECT {RECIPIENT_LABEL_SQL} FROM recipient"))?,
            threads: strings(&format!(
                "SELECT {RECIPIENT_LABEL_SQL} FROM thread t JOIN recipient r ON r.id = t.recipient_id"
            ))?,
            messages: strings(&format!(
                "SELECT (SELECT {RECIPIENT_LABEL_SQL} FROM recipient WHERE id = t.recipient_id)
                     || '>' || (SELECT {RECIPIENT_LABEL_SQL} FROM recipient WHERE id = m.author_id)
                     || ':' || m.sent_at_ms || ':' || COALESCE(m.body, '')
                 FROM message m JOIN thread t ON t.id = m.thread_id"
            ))?,
            attachments: strings("SELECT media_name || ':' || size FROM attachment")?,
            sticker_packs: count("SELECT COUNT(*) FROM sticker_pack")?,
            calls: count("SELECT COUNT(*) FROM call_record")?,
        })
    }
}

// ----------------------------------------------------------------------------
// helpers shared by the archivers
// ----------------------------------------------------------------------------

pub(crate) const PROFILE_KEY_LEN: usize = 32;

/// Random profile key for a new local account.
pub fn generate_profile_key() -> [u8; PROFILE_KEY_LEN] {
    let mut key = [0u8; PROFILE_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

pub(crate) const ACI_LEN: usize = 16;

pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// `+15555550100` or `15555550100` as a number, if it looks like an E.164 number.
pub(crate) fn parse_e164(text: &str) -> Option<u64> {
    text.trim_start_matches('+')
        .parse()
        .ok()
        .filter(|n| is_valid_e164(*n))
}

pub(crate) fn is_valid_e164(number: u64) -> bool {
    (1_000..=999_999_999_999_999).contains(&number)
}

/// Hyphenated lowercase form of a 16-byte service id.
pub(crate) fn format_aci(bytes: &[u8]) -> String {
    let hex = hex::encode(bytes);
    if hex.len() != ACI_LEN * 2 {
        return hex;
    }
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

pub(crate) fn parse_aci(text: &str) -> Option<Vec<u8>> {
    let bytes = hex::decode(text.replace('-', "")).ok()?;
    (bytes.len() == ACI_LEN).then_some(bytes)
}

/// Collect every row of `sql`, failing the whole archiver on a database error.
pub(crate) fn fetch_all<T, P, F>(
    conn: &Connection,
    what: &str,
    sql: &str,
    params: P,
    map: F,
) -> Result<Vec<T>, FatalArchivingError>
where
    P: rusqlite::Params,
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let fatal = |e: rusqlite::Error| FatalArchivingError::new(format!("reading {what}: {e}"));
    let mut stmt = conn.prepare(sql).map_err(fatal)?;
    stmt.query_map(params, map)
        .map_err(fatal)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(fatal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aci_text_round_trips() {
        let bytes: Vec<u8> = (1..=16).collect();
        let text = format_aci(&bytes);
        assert_eq!(text, "01020304-0506-0708-090a-0b0c0d0e0f10");
        assert_eq!(parse_aci(&text), Some(bytes));
        assert_eq!(parse_aci("not-an-aci"), None);
    }

    #[test]
    fn e164_bounds() {
        assert_eq!(parse_e164("+15555550100"), Some(15_555_550_100));
        assert_eq!(parse_e164("12"), None);
        assert!(!is_valid_e164(0));
    }

    #[test]
    fn init_account_is_idempotent() {
        let store = LocalStore::open_in_memory().expect("store");
        let local = LocalIdentifiers::new("5b3c1a6e-0000-4000-8000-000000000001", Some("+15555550100"));
        store.init_account(&local, &[7; 32], "Ada").expect("init");
        store.init_account(&local, &[7; 32], "Ada").expect("init again");
        let snapshot = store.snapshot().expect("snapshot");
        assert_eq!(snapshot.account_given_name.as_deref(), Some("Ada"));
        assert_eq!(
            snapshot.recipients,
            vec!["self_recipient:5b3c1a6e-0000-4000-8000-000000000001".to_string()]
        );
    }

    #[test]
    fn reopen_keeps_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.db");
        LocalStore::open(&path).expect("open");
        let store = LocalStore::open(&path).expect("reopen");
        let conn = store.connection();
        let version: i64 = conn
            .lock()
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .expect("version");
        assert_eq!(version, schema::SCHEMA_VERSION);
    }
}
