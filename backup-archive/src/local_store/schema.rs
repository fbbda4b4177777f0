// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Reference store schema and migrations.

use rusqlite::Connection;
use tracing::debug;

use crate::kv::KEY_VALUE_SCHEMA;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS account (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    profile_key BLOB NOT NULL,
    username TEXT,
    given_name TEXT NOT NULL DEFAULT '',
    family_name TEXT NOT NULL DEFAULT '',
    read_receipts INTEGER NOT NULL DEFAULT 0,
    typing_indicators INTEGER NOT NULL DEFAULT 0,
    universal_expire_timer_seconds INTEGER NOT NULL DEFAULT 0,
    display_badges_on_profile INTEGER NOT NULL DEFAULT 0
);

-- one row per contact, group, distribution list, call link, self and release notes
CREATE TABLE IF NOT EXISTS recipient (
    id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    aci TEXT UNIQUE,
    e164 INTEGER UNIQUE,
    profile_given_name TEXT,
    profile_family_name TEXT,
    profile_key BLOB,
    blocked INTEGER NOT NULL DEFAULT 0,
    group_master_key BLOB UNIQUE,
    title TEXT,
    whitelisted INTEGER NOT NULL DEFAULT 0,
    distribution_id BLOB UNIQUE,
    deletion_timestamp INTEGER,
    call_link_root_key BLOB UNIQUE,
    call_link_expiration_ms INTEGER
);
CREATE INDEX IF NOT EXISTS recipient_kind ON recipient (kind);

CREATE TABLE IF NOT EXISTS distribution_list_member (
    list_id INTEGER NOT NULL REFERENCES recipient (id) ON DELETE CASCADE,
    member_id INTEGER NOT NULL REFERENCES recipient (id) ON DELETE CASCADE,
    PRIMARY KEY (list_id, member_id)
);

CREATE TABLE IF NOT EXISTS thread (
    id INTEGER PRIMARY KEY,
    recipient_id INTEGER NOT NULL UNIQUE REFERENCES recipient (id),
    archived INTEGER NOT NULL DEFAULT 0,
    pinned_order INTEGER,
    expiration_timer_ms INTEGER NOT NULL DEFAULT 0,
    mute_until_ms INTEGER,
    mark_unread INTEGER NOT NULL DEFAULT 0,
    last_message_id INTEGER,
    last_message_at_ms INTEGER
);

CREATE TABLE IF NOT EXISTS message (
    id INTEGER PRIMARY KEY,
    thread_id INTEGER NOT NULL REFERENCES thread (id),
    author_id INTEGER NOT NULL REFERENCES recipient (id),
    sent_at_ms INTEGER NOT NULL,
    direction INTEGER NOT NULL,
    body TEXT,
    expires_in_ms INTEGER,
    expire_start_ms INTEGER,
    view_once INTEGER NOT NULL DEFAULT 0,
    viewed INTEGER NOT NULL DEFAULT 0,
    UNIQUE (thread_id, author_id, sent_at_ms)
);
CREATE INDEX IF NOT EXISTS message_thread_sent ON message (thread_id, sent_at_ms);
CREATE INDEX IF NOT EXISTS message_author ON message (author_id);
CREATE INDEX IF NOT EXISTS message_expiring ON message (expire_start_ms)
    WHERE expires_in_ms IS NOT NULL;

CREATE TABLE IF NOT EXISTS attachment (
    id INTEGER PRIMARY KEY,
    media_name TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    digest BLOB NOT NULL,
    downloaded INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS message_attachment (
    message_id INTEGER NOT NULL REFERENCES message (id) ON DELETE CASCADE,
    attachment_id INTEGER NOT NULL REFERENCES attachment (id),
    position INTEGER NOT NULL,
    PRIMARY KEY (message_id, position)
);

CREATE TABLE IF NOT EXISTS sticker_pack (
    pack_id BLOB PRIMARY KEY,
    pack_key BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS call_record (
    call_id INTEGER PRIMARY KEY,
    recipient_id INTEGER NOT NULL REFERENCES recipient (id),
    state INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS thread_search (
    thread_id INTEGER PRIMARY KEY REFERENCES thread (id) ON DELETE CASCADE,
    title TEXT NOT NULL
);

-- deferred work scheduled by import and finalize
CREATE TABLE IF NOT EXISTS restore_job (
    id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    target TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    UNIQUE (kind, target)
);

CREATE TABLE IF NOT EXISTS backup_error_log (
    id INTEGER PRIMARY KEY,
    operation TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    max_level TEXT,
    report_json TEXT NOT NULL
);
";

/// Bring the schema up to [`SCHEMA_VERSION`].
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    if current < 1 {
        debug!("creating schema v1");
        conn.execute_batch(KEY_VALUE_SCHEMA)?;
        conn.execute_batch(SCHEMA_V1)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
    }
    Ok(())
}
