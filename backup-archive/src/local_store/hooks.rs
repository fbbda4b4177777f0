// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Pipeline collaborators backed by the reference schema.

use rusqlite::{Connection, params};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{fetch_all, to_sql_int};
use crate::{
    cancel::CancellationToken,
    collapse::ErrorReport,
    context::{PostFrameRestoreAction, RecipientKind, RestoringContext},
    error::{BackupError, ValidationError},
    frame_error::{InvalidProtoDataError, LoggableId, RestoreFrameError},
    hooks::{
        ArchivePreparation, BackupOperation, ErrorPresenter, FrameCountEstimator,
        PostFrameActionHandler, RestoreJobQueue, ThreadIndexer,
    },
};

/// Message bodies longer than this are moved into a text attachment before export.
pub const MAX_INLINE_BODY_BYTES: usize = 2 * 1024;

const LONG_TEXT_CONTENT_TYPE: &str = "text/x-long-text";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Every hook over the reference schema.
#[derive(Debug, Clone)]
pub struct SqliteHooks {
    max_inline_body_bytes: usize,
}

impl Default for SqliteHooks {
    fn default() -> Self {
        Self {
            max_inline_body_bytes: MAX_INLINE_BODY_BYTES,
        }
    }
}

impl SqliteHooks {
    #[must_use]
    pub fn max_inline_body_bytes(self, max_inline_body_bytes: usize) -> Self {
        Self {
            max_inline_body_bytes,
        }
    }
}

/// Largest prefix of `text` that fits in `max` bytes without splitting a character.
fn truncate_at_char(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

impl ArchivePreparation for SqliteHooks {
    fn run_attachment_migration(
        &self,
        conn: &Connection,
        _cancel: &CancellationToken,
    ) -> Result<(), BackupError> {
        let migrated = conn.execute(
            "UPDATE attachment SET content_type = ?1 WHERE content_type = ''",
            [DEFAULT_CONTENT_TYPE],
        )?;
        if migrated > 0 {
            debug!(migrated, "attachments given a default content type");
        }
        Ok(())
    }

    fn stage_oversize_text(
        &self,
        conn: &Connection,
        cancel: &CancellationToken,
    ) -> Result<(), BackupError> {
        let limit = i64::try_from(self.max_inline_body_bytes).unwrap_or(i64::MAX);
        let oversize = fetch_all(
            conn,
            "oversize messages",
            "SELECT id, body FROM message WHERE length(CAST(body AS BLOB)) > ?1",
            [limit],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .map_err(|e| BackupError::ExportFailed {
            message: e.message().to_string(),
        })?;
        for (message_row, body) in &oversize {
            cancel.check()?;
            let digest = Sha256::digest(body.as_bytes());
            let media_name = format!("text-{}", hex::encode(digest));
            let attachment_row: i64 = conn.query_row(
                "INSERT INTO attachment (media_name, size, content_type, digest, downloaded)
                 VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT (media_name) DO UPDATE SET size = excluded.size
                 RETURNING id",
                params![
                    media_name,
                    to_sql_int(body.len() as u64),
                    LONG_TEXT_CONTENT_TYPE,
                    digest.as_slice()
                ],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO message_attachment (message_id, attachment_id, position)
                 VALUES (?1, ?2, (SELECT COALESCE(MAX(position) + 1, 0)
                                  FROM message_attachment WHERE message_id = ?1))",
                params![message_row, attachment_row],
            )?;
            conn.execute(
                "UPDATE message SET body = ?2 WHERE id = ?1",
                params![message_row, truncate_at_char(body, self.max_inline_body_bytes)],
            )?;
        }
        if !oversize.is_empty() {
            info!(count = oversize.len(), "moved oversize message bodies into attachments");
        }
        Ok(())
    }
}

impl FrameCountEstimator for SqliteHooks {
    fn estimate_frame_count(&self, conn: &Connection) -> rusqlite::Result<u64> {
        let count: i64 = conn.query_row(
            "SELECT 1
                 + (SELECT COUNT(*) FROM recipient)
                 + (SELECT COUNT(*) FROM thread)
                 + (SELECT COUNT(*) FROM message)
                 + (SELECT COUNT(*) FROM sticker_pack)
                 + (SELECT COUNT(*) FROM call_record)",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl PostFrameActionHandler for SqliteHooks {
    fn handle(
        &self,
        action: &PostFrameRestoreAction,
        ctx: &RestoringContext<'_>,
    ) -> Result<(), RestoreFrameError> {
        match action {
            PostFrameRestoreAction::UpdateChatLastMessage { thread_row } => ctx
                .conn
                .execute(
                    "UPDATE thread SET
                         last_message_id = (SELECT id FROM message WHERE thread_id = ?1
                                            ORDER BY sent_at_ms DESC, id DESC LIMIT 1),
                         last_message_at_ms = (SELECT MAX(sent_at_ms) FROM message WHERE thread_id = ?1)
                     WHERE id = ?1",
                    [thread_row],
                )
                .map(|_| ())
                .map_err(|e| RestoreFrameError::database(&e, LoggableId::local_row("thread", *thread_row))),
            PostFrameRestoreAction::ResolveDistributionListMembers { list_row, members } => {
                let loggable = || LoggableId::local_row("distribution_list", *list_row);
                let mut first_error = None;
                for member in members {
                    let problem = match ctx.recipient(*member) {
                        Some(recipient) if recipient.kind == RecipientKind::Contact => {
                            match ctx.conn.execute(
                                "INSERT OR IGNORE INTO distribution_list_member (list_id, member_id)
                                 VALUES (?1, ?2)",
                                params![list_row, recipient.row_id],
                            ) {
                                Ok(_) => None,
                                Err(e) => Some(RestoreFrameError::database(&e, loggable())),
                            }
                        }
                        Some(_) => Some(RestoreFrameError::invalid(
                            InvalidProtoDataError::DistributionListMemberNotContact(member.0),
                            loggable(),
                        )),
                        None => Some(RestoreFrameError::invalid(
                            InvalidProtoDataError::RecipientIdNotFound(member.0),
                            loggable(),
                        )),
                    };
                    if let Some(problem) = problem {
                        warn!(list = list_row, member = member.0, error = %problem, "skipping list member");
                        first_error.get_or_insert(problem);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }
}

impl ThreadIndexer for SqliteHooks {
    fn index_threads(&self, conn: &Connection) -> rusqlite::Result<u64> {
        conn.execute("DELETE FROM thread_search", [])?;
        let indexed = conn.execute(
            "INSERT INTO thread_search (thread_id, title)
             SELECT t.id, COALESCE(r.title,
                        NULLIF(trim(COALESCE(r.profile_given_name, '') || ' '
                                    || COALESCE(r.profile_family_name, '')), ''),
                        r.aci, CAST(r.e164 AS TEXT), '')
             FROM thread t JOIN recipient r ON r.id = t.recipient_id",
            [],
        )?;
        Ok(indexed as u64)
    }
}

impl RestoreJobQueue for SqliteHooks {
    fn enqueue_message_indexing(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO restore_job (kind, target, created_at_ms)
             VALUES ('message_index', 'all', ?1)",
            [now_ms()],
        )?;
        Ok(())
    }

    fn ensure_avatar_fetch(&self, conn: &Connection) -> rusqlite::Result<u64> {
        let enqueued = conn.execute(
            "INSERT OR IGNORE INTO restore_job (kind, target, created_at_ms)
             SELECT 'avatar_fetch', CAST(id AS TEXT), ?1 FROM recipient
             WHERE (kind = 'contact' AND profile_key IS NOT NULL)
                OR (kind = 'group' AND group_master_key IS NOT NULL)",
            [now_ms()],
        )?;
        Ok(enqueued as u64)
    }

    fn ensure_attachment_downloads(&self, conn: &Connection) -> rusqlite::Result<u64> {
        let enqueued = conn.execute(
            "INSERT OR IGNORE INTO restore_job (kind, target, created_at_ms)
             SELECT 'attachment_download', media_name, ?1 FROM attachment WHERE downloaded = 0",
            [now_ms()],
        )?;
        Ok(enqueued as u64)
    }
}

impl ErrorPresenter for SqliteHooks {
    fn present_report(
        &self,
        conn: &Connection,
        operation: BackupOperation,
        report: &ErrorReport,
    ) -> rusqlite::Result<()> {
        let json = serde_json::to_string(report)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        conn.execute(
            "INSERT INTO backup_error_log (operation, created_at_ms, max_level, report_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                operation.to_string(),
                now_ms(),
                report.max_level.map(|level| level.to_string()),
                json
            ],
        )?;
        Ok(())
    }

    fn present_validation_error(
        &self,
        conn: &Connection,
        error: &ValidationError,
    ) -> rusqlite::Result<()> {
        let json = json!({ "error": error.to_string() });
        conn.execute(
            "INSERT INTO backup_error_log (operation, created_at_ms, max_level, report_json)
             VALUES (?1, ?2, 'error', ?3)",
            params![BackupOperation::Validate.to_string(), now_ms(), json.to_string()],
        )?;
        Ok(())
    }
}
