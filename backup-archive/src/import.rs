// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Import pipeline.
//!
//! Replays an archive into the local store inside one write transaction. Indexes on
//! the interactions table are dropped for the duration of the frame loop and
//! recreated from their original SQL afterwards.
//!
//! Outcomes:
//!
//! - success: queued post-frame actions run, threads are indexed, the restore state
//!   becomes `unfinalized`, the restored forward-secrecy token (if any) is recorded
//!   and the transaction commits;
//! - cancelled: indexes are recreated and the work so far is committed, the restore
//!   state stays `none`; restorers upsert, so a later import converges;
//! - any other failure: the transaction rolls back.

use std::{
    path::Path,
    sync::{Arc, atomic::Ordering},
};

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, error, info, warn};

use crate::{
    SUPPORTED_BACKUP_VERSION,
    accounting::{ProgressPhase, ProgressSink, ProgressTracker},
    archiver::{Archivers, RestoreFrameResult},
    bench::{BenchSummary, Bencher},
    cancel::CancellationToken,
    collapse::{ErrorReport, process_errors},
    config::INTERACTIONS_TABLE,
    context::{BackupPurpose, LocalIdentifiers, RecipientId, RestoringContext},
    crypto::{ArchiveKey, ForwardSecrecyToken, MediaRootBackupKey},
    error::{AlreadyRestoredSnafu, BackupError, UnsupportedVersionSnafu},
    frame_error::{FrameDecodeError, FrameErrorRecord, LoggableId, UnrecognizedEnumError},
    hooks::{BackupOperation, PipelineHooks},
    nonce_store::NonceMetadataStore,
    proto::{FrameKind, Recipient, frame, recipient},
    restore_state::{BackupRestoreState, RestoreStateStore},
    settings::{BackupSettingsStore, RestoredAppVersions},
    stream::{OpenedArchive, open_archive_file},
};

/// Everything one import needs besides the store and archivers.
pub struct ImportRequest<'a> {
    pub path: &'a Path,
    pub local: &'a LocalIdentifiers,
    pub purpose: BackupPurpose,
    /// `None` reads a plaintext archive.
    pub key: Option<&'a ArchiveKey>,
    /// Bytes of metadata header before the ciphertext.
    pub header_len: u64,
    /// Abort on the first frame that fails to decode or restore.
    pub strict: bool,
    /// Token recovered for this archive; recorded as the chain's last token only
    /// if the import commits successfully.
    pub forward_secrecy_token: Option<&'a ForwardSecrecyToken>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

/// A committed import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub backup_time_ms: u64,
    pub frames_read: u64,
    pub frames_restored: u64,
    /// Frames of kinds that are read but not restored.
    pub frames_skipped: u64,
    pub threads_indexed: u64,
    pub report: ErrorReport,
    pub bench: BenchSummary,
}

#[derive(Debug, Default)]
struct FrameStats {
    read: u64,
    restored: u64,
    skipped: u64,
}

/// A dropped index and the SQL that recreates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedIndex {
    pub name: String,
    pub sql: String,
}

/// Drop every explicitly created index on the interactions table.
pub fn drop_interaction_indexes(conn: &Connection) -> rusqlite::Result<Vec<CapturedIndex>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master
         WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL
           AND name NOT LIKE 'sqlite_autoindex_%'
         ORDER BY name",
    )?;
    let indexes = stmt
        .query_map([INTERACTIONS_TABLE], |row| {
            Ok(CapturedIndex {
                name: row.get(0)?,
                sql: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for index in &indexes {
        let quoted = index.name.replace('"', "\"\"");
        conn.execute_batch(&format!("DROP INDEX IF EXISTS \"{quoted}\""))?;
    }
    debug!(count = indexes.len(), table = INTERACTIONS_TABLE, "dropped indexes");
    Ok(indexes)
}

pub fn recreate_indexes(conn: &Connection, indexes: &[CapturedIndex]) -> rusqlite::Result<()> {
    for index in indexes {
        conn.execute_batch(&index.sql)?;
    }
    debug!(count = indexes.len(), "recreated indexes");
    Ok(())
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

fn restore_recipient(
    proto: &Recipient,
    archivers: &Archivers,
    ctx: &RestoringContext<'_>,
) -> RestoreFrameResult<()> {
    use recipient::Destination;

    let id = RecipientId(proto.id);
    match &proto.destination {
        Some(Destination::Contact(contact)) => archivers.contacts.restore(id, contact, ctx),
        Some(Destination::Group(group)) => archivers.groups.restore(id, group, ctx),
        Some(Destination::DistributionList(list)) => {
            archivers.distribution_lists.restore(id, list, ctx)
        }
        Some(Destination::SelfRecipient(me)) => archivers.local_recipient.restore(id, me, ctx),
        Some(Destination::ReleaseNotes(notes)) => archivers.release_notes.restore(id, notes, ctx),
        Some(Destination::CallLink(link)) => archivers.call_links.restore(id, link, ctx),
        None => RestoreFrameResult::UnrecognizedEnum(UnrecognizedEnumError::new(
            "Recipient.Destination",
            0,
            LoggableId::recipient(proto.id),
        )),
    }
}

/// Dispatch one record to its restorer. `None` for kinds that are not restored.
fn restore_item(
    item: &frame::Item,
    archivers: &Archivers,
    ctx: &RestoringContext<'_>,
) -> Option<RestoreFrameResult<()>> {
    let result = match item {
        frame::Item::Account(data) => archivers.account_data.restore(data, ctx),
        frame::Item::Recipient(proto) => restore_recipient(proto, archivers, ctx),
        frame::Item::Chat(chat) => archivers.chats.restore(chat, ctx),
        frame::Item::ChatItem(chat_item) => archivers.chat_items.restore(chat_item, ctx),
        frame::Item::StickerPack(pack) => archivers.sticker_packs.restore(pack, ctx),
        frame::Item::AdHocCall(call) => archivers.ad_hoc_calls.restore(call, ctx),
        frame::Item::NotificationProfile(_) | frame::Item::ChatFolder(_) => return None,
    };
    Some(result)
}

fn restore_frames(
    opened: &mut OpenedArchive,
    archivers: &Archivers,
    ctx: &RestoringContext<'_>,
    strict: bool,
    tracker: &mut ProgressTracker,
    errors: &mut Vec<FrameErrorRecord>,
    cancel: &CancellationToken,
) -> Result<FrameStats, BackupError> {
    let mut stats = FrameStats::default();
    loop {
        cancel.check()?;
        let frame = match opened.reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.is_skippable() && !strict => {
                let index = opened.reader.frames_read();
                warn!(frame = index, error = %e, "skipping undecodable frame");
                errors.push(FrameErrorRecord::new(
                    FrameDecodeError::new(e.to_string(), index),
                    true,
                ));
                continue;
            }
            Err(source) => return Err(BackupError::FrameRead { source }),
        };
        let index = opened.reader.frames_read();
        tracker.advance(opened.bytes_read.load(Ordering::Relaxed));

        let Some(item) = frame.item.as_ref() else {
            // an empty final frame is tolerated
            if opened.reader.has_more()? {
                errors.push(FrameErrorRecord::new(
                    UnrecognizedEnumError::new("Frame.Item", 0, LoggableId::frame(index)),
                    true,
                ));
            } else {
                debug!(frame = index, "ignoring empty trailing frame");
            }
            continue;
        };
        let kind = FrameKind::of(Some(item));
        let Some(result) = ctx
            .bencher
            .measure_frame(kind, || restore_item(item, archivers, ctx))
        else {
            stats.skipped += 1;
            continue;
        };
        match result {
            RestoreFrameResult::Success(()) => stats.restored += 1,
            RestoreFrameResult::UnrecognizedEnum(e) => {
                errors.push(FrameErrorRecord::new(e, true));
            }
            RestoreFrameResult::PartialRestore((), partial) => {
                stats.restored += 1;
                errors.extend(partial.into_iter().map(|e| FrameErrorRecord::new(e, false)));
            }
            RestoreFrameResult::Failure(failed) => {
                let message = failed
                    .first()
                    .map_or_else(|| format!("{kind} frame {index} failed"), ToString::to_string);
                errors.extend(failed.into_iter().map(|e| FrameErrorRecord::new(e, true)));
                if kind == FrameKind::AccountData || strict {
                    error!(frame = index, %kind, %message, "aborting import");
                    return Err(BackupError::ImportFailed { message });
                }
            }
        }
    }
    stats.read = opened.reader.frames_read();
    Ok(stats)
}

/// Import the archive described by `request`.
///
/// Blocking; call from `spawn_blocking`.
pub fn import_backup(
    conn: &mut Connection,
    archivers: &Archivers,
    hooks: &PipelineHooks,
    request: &ImportRequest<'_>,
    cancel: &CancellationToken,
) -> Result<ImportOutcome, BackupError> {
    let state_store = RestoreStateStore::new();
    let settings = BackupSettingsStore::new();
    let bencher = Bencher::new();
    let mut tracker = ProgressTracker::import(request.progress.clone());
    info!(
        purpose = %request.purpose,
        encrypted = request.key.is_some(),
        strict = request.strict,
        "starting import"
    );

    tracker.start_phase(ProgressPhase::ImportMigration, 1);
    cancel.check()?;
    bencher.measure_step("attachment_migration", || {
        hooks.preparation.run_attachment_migration(conn, cancel)
    })?;
    tracker.complete_phase();
    cancel.check()?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let state = state_store.get(&tx)?;
    ensure!(state == BackupRestoreState::None, AlreadyRestoredSnafu { state });

    let indexes = drop_interaction_indexes(&tx)?;
    let mut opened = open_archive_file(request.path, request.key, request.header_len)?;
    let info = opened.reader.read_backup_info()?;
    ensure!(
        info.version == SUPPORTED_BACKUP_VERSION,
        UnsupportedVersionSnafu {
            version: info.version,
            supported: SUPPORTED_BACKUP_VERSION
        }
    );
    let media_root_key = MediaRootBackupKey::from_bytes(&info.media_root_backup_key).map_err(|e| {
        BackupError::ImportFailed {
            message: format!("backup info: {e}"),
        }
    })?;
    settings.set_media_root_backup_key(&tx, &media_root_key)?;
    settings.set_restored_app_versions(
        &tx,
        &RestoredAppVersions {
            first: info.first_app_version.clone(),
            current: info.current_app_version.clone(),
        },
    )?;
    debug!(
        backup_time_ms = info.backup_time_ms,
        app_version = %info.current_app_version,
        "read backup info"
    );

    let mut errors: Vec<FrameErrorRecord> = Vec::new();
    let ctx = RestoringContext::new(
        &tx,
        request.local,
        request.purpose,
        now_ms(),
        info.backup_time_ms,
        media_root_key,
        &bencher,
    );
    tracker.start_phase(ProgressPhase::ImportFrames, opened.file_len);
    let restored = bencher.measure_step("frames", || {
        restore_frames(
            &mut opened,
            archivers,
            &ctx,
            request.strict,
            &mut tracker,
            &mut errors,
            cancel,
        )
    });
    let stats = match restored {
        Ok(stats) => stats,
        Err(BackupError::Cancelled) => {
            warn!("import cancelled; committing frames restored so far");
            recreate_indexes(&tx, &indexes)?;
            drop(ctx);
            tx.commit()?;
            process_errors(&errors);
            return Err(BackupError::Cancelled);
        }
        Err(e) => {
            error!(error = %e, "import failed; rolling back");
            drop(ctx);
            drop(tx);
            let report = process_errors(&errors);
            hooks.present_report(conn, BackupOperation::Import, &report);
            return Err(e);
        }
    };

    tracker.start_phase(ProgressPhase::ImportRecreateIndexes, indexes.len() as u64);
    bencher.measure_step("recreate_indexes", || recreate_indexes(&tx, &indexes))?;
    tracker.complete_phase();

    tracker.start_phase(ProgressPhase::ImportFinalize, 1);
    bencher.measure_step("post_frame_actions", || {
        for action in ctx.take_post_frame_actions() {
            if let Err(e) = hooks.post_frame.handle(&action, &ctx) {
                errors.push(FrameErrorRecord::new(e, false));
            }
        }
    });
    let threads_indexed = bencher.measure_step("index_threads", || {
        hooks.thread_indexer.index_threads(&tx)
    })?;
    hooks.jobs.enqueue_message_indexing(&tx)?;
    state_store.set(&tx, BackupRestoreState::Unfinalized)?;
    if let Some(token) = request.forward_secrecy_token {
        NonceMetadataStore::new().set_last_forward_secrecy_token(&tx, token)?;
    }
    drop(ctx);
    tx.commit()?;
    tracker.complete_phase();

    let report = process_errors(&errors);
    hooks.present_report(conn, BackupOperation::Import, &report);
    bencher.log_results("import");
    info!(
        frames = stats.read,
        restored = stats.restored,
        skipped = stats.skipped,
        errors = report.error_count,
        "import complete"
    );
    Ok(ImportOutcome {
        backup_time_ms: info.backup_time_ms,
        frames_read: stats.read,
        frames_restored: stats.restored,
        frames_skipped: stats.skipped,
        threads_indexed,
        report,
        bench: bencher.summary(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_drop_and_recreate_keeps_catalog() {
        let conn = Connection::open_in_memory().expect("db");
        conn.execute_batch(
            "CREATE TABLE message (id INTEGER PRIMARY KEY, thread_id INTEGER, sent_at INTEGER,
                 body TEXT, UNIQUE (thread_id, sent_at));
             CREATE INDEX message_thread ON message (thread_id, sent_at);
             CREATE INDEX message_body ON message (body) WHERE body IS NOT NULL;
             CREATE TABLE other (x);
             CREATE INDEX other_x ON other (x);",
        )
        .expect("schema");
        let catalog = |conn: &Connection| -> Vec<(String, Option<String>)> {
            let mut stmt = conn
                .prepare("SELECT name, sql FROM sqlite_master WHERE type = 'index' ORDER BY name")
                .expect("prepare");
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .expect("query")
                .collect::<rusqlite::Result<_>>()
                .expect("rows")
        };
        let before = catalog(&conn);

        let dropped = drop_interaction_indexes(&conn).expect("drop");
        let names: Vec<_> = dropped.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["message_body", "message_thread"]);
        let during = catalog(&conn);
        assert!(during.iter().any(|(name, _)| name.starts_with("sqlite_autoindex_message")));
        assert!(during.iter().any(|(name, _)| name == "other_x"));

        recreate_indexes(&conn, &dropped).expect("recreate");
        assert_eq!(catalog(&conn), before);
    }
}
