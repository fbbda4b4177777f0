// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Export pipeline.
//!
//! Runs the archivers in a fixed order under one read snapshot and writes their
//! frames to a plaintext or encrypted file. Per-record failures are collected and
//! the export continues; a failure of the account data or local recipient
//! archiver, or a complete failure of any archiver, aborts it and deletes the file.
//! The finished file is read back and validated before the export reports success.

use std::{
    fs,
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use sha2::{Digest, Sha256};
use snafu::prelude::*;
use tracing::{debug, error, info, warn};

use crate::{
    SUPPORTED_BACKUP_VERSION,
    accounting::{AttachmentByteCounter, ProgressPhase, ProgressSink, ProgressTracker},
    archiver::{ArchiveMultiFrameResult, Archivers, FrameSink},
    bench::{BenchSummary, Bencher},
    cancel::CancellationToken,
    collapse::{ErrorReport, process_errors},
    context::{ArchivingContext, BackupPurpose, LocalIdentifiers},
    crypto::ArchiveKey,
    error::{BackupError, FrameWriteSnafu, IoSnafu},
    frame_error::FrameErrorRecord,
    hooks::{BackupOperation, PipelineHooks},
    proto::{BackupInfo, Frame},
    settings::{BackupSettingsStore, LastBackup},
    stream::{ArchiveOutput, FrameWriter, create_archive_file},
    validate::validate_archive_file,
};

/// Everything one export needs besides the store and archivers.
pub struct ExportRequest<'a> {
    pub path: &'a Path,
    pub local: &'a LocalIdentifiers,
    pub purpose: BackupPurpose,
    /// `None` writes a plaintext archive.
    pub key: Option<&'a ArchiveKey>,
    /// Serialized metadata header, written before the ciphertext.
    pub metadata_header: Option<&'a [u8]>,
    pub app_version: &'a str,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

/// A finished, validated export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportOutcome {
    pub path: PathBuf,
    /// Length of the file, metadata header included.
    pub file_len: u64,
    /// Hex SHA-256 of the whole file.
    pub sha256: String,
    pub frame_count: u64,
    /// Total size of the attachments the archive references.
    pub attachment_bytes: u64,
    pub report: ErrorReport,
    pub bench: BenchSummary,
}

/// Frame sink that feeds the benchmark and progress tracker.
struct MeteredSink<'a, W: Write> {
    writer: &'a mut FrameWriter<W>,
    tracker: &'a mut ProgressTracker,
    bencher: &'a Bencher,
    last_frame_at: Instant,
}

impl<W: Write> FrameSink for MeteredSink<'_, W> {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.writer.write_frame(frame)?;
        let now = Instant::now();
        // time since the previous frame covers reading local state as well
        self.bencher
            .record_frame(frame.kind(), now.duration_since(self.last_frame_at));
        self.last_frame_at = now;
        self.tracker.advance(self.writer.frames_written());
        Ok(())
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed incomplete archive"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove incomplete archive"),
    }
}

/// Record an archiver result. `Err` carries the fatal error that ends the export.
fn record_multi(
    name: &str,
    result: ArchiveMultiFrameResult,
    errors: &mut Vec<FrameErrorRecord>,
) -> Result<(), String> {
    match result {
        ArchiveMultiFrameResult::Success => Ok(()),
        ArchiveMultiFrameResult::PartialSuccess(partial) => {
            debug!(archiver = name, errors = partial.len(), "partial success");
            errors.extend(partial.into_iter().map(|e| FrameErrorRecord::new(e, false)));
            Ok(())
        }
        ArchiveMultiFrameResult::CompleteFailure(fatal) => {
            let message = format!("{name}: {}", fatal.message());
            errors.push(FrameErrorRecord::new(fatal, true));
            Err(message)
        }
    }
}

enum Abort {
    Failed(String),
    Error(BackupError),
}

impl From<BackupError> for Abort {
    fn from(e: BackupError) -> Self {
        Self::Error(e)
    }
}

/// Run every archiver in order.
fn archive_all<W: Write>(
    archivers: &Archivers,
    sink: &mut MeteredSink<'_, W>,
    ctx: &ArchivingContext<'_>,
    errors: &mut Vec<FrameErrorRecord>,
    cancel: &CancellationToken,
) -> Result<(), Abort> {
    let bencher = ctx.bencher;

    bencher
        .measure_step("account_data", || archivers.account_data.archive(sink, ctx))
        .map_err(|e| {
            let message = e.to_string();
            errors.push(FrameErrorRecord::new(e, true));
            Abort::Failed(message)
        })?;
    cancel.check()?;

    let local = bencher
        .measure_step("local_recipient", || archivers.local_recipient.archive(sink, ctx))
        .map_err(|e| {
            let message = e.to_string();
            errors.push(FrameErrorRecord::new(e, true));
            Abort::Failed(message)
        })?;
    ctx.set_local_recipient(local);
    cancel.check()?;

    macro_rules! run {
        ($name:literal, $archiver:expr) => {{
            let result = bencher.measure_step($name, || $archiver.archive(sink, ctx));
            record_multi($name, result, errors).map_err(Abort::Failed)?;
            cancel.check()?;
        }};
    }
    run!("release_notes", archivers.release_notes);
    run!("contacts", archivers.contacts);
    run!("groups", archivers.groups);
    run!("distribution_lists", archivers.distribution_lists);
    run!("call_links", archivers.call_links);
    run!("chats", archivers.chats);
    run!("chat_items", archivers.chat_items);
    run!("sticker_packs", archivers.sticker_packs);
    run!("ad_hoc_calls", archivers.ad_hoc_calls);
    Ok(())
}

/// Seal the stream and flush the file to disk.
fn finish_output(path: &Path, writer: FrameWriter<ArchiveOutput<BufWriter<fs::File>>>) -> Result<(), BackupError> {
    let buffered = writer.into_inner().finish().context(FrameWriteSnafu)?;
    let file = buffered
        .into_inner()
        .map_err(io::IntoInnerError::into_error)
        .context(IoSnafu { path })?;
    file.sync_all().context(IoSnafu { path })
}

/// Length and hex SHA-256 of a file.
pub fn file_digest(path: &Path) -> Result<(u64, String), BackupError> {
    let mut file = fs::File::open(path).context(IoSnafu { path })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut len = 0u64;
    loop {
        let n = file.read(&mut buf).context(IoSnafu { path })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((len, hex::encode(hasher.finalize())))
}

/// Export the store into `request.path`.
///
/// Blocking; call from `spawn_blocking`.
pub fn export_backup(
    conn: &mut Connection,
    archivers: &Archivers,
    hooks: &PipelineHooks,
    request: &ExportRequest<'_>,
    cancel: &CancellationToken,
) -> Result<ExportOutcome, BackupError> {
    let settings = BackupSettingsStore::new();
    let bencher = Bencher::new();
    let byte_counter = AttachmentByteCounter::default();
    let mut tracker = ProgressTracker::export(request.progress.clone());
    let start_ms = now_ms();
    info!(purpose = %request.purpose, encrypted = request.key.is_some(), "starting export");

    tracker.start_phase(ProgressPhase::ExportMigration, 2);
    cancel.check()?;
    bencher.measure_step("attachment_migration", || {
        hooks.preparation.run_attachment_migration(conn, cancel)
    })?;
    tracker.advance(1);
    cancel.check()?;
    bencher.measure_step("oversize_text", || hooks.preparation.stage_oversize_text(conn, cancel))?;
    tracker.complete_phase();
    cancel.check()?;

    let (media_root_key, upload_era, first_app_version) = {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let key = settings.get_or_create_media_root_backup_key(&tx)?;
        let era = settings.get_or_create_upload_era(&tx)?;
        let first = settings.get_or_set_first_app_version(&tx, request.app_version)?;
        tx.commit()?;
        (key, era, first)
    };

    let mut errors: Vec<FrameErrorRecord> = Vec::new();
    let frame_count = {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let estimate = hooks.frame_estimator.estimate_frame_count(&tx)?;
        tracker.start_phase(ProgressPhase::ExportFrames, estimate);

        let output = create_archive_file(request.path, request.key, request.metadata_header)?;
        let mut writer = FrameWriter::new(output);
        let info = BackupInfo {
            version: SUPPORTED_BACKUP_VERSION,
            backup_time_ms: start_ms,
            media_root_backup_key: media_root_key.as_bytes().to_vec(),
            current_app_version: request.app_version.to_string(),
            first_app_version,
        };
        if let Err(e) = writer.write_backup_info(&info) {
            drop(writer);
            remove_partial(request.path);
            return Err(BackupError::FrameWrite { source: e });
        }

        let ctx = ArchivingContext::new(
            &tx,
            request.local,
            request.purpose,
            start_ms,
            upload_era,
            &byte_counter,
            &bencher,
        );
        let mut sink = MeteredSink {
            writer: &mut writer,
            tracker: &mut tracker,
            bencher: &bencher,
            last_frame_at: Instant::now(),
        };
        let archived = archive_all(archivers, &mut sink, &ctx, &mut errors, cancel);
        drop(ctx);
        // read-only; nothing to commit
        drop(tx);

        match archived {
            Ok(()) => {}
            Err(abort) => {
                drop(writer);
                remove_partial(request.path);
                let report = process_errors(&errors);
                hooks.present_report(conn, BackupOperation::Export, &report);
                return Err(match abort {
                    Abort::Failed(message) => {
                        error!(%message, "export aborted");
                        BackupError::ExportFailed { message }
                    }
                    Abort::Error(e) => e,
                });
            }
        }
        let frame_count = writer.frames_written();
        if let Err(e) = finish_output(request.path, writer) {
            remove_partial(request.path);
            return Err(e);
        }
        frame_count
    };
    tracker.complete_phase();

    let report = process_errors(&errors);
    hooks.present_report(conn, BackupOperation::Export, &report);

    let header_len = request.metadata_header.map_or(0, |h| h.len() as u64);
    if let Err(source) = bencher.measure_step("validate", || {
        validate_archive_file(request.path, request.key, header_len)
    }) {
        error!(error = %source, "exported archive failed validation");
        if let Err(e) = hooks.presenter.present_validation_error(conn, &source) {
            warn!(error = %e, "could not record validation error");
        }
        remove_partial(request.path);
        return Err(BackupError::Validation { source });
    }

    let (file_len, sha256) = file_digest(request.path)?;
    settings.set_last_backup(
        conn,
        LastBackup {
            time_ms: i64::try_from(start_ms).unwrap_or(i64::MAX),
            size_bytes: i64::try_from(file_len).unwrap_or(i64::MAX),
        },
    )?;
    bencher.log_results("export");
    info!(
        frames = frame_count,
        bytes = file_len,
        attachments = byte_counter.attachment_count(),
        errors = report.error_count,
        "export complete"
    );
    Ok(ExportOutcome {
        path: request.path.to_path_buf(),
        file_len,
        sha256,
        frame_count,
        attachment_bytes: byte_counter.total_bytes(),
        report,
        bench: bencher.summary(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archiver::{
            AccountDataArchiver, ArchiveSingleFrameResult, FrameArchiver, LocalRecipientArchiver,
            RecipientArchiver, RestoreFrameResult, write_frame,
        },
        context::{RecipientId, RestoringContext},
        frame_error::{ArchiveFrameError, ArchiveFrameErrorKind, FatalArchivingError, LoggableId},
        kv::KeyValueStore,
        proto::{
            AccountData, AdHocCall, CallLink, Chat, ChatItem, Contact, DistributionListItem, Group,
            Recipient, ReleaseNotes, SelfRecipient, StickerPack, frame, recipient,
        },
        stream::open_archive_file,
    };

    struct Account;
    impl AccountDataArchiver for Account {
        fn archive(&self, sink: &mut dyn FrameSink, _: &ArchivingContext<'_>) -> ArchiveSingleFrameResult<()> {
            let frame = Frame::new(frame::Item::Account(AccountData::default()));
            write_frame(sink, &frame, LoggableId::account_data)
        }
        fn restore(&self, _: &AccountData, _: &RestoringContext<'_>) -> RestoreFrameResult<()> {
            RestoreFrameResult::Success(())
        }
    }

    struct LocalSelf;
    impl LocalRecipientArchiver for LocalSelf {
        fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveSingleFrameResult<RecipientId> {
            let id = ctx.assign_recipient_id(1);
            let frame = Frame::new(frame::Item::Recipient(Recipient {
                id: id.0,
                destination: Some(recipient::Destination::SelfRecipient(SelfRecipient {})),
            }));
            write_frame(sink, &frame, || LoggableId::recipient(id.0))?;
            Ok(id)
        }
        fn restore(&self, _: RecipientId, _: &SelfRecipient, _: &RestoringContext<'_>) -> RestoreFrameResult<()> {
            RestoreFrameResult::Success(())
        }
    }

    /// Writes `count` sticker packs, failing the ones in `skip`.
    struct Stickers {
        count: u8,
        skip: Vec<u8>,
        fatal: bool,
    }
    impl FrameArchiver<StickerPack> for Stickers {
        fn archive(&self, sink: &mut dyn FrameSink, _: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
            if self.fatal {
                return ArchiveMultiFrameResult::CompleteFailure(FatalArchivingError::new("query failed"));
            }
            let mut errors = Vec::new();
            for n in 0..self.count {
                if self.skip.contains(&n) {
                    errors.push(ArchiveFrameError::new(
                        ArchiveFrameErrorKind::InvalidLocalData("bad key".into()),
                        LoggableId::sticker_pack(&[n]),
                    ));
                    continue;
                }
                let frame = Frame::new(frame::Item::StickerPack(StickerPack {
                    pack_id: vec![n; 16],
                    pack_key: vec![n; 32],
                }));
                if let Err(e) = write_frame(sink, &frame, || LoggableId::sticker_pack(&[n])) {
                    errors.push(e);
                }
            }
            ArchiveMultiFrameResult::from_errors(errors)
        }
        fn restore(&self, _: &StickerPack, _: &RestoringContext<'_>) -> RestoreFrameResult<()> {
            RestoreFrameResult::Success(())
        }
    }

    struct Nothing;
    impl<P> RecipientArchiver<P> for Nothing {
        fn archive(&self, _: &mut dyn FrameSink, _: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
            ArchiveMultiFrameResult::Success
        }
        fn restore(&self, _: RecipientId, _: &P, _: &RestoringContext<'_>) -> RestoreFrameResult<()> {
            RestoreFrameResult::Success(())
        }
    }
    impl<P> FrameArchiver<P> for Nothing {
        fn archive(&self, _: &mut dyn FrameSink, _: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
            ArchiveMultiFrameResult::Success
        }
        fn restore(&self, _: &P, _: &RestoringContext<'_>) -> RestoreFrameResult<()> {
            RestoreFrameResult::Success(())
        }
    }

    fn archivers(stickers: Stickers) -> Archivers {
        Archivers {
            account_data: Box::new(Account),
            local_recipient: Box::new(LocalSelf),
            release_notes: Box::new(Nothing) as Box<dyn RecipientArchiver<ReleaseNotes>>,
            contacts: Box::new(Nothing) as Box<dyn RecipientArchiver<Contact>>,
            groups: Box::new(Nothing) as Box<dyn RecipientArchiver<Group>>,
            distribution_lists: Box::new(Nothing) as Box<dyn RecipientArchiver<DistributionListItem>>,
            call_links: Box::new(Nothing) as Box<dyn RecipientArchiver<CallLink>>,
            chats: Box::new(Nothing) as Box<dyn FrameArchiver<Chat>>,
            chat_items: Box::new(Nothing) as Box<dyn FrameArchiver<ChatItem>>,
            sticker_packs: Box::new(stickers),
            ad_hoc_calls: Box::new(Nothing) as Box<dyn FrameArchiver<AdHocCall>>,
        }
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("db");
        KeyValueStore::ensure_schema(&conn).expect("schema");
        conn
    }

    #[test_log::test]
    fn partial_success_continues_and_validates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("export.bin");
        let key = ArchiveKey::generate();
        let local = LocalIdentifiers::new("acct", None);
        let mut conn = conn();
        let request = ExportRequest {
            path: &path,
            local: &local,
            purpose: BackupPurpose::DeviceTransfer,
            key: Some(&key),
            metadata_header: None,
            app_version: "1.0",
            progress: None,
        };
        let outcome = export_backup(
            &mut conn,
            &archivers(Stickers { count: 5, skip: vec![2], fatal: false }),
            &PipelineHooks::noop(),
            &request,
            &CancellationToken::new(),
        )
        .expect("export");
        // account + self + 4 stickers
        assert_eq!(outcome.frame_count, 6);
        assert_eq!(outcome.report.error_count, 1);
        assert!(!outcome.report.dropped_frames);
        assert!(!outcome.report.should_present());

        let mut opened = open_archive_file(&path, Some(&key), 0).expect("open");
        let info = opened.reader.read_backup_info().expect("info");
        assert_eq!(info.version, SUPPORTED_BACKUP_VERSION);
        assert_eq!(info.media_root_backup_key.len(), 32);
        let (len, digest) = file_digest(&path).expect("digest");
        assert_eq!(len, outcome.file_len);
        assert_eq!(digest, outcome.sha256);
    }

    #[test_log::test]
    fn complete_failure_aborts_and_deletes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("export.bin");
        let local = LocalIdentifiers::new("acct", None);
        let mut conn = conn();
        let request = ExportRequest {
            path: &path,
            local: &local,
            purpose: BackupPurpose::RemoteBackup,
            key: None,
            metadata_header: None,
            app_version: "1.0",
            progress: None,
        };
        let err = export_backup(
            &mut conn,
            &archivers(Stickers { count: 1, skip: vec![], fatal: true }),
            &PipelineHooks::noop(),
            &request,
            &CancellationToken::new(),
        )
        .expect_err("aborted");
        assert!(matches!(err, BackupError::ExportFailed { message } if message.contains("query failed")));
        assert!(!path.exists());
    }

    #[test_log::test]
    fn cancelled_before_start_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("export.bin");
        let local = LocalIdentifiers::new("acct", None);
        let mut conn = conn();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = ExportRequest {
            path: &path,
            local: &local,
            purpose: BackupPurpose::RemoteBackup,
            key: None,
            metadata_header: None,
            app_version: "1.0",
            progress: None,
        };
        let err = export_backup(
            &mut conn,
            &archivers(Stickers { count: 1, skip: vec![], fatal: false }),
            &PipelineHooks::noop(),
            &request,
            &cancel,
        )
        .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert!(!path.exists());
    }
}
