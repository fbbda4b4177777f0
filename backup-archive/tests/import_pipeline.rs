// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Import behavior on damaged archives: per-frame failures, fatal records,
//! strict mode and cancellation.

mod common;

use std::{path::Path, sync::Arc};

use backup_archive::{
    prelude::*,
    proto::{
        AccountData, AdHocCall, Chat, ChatItem, Contact, Frame, Recipient, SelfRecipient,
        StandardMessage, StickerPack, Text, chat_item, frame, recipient,
    },
    stream::{FrameWriter, create_archive_file},
};
use secret_recovery::mock::MockSecretRecovery;

use common::{CONTACT_ACI, PROFILE_KEY, TestDirs, TestManager, config, local_identifiers};

const SENT_AT: u64 = 1_700_000_000_000;

fn write_plaintext_archive(path: &Path, frames: &[Frame]) {
    use backup_archive::archiver::FrameSink;

    let output = create_archive_file(path, None, None).expect("create");
    let mut writer = FrameWriter::new(output);
    writer
        .write_backup_info(&backup_archive::proto::BackupInfo {
            version: SUPPORTED_BACKUP_VERSION,
            backup_time_ms: SENT_AT,
            media_root_backup_key: vec![3; 32],
            current_app_version: "test-1.0".to_string(),
            first_app_version: "test-0.9".to_string(),
        })
        .expect("info");
    for frame in frames {
        writer.write_frame(frame).expect("frame");
    }
    writer.into_inner().finish().expect("finish");
}

fn account(profile_key: &[u8]) -> Frame {
    Frame::new(frame::Item::Account(AccountData {
        profile_key: profile_key.to_vec(),
        given_name: "Alice".to_string(),
        ..AccountData::default()
    }))
}

fn recipient(id: u64, destination: recipient::Destination) -> Frame {
    Frame::new(frame::Item::Recipient(Recipient {
        id,
        destination: Some(destination),
    }))
}

fn contact(e164: u64) -> recipient::Destination {
    let aci = hex::decode(CONTACT_ACI.replace('-', "")).expect("aci hex");
    recipient::Destination::Contact(Contact {
        aci: Some(aci),
        e164: Some(e164),
        profile_given_name: Some("Bob".to_string()),
        ..Contact::default()
    })
}

fn chat(id: u64, recipient_id: u64) -> Frame {
    Frame::new(frame::Item::Chat(Chat {
        id,
        recipient_id,
        ..Chat::default()
    }))
}

fn text_message(chat_id: u64, author_id: u64, offset: u64, body: &str) -> Frame {
    Frame::new(frame::Item::ChatItem(ChatItem {
        chat_id,
        author_id,
        date_sent: SENT_AT + offset,
        direction: 1,
        item: Some(chat_item::Item::StandardMessage(StandardMessage {
            text: Some(Text {
                body: body.to_string(),
            }),
            attachments: Vec::new(),
        })),
        ..ChatItem::default()
    }))
}

/// Account, self (1), Bob (2) with an out-of-range phone number, a chat with Bob,
/// one good message and three records that cannot be restored.
fn damaged_archive() -> Vec<Frame> {
    vec![
        account(&PROFILE_KEY),
        recipient(1, recipient::Destination::SelfRecipient(SelfRecipient {})),
        recipient(2, contact(12)),
        chat(1, 2),
        text_message(1, 2, 0, "hello"),
        // unknown chat
        text_message(99, 2, 1, "lost"),
        Frame::new(frame::Item::StickerPack(StickerPack {
            pack_id: vec![1; 16],
            pack_key: vec![2; 3],
        })),
        // a call must belong to a call link
        Frame::new(frame::Item::AdHocCall(AdHocCall {
            call_id: 5,
            recipient_id: 2,
            state: 1,
            call_timestamp: SENT_AT,
        })),
    ]
}

struct Fixture {
    dirs: TestDirs,
    store: LocalStore,
    manager: TestManager,
}

fn fixture(strict: bool) -> Fixture {
    let dirs = TestDirs::new();
    let store = LocalStore::open_in_memory().expect("store");
    let svr = Arc::new(MockSecretRecovery::new());
    let manager = common::manager(
        &store,
        &svr,
        dirs.transport(),
        config(dirs.staging.path()).strict_restore(strict),
    );
    Fixture { dirs, store, manager }
}

fn count(store: &LocalStore, sql: &str) -> i64 {
    let conn = store.connection();
    let conn = conn.lock();
    conn.query_row(sql, [], |row| row.get(0)).expect("count")
}

#[test_log::test(tokio::test)]
async fn failed_frames_are_dropped_and_import_continues() {
    let fx = fixture(false);
    let path = fx.dirs.staging.path().join("damaged.bin");
    write_plaintext_archive(&path, &damaged_archive());

    let outcome = fx
        .manager
        .import_plaintext_backup(
            &path,
            &local_identifiers(),
            BackupPurpose::RemoteBackup,
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("import");

    assert_eq!(outcome.frames_read, 8);
    assert_eq!(outcome.frames_restored, 5);
    assert_eq!(outcome.report.error_count, 4);
    assert!(outcome.report.dropped_frames);
    assert_eq!(outcome.report.max_level, Some(LogLevel::Error));
    assert_eq!(
        fx.manager.backup_restore_state().await.expect("state"),
        BackupRestoreState::Unfinalized
    );

    // Bob is kept without the bad number
    assert_eq!(
        count(&fx.store, "SELECT COUNT(*) FROM recipient WHERE kind = 'contact' AND e164 IS NULL"),
        1
    );
    assert_eq!(count(&fx.store, "SELECT COUNT(*) FROM message"), 1);
    assert_eq!(count(&fx.store, "SELECT COUNT(*) FROM sticker_pack"), 0);
    assert_eq!(
        count(&fx.store, "SELECT COUNT(*) FROM thread WHERE last_message_id IS NOT NULL"),
        1
    );
    assert_eq!(
        count(&fx.store, "SELECT COUNT(*) FROM backup_error_log WHERE operation = 'import'"),
        1
    );
    // indexes dropped for the import are back
    assert_eq!(
        count(
            &fx.store,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'message_thread_sent'"
        ),
        1
    );
}

#[test_log::test(tokio::test)]
async fn bad_account_data_rolls_back_everything() {
    let fx = fixture(false);
    let path = fx.dirs.staging.path().join("no-profile-key.bin");
    let mut frames = damaged_archive();
    frames[0] = account(&[1, 2, 3]);
    write_plaintext_archive(&path, &frames);

    let err = fx
        .manager
        .import_plaintext_backup(
            &path,
            &local_identifiers(),
            BackupPurpose::RemoteBackup,
            None,
            &CancellationToken::new(),
        )
        .await
        .expect_err("fatal account data");
    assert!(matches!(err, BackupError::ImportFailed { .. }), "{err}");
    assert_eq!(
        fx.manager.backup_restore_state().await.expect("state"),
        BackupRestoreState::None
    );
    assert_eq!(count(&fx.store, "SELECT COUNT(*) FROM account"), 0);
    assert_eq!(count(&fx.store, "SELECT COUNT(*) FROM recipient"), 0);
    assert_eq!(count(&fx.store, "SELECT COUNT(*) FROM backup_error_log"), 1);
}

#[test_log::test(tokio::test)]
async fn strict_mode_aborts_on_first_failure() {
    let fx = fixture(true);
    let path = fx.dirs.staging.path().join("damaged.bin");
    write_plaintext_archive(&path, &damaged_archive());

    let err = fx
        .manager
        .import_plaintext_backup(
            &path,
            &local_identifiers(),
            BackupPurpose::RemoteBackup,
            None,
            &CancellationToken::new(),
        )
        .await
        .expect_err("strict");
    assert!(matches!(err, BackupError::ImportFailed { .. }), "{err}");
    assert_eq!(count(&fx.store, "SELECT COUNT(*) FROM message"), 0);
    assert_eq!(
        fx.manager.backup_restore_state().await.expect("state"),
        BackupRestoreState::None
    );
}

#[test_log::test(tokio::test)]
async fn cancelled_import_keeps_restored_frames() {
    let fx = fixture(false);
    let path = fx.dirs.staging.path().join("damaged.bin");
    write_plaintext_archive(&path, &damaged_archive());

    let cancel = CancellationToken::new();
    let progress: Arc<dyn ProgressSink> = {
        let cancel = cancel.clone();
        Arc::new(move |update: ProgressUpdate| {
            if update.phase == ProgressPhase::ImportFrames && update.completed > 0 {
                cancel.cancel();
            }
        })
    };
    let err = fx
        .manager
        .import_plaintext_backup(
            &path,
            &local_identifiers(),
            BackupPurpose::RemoteBackup,
            Some(progress),
            &cancel,
        )
        .await
        .expect_err("cancelled");
    assert!(matches!(err, BackupError::Cancelled));

    // the frame being restored when cancellation arrived is committed
    assert_eq!(count(&fx.store, "SELECT COUNT(*) FROM account"), 1);
    assert_eq!(
        fx.manager.backup_restore_state().await.expect("state"),
        BackupRestoreState::None
    );
}

#[test_log::test(tokio::test)]
async fn cancellation_before_start_touches_nothing() {
    let fx = fixture(false);
    let path = fx.dirs.staging.path().join("damaged.bin");
    write_plaintext_archive(&path, &damaged_archive());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fx
        .manager
        .import_plaintext_backup(&path, &local_identifiers(), BackupPurpose::RemoteBackup, None, &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, BackupError::Cancelled));
    assert_eq!(count(&fx.store, "SELECT COUNT(*) FROM account"), 0);
}
