// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Export a seeded store, move the archive through a transport and restore it
//! into an empty store.

mod common;

use std::sync::Arc;

use backup_archive::prelude::*;
use secret_recovery::mock::MockSecretRecovery;

use common::{TestDirs, config, local_identifiers, manager, seeded_store};

#[test_log::test(tokio::test)]
async fn remote_backup_round_trip() {
    let local = local_identifiers();
    let cancel = CancellationToken::new();
    let svr = Arc::new(MockSecretRecovery::new());
    let dirs = TestDirs::new();
    let backup_key = BackupKey::generate();
    let source_key = KeySource::remote(backup_key.clone());

    let source = seeded_store();
    let exporter = manager(&source, &svr, dirs.transport(), config(dirs.staging.path()));
    let metadata = exporter
        .export_encrypted_backup(&local, &source_key, None, &cancel)
        .await
        .expect("export");
    assert!(metadata.report.is_empty(), "{:?}", metadata.report);
    assert_eq!(metadata.purpose, BackupPurpose::RemoteBackup);
    assert_eq!(metadata.attachment_byte_size, 48_213);
    assert!(metadata.rotation.is_some());
    let receipt = exporter
        .upload_encrypted_backup(&metadata, &cancel)
        .await
        .expect("upload");
    assert_eq!(receipt.len, metadata.encrypted_len);
    let last = exporter.last_backup().await.expect("last backup").expect("recorded");
    assert_eq!(u64::try_from(last.size_bytes).ok(), Some(metadata.encrypted_len));

    let target = LocalStore::open_in_memory().expect("target store");
    let restore_dir = tempfile::tempdir().expect("restore staging");
    let importer = manager(&target, &svr, dirs.transport(), config(restore_dir.path()));
    assert!(!importer.has_restored_from_backup().await.expect("state"));
    let path = importer
        .download_encrypted_backup(&local, &backup_key, &cancel)
        .await
        .expect("download");
    let imported = importer
        .import_encrypted_backup(&path, &local, &source_key, None, &cancel)
        .await
        .expect("import");
    assert!(imported.report.is_empty(), "{:?}", imported.report);
    assert_eq!(imported.threads_indexed, 2);
    assert_eq!(imported.frames_skipped, 0);
    assert_eq!(
        importer.backup_restore_state().await.expect("state"),
        BackupRestoreState::Unfinalized
    );
    assert!(importer.cached_forward_secrecy_token().await.expect("token").is_some());
    assert_eq!(
        source.snapshot().expect("source"),
        target.snapshot().expect("target")
    );

    let finalized = importer.finalize_backup_import(&cancel).await.expect("finalize");
    assert!(!finalized.already_finalized);
    // the contact (profile key) and the group (master key)
    assert_eq!(finalized.avatar_jobs_enqueued, 2);
    assert_eq!(finalized.attachment_jobs_enqueued, 1);
    assert_eq!(
        importer.backup_restore_state().await.expect("state"),
        BackupRestoreState::Finalized
    );
    let again = importer.finalize_backup_import(&cancel).await.expect("finalize again");
    assert!(again.already_finalized);
}

#[test_log::test(tokio::test)]
async fn second_import_is_refused_before_contacting_the_service() {
    let local = local_identifiers();
    let cancel = CancellationToken::new();
    let svr = Arc::new(MockSecretRecovery::new());
    let dirs = TestDirs::new();
    let source_key = KeySource::remote(BackupKey::generate());

    let source = seeded_store();
    let exporter = manager(&source, &svr, dirs.transport(), config(dirs.staging.path()));
    let metadata = exporter
        .export_encrypted_backup(&local, &source_key, None, &cancel)
        .await
        .expect("export");

    let target = LocalStore::open_in_memory().expect("target store");
    let importer = manager(&target, &svr, dirs.transport(), config(dirs.staging.path()));
    importer
        .import_encrypted_backup(&metadata.path, &local, &source_key, None, &cancel)
        .await
        .expect("first import");
    let restore_calls = svr.restore_calls().len();

    let err = importer
        .import_encrypted_backup(&metadata.path, &local, &source_key, None, &cancel)
        .await
        .expect_err("already restored");
    assert!(matches!(
        err,
        BackupError::AlreadyRestored {
            state: BackupRestoreState::Unfinalized
        }
    ));
    assert_eq!(svr.restore_calls().len(), restore_calls);
}

#[test_log::test(tokio::test)]
async fn plaintext_device_transfer_round_trip() {
    let local = local_identifiers();
    let cancel = CancellationToken::new();
    let svr = Arc::new(MockSecretRecovery::new());
    let dirs = TestDirs::new();
    let path = dirs.staging.path().join("transfer.bin");

    let source = seeded_store();
    let exporter = manager(&source, &svr, dirs.transport(), config(dirs.staging.path()));
    let exported = exporter
        .export_plaintext_backup(&path, &local, BackupPurpose::DeviceTransfer, None, &cancel)
        .await
        .expect("export");
    assert_eq!(exported.path, path);
    assert!(exported.frame_count > 0);

    let report = exporter.validate_plaintext_backup(&path).await.expect("validate");
    assert_eq!(report.frame_count, exported.frame_count);

    let target = LocalStore::open_in_memory().expect("target store");
    let importer = manager(&target, &svr, dirs.transport(), config(dirs.staging.path()));
    importer
        .import_plaintext_backup(&path, &local, BackupPurpose::DeviceTransfer, None, &cancel)
        .await
        .expect("import");
    assert_eq!(
        source.snapshot().expect("source"),
        target.snapshot().expect("target")
    );
    assert!(svr.store_calls().is_empty());
    assert!(svr.restore_calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn device_transfer_archives_are_not_uploaded() {
    let local = local_identifiers();
    let cancel = CancellationToken::new();
    let svr = Arc::new(MockSecretRecovery::new());
    let dirs = TestDirs::new();
    let source = KeySource::DeviceTransfer {
        ephemeral: EphemeralBackupKey::generate(),
    };

    let store = seeded_store();
    let exporter = manager(&store, &svr, dirs.transport(), config(dirs.staging.path()));
    let metadata = exporter
        .export_encrypted_backup(&local, &source, None, &cancel)
        .await
        .expect("export");
    assert!(metadata.backup_id.is_none());
    assert!(svr.store_calls().is_empty());

    let err = exporter
        .upload_encrypted_backup(&metadata, &cancel)
        .await
        .expect_err("no upload");
    assert!(matches!(err, BackupError::Other { .. }));

    let report = exporter
        .validate_encrypted_backup(&metadata.path, &local, &source, &cancel)
        .await
        .expect("validate");
    assert!(report.frame_count > 0);
}
