// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! The secret chain only advances once an archive has actually been uploaded.

mod common;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use backup_archive::{nonce_store::NonceMetadataStore, prelude::*};
use secret_recovery::{error::SvrError, mock::MockSecretRecovery};

use common::{TestDirs, config, local_identifiers, seeded_store};

/// Transport whose uploads are always refused.
struct RejectingTransport;

impl BackupTransport for RejectingTransport {
    async fn upload(&self, _path: &Path, _backup_id: &BackupId) -> Result<UploadReceipt, TransportError> {
        Err(TransportError::Rejected {
            message: "quota exceeded".to_string(),
        })
    }

    async fn download(&self, backup_id: &BackupId, _dest_dir: &Path) -> Result<PathBuf, TransportError> {
        Err(TransportError::BackupNotFound {
            backup_id: backup_id.to_string(),
        })
    }
}

fn next_secret(store: &LocalStore) -> Option<Vec<u8>> {
    let conn = store.connection();
    let conn = conn.lock();
    NonceMetadataStore::new()
        .next_secret_metadata(&conn)
        .expect("nonce store")
}

fn last_token(store: &LocalStore) -> Option<ForwardSecrecyToken> {
    let conn = store.connection();
    let conn = conn.lock();
    NonceMetadataStore::new()
        .last_forward_secrecy_token(&conn)
        .expect("nonce store")
}

#[test_log::test(tokio::test)]
async fn failed_upload_leaves_chain_untouched() {
    let local = local_identifiers();
    let cancel = CancellationToken::new();
    let svr = Arc::new(MockSecretRecovery::new());
    let dirs = TestDirs::new();
    let source = KeySource::remote(BackupKey::generate());
    let store = seeded_store();

    let rejecting = BackupArchiveManager::new(
        store.connection(),
        store.archivers(),
        store.hooks(),
        Arc::clone(&svr),
        RejectingTransport,
        config(dirs.staging.path()),
    );
    let metadata = rejecting
        .export_encrypted_backup(&local, &source, None, &cancel)
        .await
        .expect("export");
    let err = rejecting
        .upload_encrypted_backup(&metadata, &cancel)
        .await
        .expect_err("upload rejected");
    assert!(matches!(err, BackupError::Transport { .. }));
    assert_eq!(next_secret(&store), None);
    assert!(rejecting.cached_forward_secrecy_token().await.expect("token").is_none());

    let uploading = common::manager(&store, &svr, dirs.transport(), config(dirs.staging.path()));
    uploading
        .upload_encrypted_backup(&metadata, &cancel)
        .await
        .expect("upload");
    let rotation = metadata.rotation.as_ref().expect("rotation");
    assert_eq!(next_secret(&store), Some(rotation.next_secret_metadata.clone()));

    // the next export continues the chain from the committed seed
    uploading
        .export_encrypted_backup(&local, &source, None, &cancel)
        .await
        .expect("second export");
    let stores = svr.store_calls();
    assert_eq!(stores.len(), 2);
    assert_eq!(stores[0].previous_secret_data, None);
    assert_eq!(
        stores[1].previous_secret_data.as_deref(),
        Some(rotation.next_secret_metadata.as_slice())
    );
}

#[test_log::test(tokio::test)]
async fn rejected_chain_is_restarted_once() {
    let local = local_identifiers();
    let cancel = CancellationToken::new();
    let svr = Arc::new(MockSecretRecovery::new());
    let dirs = TestDirs::new();
    let source = KeySource::remote(BackupKey::generate());
    let store = seeded_store();
    {
        let conn = store.connection();
        let conn = conn.lock();
        NonceMetadataStore::new()
            .set_next_secret_metadata(&conn, b"stale seed")
            .expect("seed");
    }
    svr.push_store_error(SvrError::InvalidArgument {
        message: "previous secret data mismatch".to_string(),
    });

    let manager = common::manager(&store, &svr, dirs.transport(), config(dirs.staging.path()));
    let metadata = manager
        .export_encrypted_backup(&local, &source, None, &cancel)
        .await
        .expect("export after restart");
    assert!(metadata.rotation.is_some());
    let stores = svr.store_calls();
    assert_eq!(stores.len(), 2);
    assert_eq!(stores[0].previous_secret_data.as_deref(), Some(&b"stale seed"[..]));
    assert_eq!(stores[1].previous_secret_data, None);
    // the stale seed is gone even though nothing was uploaded yet
    assert_eq!(next_secret(&store), None);
}

#[test_log::test(tokio::test)]
async fn import_without_chain_cannot_decrypt() {
    let local = local_identifiers();
    let cancel = CancellationToken::new();
    let svr = Arc::new(MockSecretRecovery::new());
    let dirs = TestDirs::new();
    let source = KeySource::remote(BackupKey::generate());

    let exporter = common::manager(&seeded_store(), &svr, dirs.transport(), config(dirs.staging.path()));
    let metadata = exporter
        .export_encrypted_backup(&local, &source, None, &cancel)
        .await
        .expect("export");
    svr.forget_chain();

    let target = LocalStore::open_in_memory().expect("target");
    let importer = common::manager(&target, &svr, dirs.transport(), config(dirs.staging.path()));
    // without the token the derived key does not match the archive
    importer
        .import_encrypted_backup(&metadata.path, &local, &source, None, &cancel)
        .await
        .expect_err("wrong key");
    assert_eq!(svr.restore_calls().len(), 1);
    assert_eq!(
        importer.backup_restore_state().await.expect("state"),
        BackupRestoreState::None
    );
}

#[test_log::test(tokio::test)]
async fn validating_an_export_before_a_failed_upload_keeps_the_chain() {
    let local = local_identifiers();
    let cancel = CancellationToken::new();
    let svr = Arc::new(MockSecretRecovery::new());
    let dirs = TestDirs::new();
    let source = KeySource::remote(BackupKey::generate());
    let store = seeded_store();

    let uploading = common::manager(&store, &svr, dirs.transport(), config(dirs.staging.path()));
    let first = uploading
        .export_encrypted_backup(&local, &source, None, &cancel)
        .await
        .expect("first export");
    uploading
        .upload_encrypted_backup(&first, &cancel)
        .await
        .expect("first upload");
    let token_before = last_token(&store);
    let seed_before = next_secret(&store);
    assert!(token_before.is_some());
    assert!(seed_before.is_some());

    let rejecting = BackupArchiveManager::new(
        store.connection(),
        store.archivers(),
        store.hooks(),
        Arc::clone(&svr),
        RejectingTransport,
        config(dirs.staging.path()),
    );
    let second = rejecting
        .export_encrypted_backup(&local, &source, None, &cancel)
        .await
        .expect("second export");
    let report = rejecting
        .validate_encrypted_backup(&second.path, &local, &source, &cancel)
        .await
        .expect("validate");
    assert!(report.frame_count > 0);
    assert_eq!(svr.restore_calls().len(), 1);
    rejecting
        .upload_encrypted_backup(&second, &cancel)
        .await
        .expect_err("upload rejected");

    assert_eq!(last_token(&store), token_before);
    assert_eq!(next_secret(&store), seed_before);
    assert_eq!(
        rejecting.cached_forward_secrecy_token().await.expect("token"),
        token_before
    );
}

#[test_log::test(tokio::test)]
async fn failed_import_keeps_restored_seed_but_not_token() {
    let local = local_identifiers();
    let cancel = CancellationToken::new();
    let svr = Arc::new(MockSecretRecovery::new());
    let dirs = TestDirs::new();
    let source = KeySource::remote(BackupKey::generate());

    let exporter = common::manager(&seeded_store(), &svr, dirs.transport(), config(dirs.staging.path()));
    let metadata = exporter
        .export_encrypted_backup(&local, &source, None, &cancel)
        .await
        .expect("export");
    let bytes = std::fs::read(&metadata.path).expect("read archive");
    std::fs::write(&metadata.path, &bytes[..bytes.len() / 2]).expect("truncate archive");

    let target = LocalStore::open_in_memory().expect("target");
    let importer = common::manager(&target, &svr, dirs.transport(), config(dirs.staging.path()));
    importer
        .import_encrypted_backup(&metadata.path, &local, &source, None, &cancel)
        .await
        .expect_err("truncated archive");
    assert_eq!(svr.restore_calls().len(), 1);
    assert!(next_secret(&target).is_some());
    assert_eq!(last_token(&target), None);
    assert_eq!(
        importer.backup_restore_state().await.expect("state"),
        BackupRestoreState::None
    );
}
