// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the backup-archive integration tests:
//! - seeded reference stores
//! - managers wired to the in-memory secret recovery mock and a directory transport
#![allow(dead_code)]

use std::{path::Path, sync::Arc};

use backup_archive::prelude::*;
use secret_recovery::mock::MockSecretRecovery;
use tempfile::TempDir;

pub const LOCAL_ACI: &str = "5b3c1a6e-0000-4000-8000-000000000001";
pub const LOCAL_E164: &str = "+15555550100";
pub const CONTACT_ACI: &str = "11111111-2222-4333-8444-555555555555";
pub const PROFILE_KEY: [u8; 32] = [7; 32];

pub type TestManager =
    BackupArchiveManager<Arc<MockSecretRecovery>, Arc<LocalDirectoryTransport>>;

pub fn local_identifiers() -> LocalIdentifiers {
    LocalIdentifiers::new(LOCAL_ACI, Some(LOCAL_E164))
}

/// A store holding one of every record kind the reference archivers handle.
pub fn seeded_store() -> LocalStore {
    let store = LocalStore::open_in_memory().expect("open store");
    store
        .init_account(&local_identifiers(), &PROFILE_KEY, "Alice")
        .expect("init account");
    let conn = store.connection();
    let conn = conn.lock();
    conn.execute_batch(&format!(
        "INSERT INTO recipient (id, kind, aci, e164, profile_given_name, profile_key)
             VALUES (10, 'contact', '{CONTACT_ACI}', 15555550101, 'Bob', zeroblob(32));
         INSERT INTO recipient (id, kind, group_master_key, title)
             VALUES (11, 'group', randomblob(32), 'Climbing');
         INSERT INTO recipient (id, kind, distribution_id, title)
             VALUES (12, 'distribution_list', randomblob(16), 'Close friends');
         INSERT INTO distribution_list_member (list_id, member_id) VALUES (12, 10);
         INSERT INTO recipient (id, kind, call_link_root_key, title)
             VALUES (13, 'call_link', randomblob(16), 'Standup');
         INSERT INTO thread (id, recipient_id) VALUES (20, 10);
         INSERT INTO thread (id, recipient_id, pinned_order) VALUES (21, 11, 1);
         INSERT INTO message (id, thread_id, author_id, sent_at_ms, direction, body)
             VALUES (30, 20, 10, 1700000000000, 1, 'are we still on for saturday?');
         INSERT INTO message (id, thread_id, author_id, sent_at_ms, direction, body)
             VALUES (31, 20, (SELECT id FROM recipient WHERE kind = 'self_recipient'),
                     1700000060000, 2, 'yes, 9am');
         INSERT INTO message (id, thread_id, author_id, sent_at_ms, direction, body)
             VALUES (32, 21, 10, 1700000120000, 1, 'route photo');
         INSERT INTO attachment (id, media_name, size, content_type, digest, downloaded)
             VALUES (40, 'media-route', 48213, 'image/jpeg', randomblob(32), 1);
         INSERT INTO message_attachment (message_id, attachment_id, position) VALUES (32, 40, 0);
         INSERT INTO sticker_pack (pack_id, pack_key) VALUES (randomblob(16), randomblob(32));
         INSERT INTO call_record (call_id, recipient_id, state, timestamp_ms)
             VALUES (77, 13, 1, 1700000200000);"
    ))
    .expect("seed store");
    store
}

/// Directories shared by the two sides of a backup.
pub struct TestDirs {
    pub staging: TempDir,
    pub remote: TempDir,
}

impl TestDirs {
    pub fn new() -> Self {
        Self {
            staging: tempfile::tempdir().expect("staging dir"),
            remote: tempfile::tempdir().expect("remote dir"),
        }
    }

    pub fn transport(&self) -> Arc<LocalDirectoryTransport> {
        Arc::new(LocalDirectoryTransport::new(self.remote.path()))
    }
}

pub fn config(staging: &Path) -> ManagerConfig {
    ManagerConfig::default()
        .strict_restore(false)
        .staging_dir(staging)
        .app_version("test-1.0")
}

pub fn manager(
    store: &LocalStore,
    svr: &Arc<MockSecretRecovery>,
    transport: Arc<LocalDirectoryTransport>,
    config: ManagerConfig,
) -> TestManager {
    BackupArchiveManager::new(
        store.connection(),
        store.archivers(),
        store.hooks(),
        Arc::clone(svr),
        transport,
        config,
    )
}
